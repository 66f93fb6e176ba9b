//! End-to-end scenarios driving the full engine: scheduling, gossip,
//! acquisition, forwarding, rerouting and failure handling.

use std::collections::HashSet;

use cgs_engine::analytics::{AnalyticsEvent, Counters};
use cgs_engine::bundle::{Bundle, DropReason};
use cgs_engine::config::Config;
use cgs_engine::contact::ContactRecord;
use cgs_engine::contact_plan::ContactPlan;
use cgs_engine::node::Node;
use cgs_engine::routing::cgr_yens;
use cgs_engine::scheduling::{Request, Scheduler, SchedulerMode, Task, TaskStatus};
use cgs_engine::sim::Engine;
use cgs_engine::types::{BundleID, EndpointID, NodeID, RequestID, TaskID};

const DEST: EndpointID = 999;

fn split(records: &[ContactRecord], targets: &[NodeID]) -> (ContactPlan, ContactPlan) {
    let set: HashSet<NodeID> = targets.iter().copied().collect();
    ContactPlan::from_records(records)
        .unwrap()
        .partition_targets(&set)
}

fn seeded_bundle(dst: EndpointID, size: f64, deadline: f64) -> Bundle {
    Bundle {
        id: BundleID { origin: 1, seq: 0 },
        src: 1,
        dst_eid: dst,
        target_id: 1,
        size,
        deadline,
        created_at: 0.0,
        priority: 0,
        task_id: TaskID { origin: 0, seq: 0 },
        current: 1,
        previous_node: None,
        hop_count: 0,
        base_route: None,
        booked_route: None,
    }
}

fn relay(uid: NodeID, eid: EndpointID, config: &Config, plans: &(ContactPlan, ContactPlan)) -> Node {
    let mut node = Node::new(uid, eid, config, plans.0.clone(), plans.1.clone(), None);
    node.build_route_table(&[DEST], 0.0, f64::MAX);
    node
}

/// Single-hop delivery: a request against the node's own target contact,
/// acquired at t=0 and delivered over A->B by t=1.
#[test_log::test]
fn s1_single_hop_delivery() {
    let config = Config::default();
    let plans = split(
        &[
            ContactRecord::new(1, 2, 0.0, 10.0, 1.0).with_rx_eid(DEST),
            ContactRecord::new(1, 1, 0.0, 1.0, f64::MAX),
        ],
        &[1],
    );

    let mut engine = Engine::new(&config, Counters::unbounded());
    let mut acquirer = Node::new(
        1,
        1,
        &config,
        plans.0.clone(),
        plans.1.clone(),
        Some(Scheduler::new(SchedulerMode::CgrResource, 1, 3)),
    );
    acquirer.build_route_table(&[DEST], 0.0, f64::MAX);
    engine.add_node(acquirer);
    engine.add_node(Node::new(2, DEST, &config, plans.0.clone(), plans.1.clone(), None));

    engine.submit_request(1, 0.0, Request::new(RequestID(1), 1, DEST, 1.0, 0, 20.0, 0.0));
    engine.run_until(30.0);

    let scheduler_node = engine.node(1).unwrap();
    let task: &Task = scheduler_node.task_table.tasks().next().unwrap();
    assert_eq!(task.pickup_time, 0.0);
    assert_eq!(task.assignee, 1);

    let counters = engine.sink();
    assert_eq!(counters.tasks_added, 1);
    assert_eq!(counters.bundles_acquired, 1);
    assert_eq!(counters.bundles_delivered, 1);
    assert_eq!(counters.bundles_dropped, 0);
    assert!(counters.log.iter().any(|e| matches!(
        e,
        AnalyticsEvent::BundleDelivered { t, .. } if *t == 1.0
    )));

    // The receiver learned of the delivery through its own local update.
    let delivered_on = engine.node(2).unwrap();
    assert_eq!(
        delivered_on.task_table.get(task.uid).unwrap().status,
        TaskStatus::Delivered
    );
}

/// Re-route on failure: the primary A->B->D route dies when its middle
/// contact is truncated; assignment deviates onto A->C->D and the bundle
/// arrives at t=7 with exactly one reroute.
#[test_log::test]
fn s2_reroute_on_link_failure() {
    let config = Config {
        msr_enabled: true,
        ..Config::default()
    };
    let plans = split(
        &[
            ContactRecord::new(1, 2, 0.0, 5.0, 1.0),
            ContactRecord::new(2, 4, 2.0, 3.0, 1.0),
            ContactRecord::new(1, 3, 0.0, 5.0, 1.0),
            ContactRecord::new(3, 4, 6.0, 10.0, 1.0),
        ],
        &[],
    );

    let mut engine = Engine::new(&config, Counters::unbounded());
    for uid in [1, 2, 3] {
        let mut node = Node::new(uid, uid, &config, plans.0.clone(), plans.1.clone(), None);
        node.build_route_table(&[4], 0.0, f64::MAX);
        engine.add_node(node);
    }
    engine.add_node(Node::new(4, 4, &config, plans.0.clone(), plans.1.clone(), None));

    let mut bundle = seeded_bundle(4, 1.0, 10.0);
    bundle.base_route = Some(vec![0, 1]);
    engine.node_mut(1).unwrap().store_bundle(bundle).unwrap();

    // The B->D window collapses before the bundle ever leaves A.
    engine.truncate_contact(1, 1, 2.0);
    engine.run_until(20.0);

    let counters = engine.sink();
    assert_eq!(counters.bundles_delivered, 1);
    assert_eq!(counters.bundles_rerouted, 1);
    assert_eq!(counters.bundles_dropped, 0);
    assert!(counters.log.iter().any(|e| matches!(
        e,
        AnalyticsEvent::BundleDelivered { t, .. } if *t == 7.0
    )));
}

/// Drop on deadline: five units against a four-unit contact can never
/// traverse, so the assignment pass gives up on the bundle.
#[test_log::test]
fn s3_drop_when_no_contact_fits() {
    let config = Config::default();
    let plans = split(&[ContactRecord::new(1, 2, 0.0, 4.0, 1.0)], &[]);

    let mut engine = Engine::new(&config, Counters::unbounded());
    let mut sender = Node::new(1, 1, &config, plans.0.clone(), plans.1.clone(), None);
    sender.build_route_table(&[2], 0.0, f64::MAX);
    sender.store_bundle(seeded_bundle(2, 5.0, 6.0)).unwrap();
    engine.add_node(sender);
    engine.add_node(Node::new(2, 2, &config, plans.0.clone(), plans.1.clone(), None));

    engine.run_until(10.0);

    let counters = engine.sink();
    assert_eq!(counters.bundles_delivered, 0);
    assert_eq!(counters.bundles_dropped, 1);
    let drops = engine.node(1).unwrap().drop_list();
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].1, DropReason::NoFeasibleRoute);
}

/// Request duplication: two equivalent requests back to back yield one task
/// carrying both request ids.
#[test_log::test]
fn s4_request_duplication() {
    let config = Config {
        request_duplication: true,
        ..Config::default()
    };
    let plans = split(
        &[
            ContactRecord::new(10, 20, 8.0, 12.0, 1.0).with_rx_eid(DEST),
            ContactRecord::new(10, 30, 5.0, 6.0, 10.0),
        ],
        &[30],
    );

    let mut engine = Engine::new(&config, Counters::unbounded());
    engine.add_node(Node::new(
        0,
        0,
        &config,
        plans.0.clone(),
        plans.1.clone(),
        Some(Scheduler::new(SchedulerMode::CgrResource, 0, 3)),
    ));

    engine.submit_request(0, 0.0, Request::new(RequestID(1), 30, DEST, 1.0, 0, 20.0, 0.0));
    engine.submit_request(0, 0.0, Request::new(RequestID(2), 30, DEST, 1.0, 0, 20.0, 0.0));
    engine.run_until(1.0);

    let counters = engine.sink();
    assert_eq!(counters.tasks_added, 1);
    assert_eq!(counters.requests_duplicated, 1);

    let table = &engine.node(0).unwrap().task_table;
    assert_eq!(table.len(), 1);
    let task = table.tasks().next().unwrap();
    assert_eq!(task.request_ids, vec![RequestID(1), RequestID(2)]);
}

/// Task-table merge: dominance by update time, with `delivered` absorbing
/// even against newer records.
#[test_log::test]
fn s5_task_table_merge() {
    let config = Config::default();
    let plans = split(&[], &[]);
    let mut node = Node::new(5, 5, &config, plans.0, plans.1, None);

    let base = Task {
        uid: TaskID { origin: 0, seq: 1 },
        target: 30,
        pickup_time: 5.0,
        assignee: 10,
        destination: DEST,
        size: 1.0,
        priority: 0,
        lifetime: 25.0,
        deadline_acquisition: 6.0,
        deadline_delivery: 30.0,
        request_ids: vec![RequestID(1)],
        status: TaskStatus::Pending,
        updated_at: 10.0,
        base_route: None,
    };
    node.task_table.insert(base.clone());

    let mut acquired = base.clone();
    acquired.status = TaskStatus::Acquired;
    acquired.updated_at = 12.0;
    let mut rescheduled = base.clone();
    rescheduled.status = TaskStatus::Rescheduled;
    rescheduled.updated_at = 15.0;
    node.receive_task_table(&[acquired, rescheduled], 16.0);

    assert_eq!(
        node.task_table.get(base.uid).unwrap().status,
        TaskStatus::Rescheduled
    );
    assert_eq!(node.task_table.get(base.uid).unwrap().updated_at, 15.0);
    assert!(node.task_table_dirty());

    let mut delivered = base.clone();
    delivered.status = TaskStatus::Delivered;
    delivered.updated_at = 14.0;
    node.receive_task_table(&[delivered], 17.0);
    assert_eq!(
        node.task_table.get(base.uid).unwrap().status,
        TaskStatus::Delivered
    );
}

/// Yen's k=2 on the diamond returns exactly the two distinct routes.
#[test_log::test]
fn s6_yens_k_on_diamond() {
    let plan = ContactPlan::from_records(&[
        ContactRecord::new(1, 2, 0.0, 10.0, 1.0),
        ContactRecord::new(2, 4, 0.0, 10.0, 1.0),
        ContactRecord::new(1, 3, 0.0, 10.0, 1.0),
        ContactRecord::new(3, 4, 0.0, 10.0, 1.0),
    ])
    .unwrap();
    let routes = cgr_yens(1, 4, &plan, 0.0, f64::MAX, 2);
    assert_eq!(routes.len(), 2);
    assert_ne!(routes[0].hops, routes[1].hops);
    assert!(routes[0].best_delivery_time <= routes[1].best_delivery_time);
}

/// The full centralised pipeline: request to the operations centre, task
/// gossip over the management and uplink contacts, pickup on the satellite,
/// downlink delivery, and the delivery report flowing back to the centre.
#[test_log::test]
fn centralised_pipeline_delivers_and_reports() {
    let config = Config::default();
    let plans = split(
        &[
            ContactRecord::new(0, 20, 0.0, 100.0, f64::MAX).with_rx_eid(DEST),
            ContactRecord::new(20, 0, 0.0, 100.0, f64::MAX),
            ContactRecord::new(20, 10, 1.0, 2.0, 1.0),
            ContactRecord::new(10, 20, 8.0, 12.0, 1.0).with_rx_eid(DEST),
            ContactRecord::new(10, 30, 5.0, 6.0, 10.0),
        ],
        &[30],
    );

    let mut engine = Engine::new(&config, Counters::unbounded());
    engine.add_node(Node::new(
        0,
        0,
        &config,
        plans.0.clone(),
        plans.1.clone(),
        Some(Scheduler::new(SchedulerMode::CgrResource, 0, 3)),
    ));
    engine.add_node(relay(10, 10, &config, &plans));
    engine.add_node(Node::new(20, DEST, &config, plans.0.clone(), plans.1.clone(), None));

    engine.submit_request(0, 0.0, Request::new(RequestID(1), 30, DEST, 1.0, 0, 20.0, 0.0));
    engine.run_until(30.0);

    let counters = engine.sink();
    assert_eq!(counters.tasks_added, 1);
    assert_eq!(counters.requests_failed, 0);
    assert_eq!(counters.bundles_acquired, 1);
    assert_eq!(counters.bundles_delivered, 1);
    assert_eq!(counters.bundles_dropped, 0);
    assert!(counters.log.iter().any(|e| matches!(
        e,
        AnalyticsEvent::BundleDelivered { t, .. } if *t == 9.0
    )));

    // Delivery reports reach the operations centre over the management
    // contact, closing the loop without any explicit acknowledgement.
    let moc = engine.node(0).unwrap();
    let task = moc.task_table.tasks().next().unwrap();
    assert_eq!(task.status, TaskStatus::Delivered);
    assert_eq!(task.assignee, 10);
    assert_eq!(task.pickup_time, 5.0);
}

/// A refused bundle stays with its sender until the contact closes, comes
/// back to the buffer with its volume debits reversed, and is dropped once
/// no onward contact remains.
#[test_log::test]
fn refused_bundle_returns_to_sender_and_volume_is_conserved() {
    let config = Config::default();
    let tight = Config {
        node_buffer_capacity: 0.5,
        ..Config::default()
    };
    let plans = split(
        &[
            ContactRecord::new(1, 2, 0.0, 4.0, 1.0),
            ContactRecord::new(2, 3, 5.0, 9.0, 1.0).with_rx_eid(DEST),
        ],
        &[],
    );

    let mut engine = Engine::new(&config, Counters::unbounded());
    let mut sender = Node::new(1, 1, &config, plans.0.clone(), plans.1.clone(), None);
    sender.build_route_table(&[DEST], 0.0, f64::MAX);
    sender.store_bundle(seeded_bundle(DEST, 1.0, 8.5)).unwrap();
    engine.add_node(sender);
    // The relay cannot hold a one-unit bundle.
    engine.add_node(Node::new(2, 2, &tight, plans.0.clone(), plans.1.clone(), None));
    engine.add_node(Node::new(3, DEST, &config, plans.0.clone(), plans.1.clone(), None));

    engine.run_until(12.0);

    let counters = engine.sink();
    assert_eq!(counters.bundles_forwarded, 0);
    assert_eq!(counters.bundles_delivered, 0);
    assert_eq!(counters.bundles_dropped, 1);

    // Every debit along the abandoned route was reversed.
    let sender = engine.node(1).unwrap();
    assert_eq!(sender.drop_list().len(), 1);
    assert_eq!(sender.routing_plan.get(0).unwrap().residual_volume, 4.0);
    assert_eq!(sender.routing_plan.get(1).unwrap().residual_volume, 4.0);
}
