use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::analytics::AnalyticsEvent;
use crate::bundle::{Buffer, Bundle, DropReason};
use crate::config::{Config, ReschedulingMode};
use crate::contact_plan::ContactPlan;
use crate::route::Route;
use crate::route_table::RouteTable;
use crate::routing::{candidate_routes, cgr_yens};
use crate::scheduling::{Request, RequestStatus, Scheduler, Task, TaskStatus};
use crate::task_table::TaskTable;
use crate::types::{
    BundleID, ContactID, Date, Duration, EndpointID, NodeID, TIME_EPSILON, TaskID,
};

/// Things a node asks the event loop to do on its behalf after a contact
/// activity ran: messages to put on the wire and the next wake-up of the
/// contact procedure.
pub struct ContactActivity {
    pub sends: Vec<Outbound>,
    /// When to run the contact procedure again; `None` once the contact
    /// closed and its leftovers were reabsorbed.
    pub next_wake: Option<Date>,
}

impl ContactActivity {
    fn closed() -> Self {
        Self {
            sends: Vec::new(),
            next_wake: None,
        }
    }
}

/// A message handed to the event loop for causal delivery.
pub enum Outbound {
    /// A task table snapshot or delta; arrives after the one-way light time.
    TaskTable {
        to: NodeID,
        arrival: Date,
        tasks: Vec<Task>,
    },
    /// A bundle in flight; arrives after transmission plus light time.
    Bundle {
        to: NodeID,
        contact: ContactID,
        arrival: Date,
        bundle: Bundle,
    },
}

/// Outcome of handing a bundle to a node.
pub enum BundleReceipt {
    /// The bundle reached its destination endpoint here.
    Delivered,
    /// Stored for onward assignment.
    Accepted,
    /// The buffer cannot hold it; the sender keeps the bundle.
    Refused(Bundle),
}

/// State of one live peer contact.
struct Session {
    peer: NodeID,
    /// Bundles that did not fit in the remaining window, returned to the
    /// buffer when the contact closes.
    deferred: Vec<Bundle>,
}

/// A network element participating in scheduling, acquisition, routing and
/// delivery.
///
/// Each node owns private copies of the routing and target contact plans and
/// does its own residual-volume bookkeeping on them; consistency across
/// nodes comes from the task-table gossip, not from shared state. All
/// activities are advanced by the event loop, one node at a time.
pub struct Node {
    pub uid: NodeID,
    pub eid: EndpointID,
    pub routing_plan: ContactPlan,
    pub target_plan: ContactPlan,
    pub route_table: RouteTable,
    pub task_table: TaskTable,
    buffer: Buffer,
    outbound_queues: HashMap<NodeID, VecDeque<Bundle>>,
    request_queue: VecDeque<Request>,
    scheduler: Option<Scheduler>,
    sessions: HashMap<ContactID, Session>,
    last_sent: HashMap<NodeID, u64>,
    task_table_dirty: bool,
    drop_list: Vec<(Bundle, DropReason)>,
    delivered_bundles: Vec<Bundle>,
    bundle_seq: u64,
    events: Vec<AnalyticsEvent>,
    msr: bool,
    request_duplication: bool,
    rescheduling: ReschedulingMode,
    k_routes: usize,
    outbound_poll_period: Duration,
}

impl Node {
    /// Builds a node from its plan views.
    ///
    /// A node constructed with a scheduler takes the scheduler-role buffer
    /// capacity and accepts requests; all other role differences follow from
    /// the plans (a node with no target contacts never acquires, a node with
    /// no requests never schedules).
    pub fn new(
        uid: NodeID,
        eid: EndpointID,
        config: &Config,
        routing_plan: ContactPlan,
        target_plan: ContactPlan,
        scheduler: Option<Scheduler>,
    ) -> Self {
        let capacity = if scheduler.is_some() {
            config.scheduler_buffer_capacity
        } else {
            config.node_buffer_capacity
        };
        Self {
            uid,
            eid,
            routing_plan,
            target_plan,
            route_table: RouteTable::new(),
            task_table: TaskTable::new(),
            buffer: Buffer::new(capacity),
            outbound_queues: HashMap::new(),
            request_queue: VecDeque::new(),
            scheduler,
            sessions: HashMap::new(),
            last_sent: HashMap::new(),
            task_table_dirty: false,
            drop_list: Vec::new(),
            delivered_bundles: Vec::new(),
            bundle_seq: 0,
            events: Vec::new(),
            msr: config.msr_enabled,
            request_duplication: config.request_duplication,
            rescheduling: config.rescheduling,
            k_routes: config.k_routes_per_pair.max(1),
            outbound_poll_period: config.outbound_poll_period,
        }
    }

    /// Discovers routes from this node to every destination endpoint and
    /// fills the route table.
    pub fn build_route_table(&mut self, destinations: &[EndpointID], now: Date, end_time: Date) {
        self.route_table.populate(
            self.uid,
            &self.routing_plan,
            destinations,
            now,
            end_time,
            self.k_routes,
        );
    }

    /// Start times of every contact this node transmits on, routing and
    /// target alike, for the event loop to arm.
    pub fn contact_starts(&self) -> Vec<(Date, ContactID)> {
        let mut starts: Vec<(Date, ContactID)> = self
            .routing_plan
            .contacts_from(self.uid)
            .chain(self.target_plan.contacts_from(self.uid))
            .map(|c| (c.start, c.id))
            .collect();
        starts.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        starts
    }

    pub fn task_table_dirty(&self) -> bool {
        self.task_table_dirty
    }

    pub fn drain_events(&mut self) -> Vec<AnalyticsEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn buffered_bundles(&self) -> impl Iterator<Item = &Bundle> {
        self.buffer.iter()
    }

    pub fn drop_list(&self) -> &[(Bundle, DropReason)] {
        &self.drop_list
    }

    pub fn delivered_bundles(&self) -> &[Bundle] {
        &self.delivered_bundles
    }

    pub fn outbound_queued(&self, peer: NodeID) -> usize {
        self.outbound_queues.get(&peer).map_or(0, VecDeque::len)
    }

    /// Places a locally generated bundle straight into the buffer, e.g. for
    /// traffic injected outside the request/task path.
    pub fn store_bundle(&mut self, bundle: Bundle) -> Result<(), crate::error::EngineError> {
        self.buffer.append(bundle)
    }

    fn next_bundle_id(&mut self) -> BundleID {
        let id = BundleID {
            origin: self.uid,
            seq: self.bundle_seq,
        };
        self.bundle_seq += 1;
        id
    }

    // *** REQUEST HANDLING (I.E. SCHEDULING) ***

    /// Accepts a request and immediately runs the scheduling pass over the
    /// queue.
    pub fn request_received(&mut self, request: Request, now: Date) {
        self.events.push(AnalyticsEvent::RequestSubmitted {
            request: request.uid,
            t: now,
        });
        self.request_queue.push_back(request);
        self.process_requests(now);
    }

    fn process_requests(&mut self, now: Date) {
        while let Some(request) = self.request_queue.pop_front() {
            // An existing task may already cover this demand.
            if self.request_duplication {
                if let Some(task_id) = self.task_table.find_servicing(&request) {
                    self.task_table
                        .update(task_id, |task| task.request_ids.push(request.uid));
                    self.task_table_dirty = true;
                    self.events.push(AnalyticsEvent::RequestDuplicated {
                        request: request.uid,
                        task: task_id,
                        t: now,
                    });
                    continue;
                }
            }

            let Some(scheduler) = self.scheduler.as_mut() else {
                warn!(node = self.uid, "request received on a non-scheduler node");
                continue;
            };
            match scheduler.schedule(
                &request,
                now,
                &mut self.routing_plan,
                &mut self.target_plan,
            ) {
                Ok(task) => {
                    self.events.push(AnalyticsEvent::TaskAdded {
                        task: task.uid,
                        request: request.uid,
                        pickup_time: task.pickup_time,
                        t: now,
                    });
                    self.task_table.insert(task);
                    self.task_table_dirty = true;
                }
                Err(err) => {
                    debug!(node = self.uid, request = %request.uid, %err, "request not schedulable");
                    self.events.push(AnalyticsEvent::RequestFailed {
                        request: request.uid,
                        t: now,
                    });
                }
            }
        }
    }

    // *** CONTACT HANDLING ***

    /// Runs the start-of-contact step: target pickup for target contacts,
    /// handshake and service-loop arming for peer contacts.
    pub fn start_contact(&mut self, contact: ContactID, now: Date) -> ContactActivity {
        if self.target_plan.get(contact).is_some() {
            self.target_pickup(contact, now);
            return ContactActivity::closed();
        }
        let Some(c) = self.routing_plan.get(contact) else {
            return ContactActivity::closed();
        };
        let peer = c.rx_node;
        let owlt = c.owlt;
        debug!(node = self.uid, peer, contact, t = now, "contact opened");
        self.sessions.insert(
            contact,
            Session {
                peer,
                deferred: Vec::new(),
            },
        );
        // Handshake: the full task table goes first, whatever the neighbour
        // already knows.
        let tasks = self.task_table.snapshot();
        self.last_sent.insert(peer, self.task_table.revision());
        let sends = if tasks.is_empty() {
            Vec::new()
        } else {
            vec![Outbound::TaskTable {
                to: peer,
                arrival: now + owlt,
                tasks,
            }]
        };
        ContactActivity {
            sends,
            next_wake: Some(now),
        }
    }

    /// One step of the peer-contact procedure: forward the task table if it
    /// changed, else transmit the next queued bundle, else idle until the
    /// next poll. Closing reabsorbs everything that never left.
    pub fn service_contact(&mut self, contact: ContactID, now: Date) -> ContactActivity {
        let Some(c) = self.routing_plan.get(contact) else {
            return self.close_contact(contact, now);
        };
        let (peer, end, owlt, rate) = (c.rx_node, c.end, c.owlt, c.rate);
        if !self.sessions.contains_key(&contact) {
            return ContactActivity::closed();
        }
        if now >= end - TIME_EPSILON {
            return self.close_contact(contact, now);
        }

        // Task table updates take precedence over payload: they may change
        // what the neighbour does with its own contacts.
        let seen = self.last_sent.get(&peer).copied().unwrap_or(0);
        if self.task_table.revision() > seen {
            let tasks = self.task_table.delta_since(seen);
            self.last_sent.insert(peer, self.task_table.revision());
            self.refresh_dirty();
            return ContactActivity {
                sends: vec![Outbound::TaskTable {
                    to: peer,
                    arrival: now + owlt,
                    tasks,
                }],
                next_wake: Some(now),
            };
        }

        if let Some(mut bundle) = self
            .outbound_queues
            .get_mut(&peer)
            .and_then(VecDeque::pop_front)
        {
            let tx_time = bundle.size / rate;
            if now + tx_time <= end {
                bundle.previous_node = Some(self.uid);
                debug!(
                    node = self.uid, peer, bundle = %bundle.id, t = now, tx_time,
                    "bundle transmission started"
                );
                return ContactActivity {
                    sends: vec![Outbound::Bundle {
                        to: peer,
                        contact,
                        arrival: now + tx_time + owlt,
                        bundle,
                    }],
                    next_wake: Some(now + tx_time),
                };
            }
            // Not enough window left for this one; it goes back to the
            // buffer at close rather than immediately, so the assignment
            // pass does not re-queue it onto this same contact.
            if let Some(session) = self.sessions.get_mut(&contact) {
                session.deferred.push(bundle);
            }
            return ContactActivity {
                sends: Vec::new(),
                next_wake: Some(now),
            };
        }

        ContactActivity {
            sends: Vec::new(),
            next_wake: Some((now + self.outbound_poll_period).min(end)),
        }
    }

    fn close_contact(&mut self, contact: ContactID, now: Date) -> ContactActivity {
        let Some(session) = self.sessions.remove(&contact) else {
            return ContactActivity::closed();
        };
        debug!(node = self.uid, peer = session.peer, contact, t = now, "contact closed");
        let mut leftovers = session.deferred;
        if let Some(queue) = self.outbound_queues.get_mut(&session.peer) {
            leftovers.extend(queue.drain(..));
        }
        for bundle in leftovers {
            self.reabsorb(bundle, now);
        }
        ContactActivity::closed()
    }

    /// Returns a bundle that never left (or was refused downstream) to the
    /// buffer, reversing the residual-volume debits of its booked route.
    fn reabsorb(&mut self, mut bundle: Bundle, now: Date) {
        if let Some(hops) = bundle.booked_route.take() {
            self.routing_plan
                .release_route(&hops, bundle.size, bundle.priority);
        }
        if bundle.expired(now) {
            self.drop_bundle(bundle, DropReason::DeadlineExpired, now);
            return;
        }
        if let Err(err) = self.buffer.append(bundle.clone()) {
            warn!(node = self.uid, bundle = %bundle.id, %err, "reabsorption overflow");
            self.drop_bundle(bundle, DropReason::BufferRefused, now);
        }
    }

    /// Synthesises bundles for every task due at this target contact.
    fn target_pickup(&mut self, contact: ContactID, now: Date) {
        let Some(c) = self.target_plan.get(contact) else {
            return;
        };
        let target = c.rx_node;
        let due: Vec<TaskID> = self
            .task_table
            .tasks()
            .filter(|task| {
                task.assignee == self.uid
                    && task.target == target
                    && (task.pickup_time - now).abs() < TIME_EPSILON
                    && matches!(task.status, TaskStatus::Pending | TaskStatus::Rescheduled)
            })
            .map(|task| task.uid)
            .collect();

        for task_id in due {
            let Some(task) = self.task_table.get(task_id).cloned() else {
                continue;
            };
            let bundle = Bundle {
                id: self.next_bundle_id(),
                src: self.uid,
                dst_eid: task.destination,
                target_id: target,
                size: task.size,
                deadline: task.deadline_delivery.min(now + task.lifetime),
                created_at: now,
                priority: task.priority,
                task_id,
                current: self.uid,
                previous_node: None,
                hop_count: 0,
                base_route: task.base_route.clone(),
                booked_route: None,
            };
            let bundle_id = bundle.id;
            if self.buffer.append(bundle).is_err() {
                warn!(node = self.uid, task = %task_id, "buffer full, pickup skipped");
                continue;
            }
            info!(node = self.uid, target, t = now, bundle = %bundle_id, "bundle acquired");
            self.task_table.transition(task_id, TaskStatus::Acquired, now);
            self.task_table_dirty = true;
            self.events.push(AnalyticsEvent::BundleAcquired {
                bundle: bundle_id,
                task: task_id,
                on_node: self.uid,
                t: now,
            });
        }
    }

    /// Receives a task table snapshot or delta from a neighbour.
    pub fn receive_task_table(&mut self, tasks: &[Task], _now: Date) {
        if self.task_table.merge(tasks) {
            self.task_table_dirty = true;
        }
    }

    /// Receives a bundle from a neighbour; detects delivery, refuses on
    /// overflow, stores and counts the hop otherwise.
    pub fn receive_bundle(&mut self, mut bundle: Bundle, from: NodeID, now: Date) -> BundleReceipt {
        if bundle.dst_eid == self.eid {
            info!(node = self.uid, from, bundle = %bundle.id, t = now, "bundle delivered");
            bundle.hop_count += 1;
            self.task_table
                .transition(bundle.task_id, TaskStatus::Delivered, now);
            self.task_table_dirty = true;
            self.events.push(AnalyticsEvent::BundleDelivered {
                bundle: bundle.id,
                task: bundle.task_id,
                on_node: self.uid,
                created_at: bundle.created_at,
                t: now,
            });
            bundle.previous_node = Some(from);
            bundle.current = self.uid;
            self.delivered_bundles.push(bundle);
            return BundleReceipt::Delivered;
        }

        if bundle.size > self.buffer.capacity_remaining() {
            warn!(node = self.uid, from, bundle = %bundle.id, "bundle refused, buffer full");
            return BundleReceipt::Refused(bundle);
        }

        bundle.hop_count += 1;
        bundle.previous_node = Some(from);
        bundle.current = self.uid;
        bundle.booked_route = None;
        debug!(node = self.uid, from, bundle = %bundle.id, t = now, "bundle received");
        self.events.push(AnalyticsEvent::BundleForwarded {
            bundle: bundle.id,
            on_node: self.uid,
            t: now,
        });
        // Fits by the check above.
        let _ = self.buffer.append(bundle);
        BundleReceipt::Accepted
    }

    /// Takes back a bundle the neighbour refused. It waits out the contact
    /// in the deferred list and reenters the buffer at close.
    pub fn retain_refused(&mut self, contact: ContactID, bundle: Bundle, now: Date) {
        match self.sessions.get_mut(&contact) {
            Some(session) => session.deferred.push(bundle),
            None => self.reabsorb(bundle, now),
        }
    }

    /// Aborts a transfer cut off by a contact truncation: the bundle comes
    /// back to the buffer and its debits are reversed.
    pub fn abort_transfer(&mut self, bundle: Bundle, now: Date) {
        warn!(node = self.uid, bundle = %bundle.id, t = now, "transfer aborted mid-flight");
        self.reabsorb(bundle, now);
    }

    // *** ROUTE SELECTION, BUNDLE ENQUEUEING AND RESOURCE CONSIDERATION ***

    /// One bundle-assignment pass: route every buffered bundle onto an
    /// outbound queue, drop what cannot make its deadline any more.
    pub fn bundle_assignment(&mut self, now: Date) {
        self.reschedule_missed_pickups(now);
        self.fail_expired_tasks(now);

        while let Some(bundle) = self.buffer.extract() {
            self.assign_bundle(bundle, now);
        }
    }

    fn assign_bundle(&mut self, mut bundle: Bundle, now: Date) {
        if bundle.expired(now) {
            self.drop_bundle(bundle, DropReason::DeadlineExpired, now);
            return;
        }

        let mut candidates = candidate_routes(
            now,
            self.uid,
            &self.routing_plan,
            &bundle,
            self.route_table.get(bundle.dst_eid),
            &[],
        );

        // A bundle with no way out may still be saved by a fresh search:
        // the cached table can be stale or too shallow.
        let mut rescheduled = false;
        if candidates.is_empty() && self.rescheduling == ReschedulingMode::Any {
            let fresh = cgr_yens(
                self.uid,
                bundle.dst_eid,
                &self.routing_plan,
                now,
                bundle.deadline,
                self.k_routes,
            );
            candidates = candidate_routes(now, self.uid, &self.routing_plan, &bundle, &fresh, &[]);
            if !candidates.is_empty() {
                self.route_table.store(bundle.dst_eid, fresh);
                rescheduled = true;
            }
        }

        let chosen: Option<Route> = match (&bundle.base_route, self.msr) {
            // Moderate Source Routing: stick to the scheduled route while it
            // remains feasible.
            (Some(base), true) => candidates
                .iter()
                .find(|route| &route.hops == base)
                .or_else(|| candidates.first())
                .cloned(),
            _ => candidates.first().cloned(),
        };

        let Some(route) = chosen else {
            self.fail_bundle_route(bundle, now, rescheduled);
            return;
        };

        if self
            .routing_plan
            .book_route(&route.hops, bundle.size, bundle.priority)
            .is_err()
        {
            // Candidate volume was validated a moment ago; losing the race
            // against our own bookkeeping means the route list was stale.
            self.fail_bundle_route(bundle, now, rescheduled);
            return;
        }

        let Some(next_hop) = route.next_node(&self.routing_plan) else {
            self.routing_plan
                .release_route(&route.hops, bundle.size, bundle.priority);
            self.fail_bundle_route(bundle, now, rescheduled);
            return;
        };

        let deviated = bundle
            .base_route
            .as_ref()
            .map(|base| *base != route.hops)
            .unwrap_or(false);
        if deviated {
            self.events.push(AnalyticsEvent::BundleRerouted {
                bundle: bundle.id,
                on_node: self.uid,
                t: now,
            });
            if self.msr {
                bundle.base_route = Some(route.hops.clone());
            }
        }
        if rescheduled {
            self.note_task_rescheduled(bundle.task_id, now);
        }

        bundle.booked_route = Some(route.hops.clone());
        debug!(
            node = self.uid, bundle = %bundle.id, next_hop, t = now,
            delivery = route.best_delivery_time, "bundle assigned"
        );
        self.outbound_queues
            .entry(next_hop)
            .or_default()
            .push_back(bundle);
    }

    fn fail_bundle_route(&mut self, bundle: Bundle, now: Date, rescheduled: bool) {
        if rescheduled {
            self.note_task_rescheduled(bundle.task_id, now);
        }
        self.drop_bundle(bundle, DropReason::NoFeasibleRoute, now);
    }

    fn note_task_rescheduled(&mut self, task_id: TaskID, now: Date) {
        if self.task_table.transition(task_id, TaskStatus::Rescheduled, now) {
            self.task_table_dirty = true;
            self.events.push(AnalyticsEvent::TaskRescheduled {
                task: task_id,
                t: now,
                by_node: self.uid,
            });
        }
    }

    fn drop_bundle(&mut self, bundle: Bundle, reason: DropReason, now: Date) {
        warn!(node = self.uid, bundle = %bundle.id, ?reason, t = now, "bundle dropped");
        self.events.push(AnalyticsEvent::BundleDropped {
            bundle: bundle.id,
            task: bundle.task_id,
            on_node: self.uid,
            reason,
            t: now,
        });
        if self.task_table.transition(bundle.task_id, TaskStatus::Failed, now) {
            self.task_table_dirty = true;
            self.events.push(AnalyticsEvent::TaskFailed {
                task: bundle.task_id,
                t: now,
                on_node: self.uid,
            });
        }
        self.drop_list.push((bundle, reason));
    }

    /// Re-places tasks whose pickup contact came and went without producing
    /// a bundle. Only this node's own assignments are touched.
    fn reschedule_missed_pickups(&mut self, now: Date) {
        if self.rescheduling == ReschedulingMode::Off {
            return;
        }
        for task_id in self.task_table.missed_pickups(self.uid, now) {
            self.note_task_rescheduled(task_id, now);
            let Some(task) = self.task_table.get(task_id).cloned() else {
                continue;
            };
            let Some(scheduler) = self.scheduler.as_mut() else {
                continue;
            };
            // Re-run the scheduler over the remaining horizon with a probe
            // request carrying the task's demand.
            let probe = Request {
                uid: task.request_ids[0],
                target_id: task.target,
                destination: task.destination,
                size: task.size,
                priority: task.priority,
                lifetime: task.lifetime,
                time_created: now,
                deadline: task.deadline_delivery,
                status: RequestStatus::Accepted,
            };
            match scheduler.schedule(&probe, now, &mut self.routing_plan, &mut self.target_plan) {
                Ok(placement) => {
                    info!(node = self.uid, task = %task_id, pickup = placement.pickup_time,
                        "task re-placed after missed pickup");
                    self.task_table.update(task_id, |t| {
                        t.pickup_time = placement.pickup_time;
                        t.assignee = placement.assignee;
                        t.deadline_acquisition = placement.deadline_acquisition;
                        t.base_route = placement.base_route.clone();
                        t.updated_at = now;
                    });
                    self.task_table_dirty = true;
                }
                Err(err) => {
                    debug!(node = self.uid, task = %task_id, %err, "re-placement failed");
                }
            }
        }
    }

    /// Marks this node's unfinished assignments as failed once their
    /// delivery deadline passed. The deadline is the ultimate guard: any
    /// further handling of these tasks short-circuits.
    fn fail_expired_tasks(&mut self, now: Date) {
        let expired: Vec<TaskID> = self
            .task_table
            .tasks()
            .filter(|task| {
                task.assignee == self.uid
                    && matches!(task.status, TaskStatus::Pending | TaskStatus::Rescheduled)
                    && task.expired(now)
            })
            .map(|task| task.uid)
            .collect();
        for task_id in expired {
            if self.task_table.transition(task_id, TaskStatus::Failed, now) {
                self.task_table_dirty = true;
                self.events.push(AnalyticsEvent::TaskFailed {
                    task: task_id,
                    t: now,
                    on_node: self.uid,
                });
            }
        }
    }

    /// Clears the dirty flag once every neighbour in contact has seen the
    /// current revision.
    fn refresh_dirty(&mut self) {
        let revision = self.task_table.revision();
        let behind = self.sessions.values().any(|session| {
            self.last_sent
                .get(&session.peer)
                .copied()
                .unwrap_or(0)
                < revision
        });
        if !behind {
            self.task_table_dirty = false;
        }
    }
}
