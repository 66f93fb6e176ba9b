use std::collections::HashSet;
use std::env;
use std::fs;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use cgs_engine::analytics::Counters;
use cgs_engine::config::Config;
use cgs_engine::contact::ContactRecord;
use cgs_engine::contact_plan::ContactPlan;
use cgs_engine::node::Node;
use cgs_engine::scheduling::{Request, Scheduler};
use cgs_engine::sim::Engine;
use cgs_engine::types::{Date, Duration, EndpointID, NodeID, Priority, RequestID, Volume};

/// A self-contained simulation input: the contact plan plus the population
/// and the request stream.
#[derive(Deserialize)]
struct Scenario {
    #[serde(default)]
    config: Config,
    duration: Date,
    scheduler: NodeID,
    /// Endpoint shared by every gateway, the delivery destination.
    endpoint: EndpointID,
    satellites: Vec<NodeID>,
    gateways: Vec<NodeID>,
    targets: Vec<NodeID>,
    contacts: Vec<ContactRecord>,
    requests: Vec<RequestSpec>,
}

#[derive(Deserialize)]
struct RequestSpec {
    target: NodeID,
    size: Volume,
    #[serde(default)]
    priority: Priority,
    lifetime: Duration,
    at: Date,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <scenario.json>", args[0]);
        std::process::exit(1);
    }
    let raw = match fs::read_to_string(&args[1]) {
        Ok(raw) => raw,
        Err(err) => {
            eprintln!("Cannot read {}: {}", args[1], err);
            std::process::exit(1);
        }
    };
    let scenario: Scenario = match serde_json::from_str(&raw) {
        Ok(scenario) => scenario,
        Err(err) => {
            eprintln!("Malformed scenario: {}", err);
            std::process::exit(1);
        }
    };

    let config = scenario.config.clone().sanitized();
    println!("Running {} for {} time units.", args[1], scenario.duration);

    // Build one plan, wire in the management contacts, split off the target
    // view, and hand every node its own copies.
    let mut plan = match ContactPlan::from_records(&scenario.contacts) {
        Ok(plan) => plan,
        Err(err) => {
            eprintln!("Bad contact plan: {}", err);
            std::process::exit(1);
        }
    };
    let gateways: Vec<(NodeID, EndpointID)> = scenario
        .gateways
        .iter()
        .map(|&g| (g, scenario.endpoint))
        .collect();
    if let Err(err) =
        plan.add_virtual_contacts((scenario.scheduler, scenario.scheduler), &gateways, scenario.duration)
    {
        eprintln!("Bad management contacts: {}", err);
        std::process::exit(1);
    }
    let target_set: HashSet<NodeID> = scenario.targets.iter().copied().collect();
    let (routing_plan, target_plan) = plan.partition_targets(&target_set);

    let mut engine = Engine::new(
        &config,
        Counters::new(scenario.duration, config.warmup, config.cooldown),
    );

    let scheduler_node = Node::new(
        scenario.scheduler,
        scenario.scheduler,
        &config,
        routing_plan.clone(),
        target_plan.clone(),
        Some(Scheduler::new(
            config.scheduler_mode,
            scenario.scheduler,
            config.k_routes_per_pair,
        )),
    );
    engine.add_node(scheduler_node);

    for &uid in scenario.satellites.iter().chain(scenario.gateways.iter()) {
        let eid = if scenario.gateways.contains(&uid) {
            scenario.endpoint
        } else {
            uid
        };
        let mut node = Node::new(
            uid,
            eid,
            &config,
            routing_plan.clone(),
            target_plan.clone(),
            None,
        );
        node.build_route_table(&[scenario.endpoint], 0.0, scenario.duration);
        engine.add_node(node);
    }

    for (seq, request) in scenario.requests.iter().enumerate() {
        engine.submit_request(
            scenario.scheduler,
            request.at,
            Request::new(
                RequestID(seq as u64),
                request.target,
                scenario.endpoint,
                request.size,
                request.priority,
                request.lifetime,
                request.at,
            ),
        );
    }

    engine.run_until(scenario.duration);

    let counters = engine.sink();
    println!("*** REQUEST DATA ***");
    println!("{} requests were submitted", counters.requests_submitted);
    println!("{} requests could not be scheduled", counters.requests_failed);
    println!(
        "{} requests were already handled by existing tasks",
        counters.requests_duplicated
    );
    println!("*** TASK DATA ***");
    println!("{} tasks were created", counters.tasks_added);
    println!("{} tasks were rescheduled", counters.tasks_rescheduled);
    println!("{} tasks were unsuccessful", counters.tasks_failed);
    println!("*** BUNDLE DATA ***");
    println!("{} bundles were acquired", counters.bundles_acquired);
    println!("{} bundles were forwarded", counters.bundles_forwarded);
    println!("{} bundles were delivered", counters.bundles_delivered);
    println!("{} bundles were dropped", counters.bundles_dropped);
    if let Some(latency) = counters.delivery_latency_ave() {
        println!("*** PERFORMANCE DATA ***");
        println!("The average bundle delivery latency is {:.2}", latency);
        if let Some(stdev) = counters.delivery_latency_stdev() {
            println!("The bundle delivery latency std. dev. is {:.2}", stdev);
        }
    }
}
