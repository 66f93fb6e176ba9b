use crate::bundle::Bundle;
use crate::contact_plan::ContactPlan;
use crate::route::Route;
use crate::types::{Date, NodeID};

pub mod yen;

pub use yen::cgr_yens;

/// Filters a route list down to the routes a bundle can actually use, and
/// ranks them.
///
/// A route survives when it leaves `self_id`, avoids every excluded node,
/// contains no expired contact, still has the bundle's size available at its
/// bottleneck, and delivers before the bundle's deadline. The returned
/// routes carry the delivery time recomputed for this bundle's size and are
/// sorted by it, earliest first.
///
/// # Parameters
///
/// * `now` - The current time.
/// * `self_id` - The node assigning the bundle.
/// * `plan` - The plan the route hops live in.
/// * `bundle` - The bundle to place.
/// * `routes` - Candidate routes, typically a route table entry.
/// * `excluded_nodes` - Nodes the bundle must not be routed via.
///
/// # Returns
///
/// * `Vec<Route>` - The feasible routes, earliest delivery first.
pub fn candidate_routes(
    now: Date,
    self_id: NodeID,
    plan: &ContactPlan,
    bundle: &Bundle,
    routes: &[Route],
    excluded_nodes: &[NodeID],
) -> Vec<Route> {
    let mut feasible: Vec<Route> = Vec::new();

    for route in routes {
        let leaves_self = route
            .hops
            .first()
            .and_then(|&id| plan.get(id))
            .map(|c| c.tx_node == self_id)
            .unwrap_or(false);
        if !leaves_self {
            continue;
        }
        let via_excluded = route.hops.iter().any(|&id| {
            plan.get(id)
                .map(|c| excluded_nodes.contains(&c.rx_node))
                .unwrap_or(true)
        });
        if via_excluded {
            continue;
        }
        if route.has_expired_hop(plan, now) {
            continue;
        }
        if route.rebottleneck(plan, bundle.priority) < bundle.size {
            continue;
        }
        let delivery = match route.delivery_time(plan, now, bundle.size) {
            Some(t) => t,
            None => continue,
        };
        if delivery > bundle.deadline {
            continue;
        }
        let mut admitted = route.clone();
        admitted.best_delivery_time = delivery;
        feasible.push(admitted);
    }

    feasible.sort_by(|a, b| a.rank(b));
    feasible
}
