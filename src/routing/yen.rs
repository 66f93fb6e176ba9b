use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::contact::Contact;
use crate::contact_plan::ContactPlan;
use crate::route::Route;
use crate::types::{ContactID, Date, EndpointID, HopCount, NodeID};

/// A frontier entry of the contact-graph Dijkstra search.
///
/// Entries order by accumulated cost, then first-byte arrival time, then hop
/// count, then contact id, so that with the default zero transmission cost
/// the search degenerates to earliest-arrival routing with deterministic
/// tie-breaks.
struct FrontierEntry {
    cost: f64,
    arrival: Date,
    hops: HopCount,
    contact: ContactID,
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.cost > other.cost {
            return Ordering::Greater;
        }
        if self.cost < other.cost {
            return Ordering::Less;
        }
        if self.arrival > other.arrival {
            return Ordering::Greater;
        }
        if self.arrival < other.arrival {
            return Ordering::Less;
        }
        if self.hops > other.hops {
            return Ordering::Greater;
        }
        if self.hops < other.hops {
            return Ordering::Less;
        }
        self.contact.cmp(&other.contact)
    }
}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for FrontierEntry {}

/// Per-search suppression state, rebuilt for every spur search of the Yen
/// loop. Suppressed elements keep their bookings but are invisible to the
/// relaxation.
#[derive(Default)]
struct Suppression {
    contacts: HashSet<ContactID>,
    nodes: HashSet<NodeID>,
}

impl Suppression {
    fn admits(&self, contact: &Contact) -> bool {
        !contact.suppressed
            && !self.contacts.contains(&contact.id)
            && !self.nodes.contains(&contact.rx_node)
    }
}

/// Dijkstra relaxation over the contact graph.
///
/// A contact is reachable from a frontier `(node, arrival)` when it leaves
/// that node, is not suppressed, starts before `end_time`, and its window
/// admits a first byte sent at the frontier arrival. Reaching the receiver
/// costs `max(arrival, start) + owlt`.
///
/// # Parameters
///
/// * `plan` - The contact plan to search.
/// * `source` - The node the path must leave from.
/// * `dest_eid` - The endpoint to reach; the first popped contact whose
///   receiver belongs to it terminates the search.
/// * `now` - Path-entry time at the source.
/// * `end_time` - Horizon; contacts starting at or after it are pruned.
/// * `suppression` - Contacts and nodes excluded from this search.
///
/// # Returns
///
/// * `Option<Vec<ContactID>>` - The hop sequence of the earliest-arrival
///   path, or `None` when the endpoint is unreachable.
fn shortest_path(
    plan: &ContactPlan,
    source: NodeID,
    dest_eid: EndpointID,
    now: Date,
    end_time: Date,
    suppression: &Suppression,
) -> Option<Vec<ContactID>> {
    // Best known (cost, arrival, hops) label per contact.
    let mut labels: HashMap<ContactID, (f64, Date, HopCount)> = HashMap::new();
    let mut predecessor: HashMap<ContactID, ContactID> = HashMap::new();
    let mut frontier: BinaryHeap<Reverse<FrontierEntry>> = BinaryHeap::new();

    for contact in plan.contacts_from(source) {
        if !suppression.admits(contact) || contact.start >= end_time {
            continue;
        }
        if !contact.reachable_at(now) {
            continue;
        }
        let arrival = contact.first_byte_arrival(now);
        let label = (contact.cost, arrival, 1);
        if improves(&labels, contact.id, label) {
            labels.insert(contact.id, label);
            frontier.push(Reverse(FrontierEntry {
                cost: contact.cost,
                arrival,
                hops: 1,
                contact: contact.id,
            }));
        }
    }

    while let Some(Reverse(entry)) = frontier.pop() {
        let label = labels[&entry.contact];
        // Lazily dropped stale heap entry.
        if (entry.cost, entry.arrival, entry.hops) != label {
            continue;
        }
        let contact = plan.get(entry.contact)?;
        if contact.rx_eid == dest_eid {
            return Some(reconstruct(&predecessor, entry.contact));
        }

        for next in plan.contacts_from(contact.rx_node) {
            if !suppression.admits(next) || next.start >= end_time {
                continue;
            }
            if !next.reachable_at(entry.arrival) {
                continue;
            }
            let proposal = (
                entry.cost + next.cost,
                next.first_byte_arrival(entry.arrival),
                entry.hops + 1,
            );
            if improves(&labels, next.id, proposal) {
                labels.insert(next.id, proposal);
                predecessor.insert(next.id, entry.contact);
                frontier.push(Reverse(FrontierEntry {
                    cost: proposal.0,
                    arrival: proposal.1,
                    hops: proposal.2,
                    contact: next.id,
                }));
            }
        }
    }

    None
}

#[inline]
fn improves(
    labels: &HashMap<ContactID, (f64, Date, HopCount)>,
    contact: ContactID,
    proposal: (f64, Date, HopCount),
) -> bool {
    match labels.get(&contact) {
        Some(&(cost, arrival, hops)) => {
            proposal.0 < cost
                || (proposal.0 == cost && proposal.1 < arrival)
                || (proposal.0 == cost && proposal.1 == arrival && proposal.2 < hops)
        }
        None => true,
    }
}

fn reconstruct(predecessor: &HashMap<ContactID, ContactID>, terminal: ContactID) -> Vec<ContactID> {
    let mut hops = vec![terminal];
    let mut current = terminal;
    while let Some(&previous) = predecessor.get(&current) {
        hops.push(previous);
        current = previous;
    }
    hops.reverse();
    hops
}

/// A route wrapped with the search ranking, for the candidate heap.
struct RankedRoute(Route);

impl Ord for RankedRoute {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.rank(&other.0)
    }
}
impl PartialOrd for RankedRoute {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for RankedRoute {
    fn eq(&self, other: &Self) -> bool {
        self.0.rank(&other.0) == Ordering::Equal
    }
}
impl Eq for RankedRoute {}

/// Yen's k-shortest route search over the contact graph.
///
/// The first route comes from a plain contact-graph Dijkstra; each further
/// route is the best deviation obtained by re-running the search from every
/// spur of the previously admitted route, with the shared prefixes and the
/// already-visited nodes suppressed to force the deviation.
///
/// # Parameters
///
/// * `source` - The node routes must leave from.
/// * `dest_eid` - The endpoint to reach.
/// * `plan` - The contact plan to search.
/// * `now` - Path-entry time at the source.
/// * `end_time` - Horizon; contacts starting at or after it are pruned.
/// * `k` - Maximum number of routes to return.
///
/// # Returns
///
/// * `Vec<Route>` - Up to `k` distinct routes ordered by earliest delivery,
///   then fewest hops, then lexicographic hop ids. Empty when the endpoint
///   is unreachable.
pub fn cgr_yens(
    source: NodeID,
    dest_eid: EndpointID,
    plan: &ContactPlan,
    now: Date,
    end_time: Date,
    k: usize,
) -> Vec<Route> {
    let mut routes: Vec<Route> = Vec::new();
    let mut candidates: BinaryHeap<Reverse<RankedRoute>> = BinaryHeap::new();
    let mut seen: HashSet<Vec<ContactID>> = HashSet::new();

    let first = match shortest_path(plan, source, dest_eid, now, end_time, &Suppression::default())
    {
        Some(hops) => hops,
        None => return routes,
    };
    if let Some(route) = Route::from_hops(plan, first, now) {
        seen.insert(route.hops.clone());
        routes.push(route);
    } else {
        return routes;
    }

    while routes.len() < k {
        let previous = match routes.last() {
            Some(route) => route.hops.clone(),
            None => break,
        };

        for spur_index in 0..previous.len() {
            let root = &previous[..spur_index];
            let (spur_node, spur_entry) = match walk_prefix(plan, source, root, now) {
                Some(state) => state,
                None => break,
            };

            let mut suppression = Suppression::default();
            // Deviations must not reproduce a known continuation of this
            // prefix, nor revisit a node the prefix already crossed.
            for known in &routes {
                if known.hops.len() > spur_index && known.hops[..spur_index] == *root {
                    suppression.contacts.insert(known.hops[spur_index]);
                }
            }
            let mut visited = source;
            suppression.nodes.insert(visited);
            for &hop in root {
                if let Some(contact) = plan.get(hop) {
                    visited = contact.rx_node;
                    suppression.nodes.insert(visited);
                }
            }
            suppression.nodes.remove(&spur_node);

            if let Some(spur_hops) =
                shortest_path(plan, spur_node, dest_eid, spur_entry, end_time, &suppression)
            {
                let mut total = root.to_vec();
                total.extend(spur_hops);
                if seen.contains(&total) {
                    continue;
                }
                if let Some(route) = Route::from_hops(plan, total, now) {
                    seen.insert(route.hops.clone());
                    candidates.push(Reverse(RankedRoute(route)));
                }
            }
        }

        match candidates.pop() {
            Some(Reverse(RankedRoute(route))) => routes.push(route),
            None => break,
        }
    }

    routes
}

/// Forward-simulates the shared prefix of a deviation, returning the spur
/// node and the time the path reaches it.
fn walk_prefix(
    plan: &ContactPlan,
    source: NodeID,
    root: &[ContactID],
    now: Date,
) -> Option<(NodeID, Date)> {
    let mut node = source;
    let mut at_time = now;
    for &hop in root {
        let contact = plan.get(hop)?;
        if !contact.reachable_at(at_time) {
            return None;
        }
        at_time = contact.first_byte_arrival(at_time);
        node = contact.rx_node;
    }
    Some((node, at_time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::ContactRecord;

    // A diamond: 1 -> 2 -> 4 and 1 -> 3 -> 4, equal costs.
    fn diamond() -> ContactPlan {
        ContactPlan::from_records(&[
            ContactRecord::new(1, 2, 0.0, 10.0, 1.0),
            ContactRecord::new(2, 4, 0.0, 10.0, 1.0),
            ContactRecord::new(1, 3, 0.0, 10.0, 1.0),
            ContactRecord::new(3, 4, 0.0, 10.0, 1.0),
        ])
        .unwrap()
    }

    #[test]
    fn yens_k2_on_diamond_returns_two_distinct_routes() {
        let plan = diamond();
        let routes = cgr_yens(1, 4, &plan, 0.0, f64::MAX, 2);
        assert_eq!(routes.len(), 2);
        assert_ne!(routes[0].hops, routes[1].hops);
        assert!(routes[0].rank(&routes[1]) != Ordering::Greater);
        for route in &routes {
            assert_eq!(route.to_eid, 4);
            assert_eq!(route.hop_count(), 2);
        }
    }

    #[test]
    fn unreachable_destination_yields_empty() {
        let plan = diamond();
        assert!(cgr_yens(1, 99, &plan, 0.0, f64::MAX, 3).is_empty());
    }

    #[test]
    fn search_respects_entry_time() {
        let plan = ContactPlan::from_records(&[
            ContactRecord::new(1, 2, 0.0, 2.0, 1.0),
            ContactRecord::new(1, 2, 5.0, 8.0, 1.0),
            ContactRecord::new(2, 3, 6.0, 9.0, 1.0),
        ])
        .unwrap();
        // At t=3 the first contact is gone; the path must wait for the
        // second window.
        let routes = cgr_yens(1, 3, &plan, 3.0, f64::MAX, 1);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].hops, vec![1, 2]);
        assert_eq!(routes[0].best_delivery_time, 6.0);
    }

    #[test]
    fn end_time_prunes_late_contacts() {
        let plan = ContactPlan::from_records(&[
            ContactRecord::new(1, 2, 0.0, 2.0, 1.0),
            ContactRecord::new(2, 3, 5.0, 9.0, 1.0),
        ])
        .unwrap();
        assert!(cgr_yens(1, 3, &plan, 0.0, 5.0, 1).is_empty());
        assert_eq!(cgr_yens(1, 3, &plan, 0.0, 6.0, 1).len(), 1);
    }

    #[test]
    fn earliest_arrival_wins_over_fewer_contacts() {
        // Direct contact opens late; the relayed path arrives earlier.
        let plan = ContactPlan::from_records(&[
            ContactRecord::new(1, 4, 8.0, 10.0, 1.0),
            ContactRecord::new(1, 2, 0.0, 10.0, 1.0),
            ContactRecord::new(2, 4, 1.0, 10.0, 1.0),
        ])
        .unwrap();
        let routes = cgr_yens(1, 4, &plan, 0.0, f64::MAX, 2);
        assert_eq!(routes[0].hops, vec![1, 2]);
        assert_eq!(routes[0].best_delivery_time, 1.0);
        assert_eq!(routes[1].hops, vec![0]);
    }

    #[test]
    fn route_arrival_matches_forward_simulation() {
        let plan = ContactPlan::from_records(&[
            ContactRecord::new(1, 2, 1.0, 4.0, 1.0).with_owlt(0.5),
            ContactRecord::new(2, 3, 3.0, 8.0, 1.0).with_owlt(0.25),
        ])
        .unwrap();
        let routes = cgr_yens(1, 3, &plan, 0.0, f64::MAX, 1);
        let route = &routes[0];
        // Forward simulation: enter hop 0 at max(0, 1) + 0.5 = 1.5, enter
        // hop 1 at max(1.5, 3) + 0.25 = 3.25.
        assert_eq!(route.best_delivery_time, 3.25);
    }

    #[test]
    fn suppressed_contacts_are_invisible() {
        let mut plan = diamond();
        plan.get_mut(0).unwrap().suppressed = true;
        let routes = cgr_yens(1, 4, &plan, 0.0, f64::MAX, 2);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].hops, vec![2, 3]);
    }
}
