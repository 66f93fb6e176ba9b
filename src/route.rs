use std::cmp::Ordering;

use crate::contact_plan::ContactPlan;
use crate::types::{ContactID, Date, EndpointID, HopCount, NodeID, Priority, Volume};

/// A sequence of contacts leading from a source node to an endpoint.
///
/// Routes are immutable once constructed: staleness is handled by re-running
/// the search, never by mutating a stored route. The stored
/// `best_delivery_time` is the forward-simulated first-byte arrival at the
/// terminal; per-bundle feasibility recomputes arrival with the actual bundle
/// size through [`Route::delivery_time`].
#[derive(Clone, Debug)]
pub struct Route {
    /// The contacts traversed, in order. The first hop leaves the source.
    pub hops: Vec<ContactID>,
    /// The endpoint this route leads to.
    pub to_eid: EndpointID,
    /// Forward-simulated arrival time at the terminal from the search entry
    /// time.
    pub best_delivery_time: Date,
    /// Bottleneck residual volume across the hops at construction time.
    pub volume: Volume,
}

impl Route {
    /// Builds a route from a hop sequence, forward-simulating arrival times
    /// from `entry_time`.
    ///
    /// # Parameters
    ///
    /// * `plan` - The plan owning the hops.
    /// * `hops` - The contact ids along the path, source first.
    /// * `entry_time` - The time the path becomes available at the source.
    ///
    /// # Returns
    ///
    /// * `Option<Route>` - The route, or `None` when a hop is unknown, the
    ///   sequence is not contiguous, or some window closes before the path
    ///   reaches it.
    pub fn from_hops(plan: &ContactPlan, hops: Vec<ContactID>, entry_time: Date) -> Option<Route> {
        if hops.is_empty() {
            return None;
        }
        let mut at_time = entry_time;
        let mut previous_rx = None;
        let mut to_eid = 0;
        for &id in &hops {
            let contact = plan.get(id)?;
            if let Some(previous) = previous_rx {
                if contact.tx_node != previous {
                    return None;
                }
            }
            if !contact.reachable_at(at_time) {
                return None;
            }
            at_time = contact.first_byte_arrival(at_time);
            previous_rx = Some(contact.rx_node);
            to_eid = contact.rx_eid;
        }
        let volume = plan.bottleneck(&hops, 0);
        Some(Route {
            hops,
            to_eid,
            best_delivery_time: at_time,
            volume,
        })
    }

    /// Number of hops on the route.
    #[inline(always)]
    pub fn hop_count(&self) -> HopCount {
        self.hops.len() as HopCount
    }

    /// Recomputes the bottleneck residual volume against the current plan
    /// state for a priority class.
    pub fn rebottleneck(&self, plan: &ContactPlan, priority: Priority) -> Volume {
        plan.bottleneck(&self.hops, priority)
    }

    /// Forward-simulates the delivery of `size` units entering the route at
    /// `entry_time`, requiring every hop to fit the full transmission before
    /// its window closes.
    ///
    /// # Returns
    ///
    /// * `Option<Date>` - Last-byte arrival time at the terminal, or `None`
    ///   when some hop cannot carry the transfer in its remaining window.
    pub fn delivery_time(&self, plan: &ContactPlan, entry_time: Date, size: Volume) -> Option<Date> {
        let mut at_time = entry_time;
        for &id in &self.hops {
            let contact = plan.get(id)?;
            let tx_start = at_time.max(contact.start);
            let tx_end = tx_start + contact.tx_duration(size);
            if tx_end > contact.end {
                return None;
            }
            at_time = tx_end + contact.owlt;
        }
        Some(at_time)
    }

    /// Whether any hop of the route has expired at `now`.
    pub fn has_expired_hop(&self, plan: &ContactPlan, now: Date) -> bool {
        self.hops
            .iter()
            .any(|&id| plan.get(id).map(|c| c.expired(now)).unwrap_or(true))
    }

    /// Receiving node of the first hop, the neighbour a bundle assigned to
    /// this route must be queued towards.
    pub fn next_node(&self, plan: &ContactPlan) -> Option<NodeID> {
        plan.get(*self.hops.first()?).map(|c| c.rx_node)
    }

    /// Ranks two routes: earliest delivery first, then fewest hops, then
    /// lexicographic hop ids.
    pub fn rank(&self, other: &Route) -> Ordering {
        if self.best_delivery_time > other.best_delivery_time {
            return Ordering::Greater;
        }
        if self.best_delivery_time < other.best_delivery_time {
            return Ordering::Less;
        }
        if self.hops.len() > other.hops.len() {
            return Ordering::Greater;
        }
        if self.hops.len() < other.hops.len() {
            return Ordering::Less;
        }
        self.hops.cmp(&other.hops)
    }
}
