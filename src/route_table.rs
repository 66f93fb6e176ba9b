use std::collections::HashMap;

use crate::contact_plan::ContactPlan;
use crate::route::Route;
use crate::routing::cgr_yens;
use crate::types::{Date, EndpointID, NodeID};

/// Per-node cache of candidate routes, keyed by destination endpoint.
///
/// Stored routes are immutable; a stale table is refreshed by re-running the
/// search, not by patching entries.
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    routes: HashMap<EndpointID, Vec<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovers up to `k` routes from `source` to every listed destination
    /// and replaces the cached entries.
    pub fn populate(
        &mut self,
        source: NodeID,
        plan: &ContactPlan,
        destinations: &[EndpointID],
        now: Date,
        end_time: Date,
        k: usize,
    ) {
        for &dest in destinations {
            let routes = cgr_yens(source, dest, plan, now, end_time, k);
            self.routes.insert(dest, routes);
        }
    }

    /// Replaces the entry for one destination.
    pub fn store(&mut self, dest: EndpointID, routes: Vec<Route>) {
        self.routes.insert(dest, routes);
    }

    /// Cached routes towards `dest`, best first. Empty when the destination
    /// was never discovered or is unreachable.
    pub fn get(&self, dest: EndpointID) -> &[Route] {
        self.routes.get(&dest).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn destinations(&self) -> impl Iterator<Item = EndpointID> + '_ {
        self.routes.keys().copied()
    }
}
