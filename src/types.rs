use std::fmt;

use serde::{Deserialize, Serialize};

/// Simulation time. Non-negative, no wall-clock semantics.
pub type Date = f64;
/// A span of simulation time.
pub type Duration = f64;
/// A quantity of data, in the same unit the contact rates are expressed in.
pub type Volume = f64;
/// Data volume per unit of time.
pub type DataRate = f64;
/// Unique identifier of a network element (satellite, gateway, target, scheduler).
pub type NodeID = u32;
/// Logical destination identifier. Several nodes may share one endpoint.
pub type EndpointID = u32;
/// Unique identifier of a contact within a plan.
pub type ContactID = u32;
/// Bundle priority class, an index into the per-contact reserved volume table.
pub type Priority = usize;
/// Number of hops traversed by a bundle.
pub type HopCount = u32;

/// Number of priority classes tracked by the per-contact reserved volume table.
pub const PRIORITY_LEVELS: usize = 3;

/// Tolerance for comparing event times that derive from the same contact
/// record through different arithmetic paths.
pub const TIME_EPSILON: f64 = 1e-9;

/// Identifier of a scheduled task.
///
/// Task ids are `(origin, seq)` pairs so that any node may mint ids without
/// coordination: the origin is the minting node and the sequence number is
/// local to that node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct TaskID {
    pub origin: NodeID,
    pub seq: u64,
}

impl fmt::Display for TaskID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}-{}", self.origin, self.seq)
    }
}

/// Identifier of a bundle, minted by the acquiring node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct BundleID {
    pub origin: NodeID,
    pub seq: u64,
}

impl fmt::Display for BundleID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}-{}", self.origin, self.seq)
    }
}

/// Identifier of a pickup request. Requests are minted by the request source,
/// outside the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct RequestID(pub u64);

impl fmt::Display for RequestID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}
