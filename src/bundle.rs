use std::collections::VecDeque;

use crate::error::EngineError;
use crate::types::{
    BundleID, ContactID, Date, EndpointID, HopCount, NodeID, Priority, TaskID, Volume,
};

/// The unit of stored-and-forwarded payload.
///
/// A bundle is synthesised when a task's pickup contact fires and destroyed
/// on delivery or drop. All cross-entity references are by id: the bundle
/// carries its task id, never the task itself.
#[derive(Clone, Debug)]
pub struct Bundle {
    pub id: BundleID,
    /// The node that acquired the bundle.
    pub src: NodeID,
    /// The endpoint the bundle must reach.
    pub dst_eid: EndpointID,
    /// The target the payload was collected from.
    pub target_id: NodeID,
    pub size: Volume,
    /// Hard delivery deadline; past it the bundle is only ever dropped.
    pub deadline: Date,
    pub created_at: Date,
    pub priority: Priority,
    /// The task this bundle satisfies.
    pub task_id: TaskID,
    /// The node whose buffer currently holds the bundle.
    pub current: NodeID,
    /// The node the bundle was last forwarded by, if any.
    pub previous_node: Option<NodeID>,
    pub hop_count: HopCount,
    /// Intended route assigned at scheduling time, preferred by relays when
    /// Moderate Source Routing is enabled and the route is still feasible.
    pub base_route: Option<Vec<ContactID>>,
    /// Hops booked for this bundle by the last assignment, so the debits can
    /// be reversed if the bundle returns to the buffer.
    pub booked_route: Option<Vec<ContactID>>,
}

impl Bundle {
    /// Whether the bundle can no longer be delivered in time.
    #[inline(always)]
    pub fn expired(&self, now: Date) -> bool {
        now > self.deadline
    }
}

/// Why a bundle was taken out of circulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// No candidate route could deliver the bundle before its deadline.
    NoFeasibleRoute,
    /// The deadline elapsed while the bundle sat in a buffer or queue.
    DeadlineExpired,
    /// The receiving buffer refused the bundle and no retry is possible.
    BufferRefused,
}

/// A capacity-bounded bundle store.
///
/// Extraction order is FIFO, matching the assignment pass draining the
/// buffer oldest-first.
#[derive(Clone, Debug)]
pub struct Buffer {
    capacity: Volume,
    used: Volume,
    bundles: VecDeque<Bundle>,
}

impl Buffer {
    pub fn new(capacity: Volume) -> Self {
        Self {
            capacity,
            used: 0.0,
            bundles: VecDeque::new(),
        }
    }

    #[inline(always)]
    pub fn capacity_remaining(&self) -> Volume {
        self.capacity - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Stores a bundle, refusing it when it does not fit.
    pub fn append(&mut self, bundle: Bundle) -> Result<(), EngineError> {
        if bundle.size > self.capacity_remaining() {
            return Err(EngineError::BufferOverflow {
                needed: bundle.size,
                available: self.capacity_remaining(),
            });
        }
        self.used += bundle.size;
        self.bundles.push_back(bundle);
        Ok(())
    }

    /// Removes and returns the oldest stored bundle.
    pub fn extract(&mut self) -> Option<Bundle> {
        let bundle = self.bundles.pop_front()?;
        self.used -= bundle.size;
        Some(bundle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bundle> {
        self.bundles.iter()
    }
}
