use std::collections::HashMap;

use crate::scheduling::{Request, Task, TaskStatus};
use crate::types::{Date, NodeID, TaskID};

/// Rank of a status when two records carry the same `updated_at`. Terminal
/// states are handled before this rank is consulted.
fn status_rank(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::Pending => 0,
        TaskStatus::Rescheduled => 1,
        TaskStatus::Acquired => 2,
        TaskStatus::Failed => 3,
        TaskStatus::Delivered => 4,
    }
}

/// Whether `incoming` should replace `local` under the gossip ordering.
///
/// `Delivered` is absorbing: it wins regardless of timestamps (the data
/// arrived) and is never downgraded. `Failed` is terminal otherwise: only a
/// late delivery report supersedes it. The remaining conflicts order by
/// `updated_at`, then by status rank.
fn supersedes(incoming: &Task, local: &Task) -> bool {
    if local.status == TaskStatus::Delivered {
        return false;
    }
    if incoming.status == TaskStatus::Delivered {
        return true;
    }
    if local.status == TaskStatus::Failed {
        return false;
    }
    if incoming.status == TaskStatus::Failed {
        return true;
    }
    if incoming.updated_at != local.updated_at {
        return incoming.updated_at > local.updated_at;
    }
    status_rank(incoming.status) > status_rank(local.status)
}

/// A per-node map of known tasks, reconciled across nodes by gossip.
///
/// Every local change bumps a table revision and stamps the touched entry
/// with it, so a handshake can send a neighbour the strict delta since the
/// revision that neighbour last saw.
#[derive(Clone, Debug, Default)]
pub struct TaskTable {
    tasks: HashMap<TaskID, Task>,
    touched: HashMap<TaskID, u64>,
    revision: u64,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current table revision. Monotonically increasing across local
    /// changes and merges.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, id: TaskID) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    fn touch(&mut self, id: TaskID) {
        self.revision += 1;
        self.touched.insert(id, self.revision);
    }

    /// Inserts a freshly scheduled task.
    pub fn insert(&mut self, task: Task) {
        let id = task.uid;
        self.tasks.insert(id, task);
        self.touch(id);
    }

    /// Applies a closure to a task, recording the entry as changed.
    ///
    /// Returns `false` when the task is unknown.
    pub fn update<F: FnOnce(&mut Task)>(&mut self, id: TaskID, apply: F) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) => {
                apply(task);
                self.touch(id);
                true
            }
            None => false,
        }
    }

    /// Moves a task to a status, bumping its merge timestamp. No-ops on
    /// unknown ids and on entries already delivered.
    pub fn transition(&mut self, id: TaskID, status: TaskStatus, now: Date) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if task.status != TaskStatus::Delivered => {
                task.transition(status, now);
                self.touch(id);
                true
            }
            _ => false,
        }
    }

    /// Full snapshot, sent on handshake.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }

    /// Entries changed strictly after `revision`, sent as a delta to a
    /// neighbour that already saw everything up to it.
    pub fn delta_since(&self, revision: u64) -> Vec<Task> {
        self.touched
            .iter()
            .filter(|&(_, &rev)| rev > revision)
            .filter_map(|(id, _)| self.tasks.get(id).cloned())
            .collect()
    }

    /// Merges a remote snapshot or delta into the table.
    ///
    /// Unknown tasks are inserted; known tasks are replaced when the remote
    /// record dominates the local one. Idempotent: re-merging the same
    /// snapshot changes nothing.
    ///
    /// # Returns
    ///
    /// * `bool` - Whether any entry changed.
    pub fn merge(&mut self, remote: &[Task]) -> bool {
        let mut changed = false;
        for task in remote {
            match self.tasks.get(&task.uid) {
                Some(local) => {
                    if supersedes(task, local) {
                        self.tasks.insert(task.uid, task.clone());
                        self.touch(task.uid);
                        changed = true;
                    }
                }
                None => {
                    self.insert(task.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    /// Finds a pending task that would already satisfy `request`: same
    /// target, picked up no earlier than the request arrived, delivered no
    /// later than the request demands.
    pub fn find_servicing(&self, request: &Request) -> Option<TaskID> {
        self.tasks
            .values()
            .find(|task| {
                task.target == request.target_id
                    && task.pickup_time >= request.time_created
                    && task.deadline_delivery >= request.deadline
                    && matches!(task.status, TaskStatus::Pending)
            })
            .map(|task| task.uid)
    }

    /// Tasks assigned to `node` whose pickup window was missed: still
    /// pending while the pickup deadline has passed.
    pub fn missed_pickups(&self, node: NodeID, now: Date) -> Vec<TaskID> {
        self.tasks
            .values()
            .filter(|task| {
                task.assignee == node
                    && task.status == TaskStatus::Pending
                    && task.deadline_acquisition < now
            })
            .map(|task| task.uid)
            .collect()
    }
}
