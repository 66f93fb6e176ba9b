use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contact::Contact;
use crate::contact_plan::ContactPlan;
use crate::error::EngineError;
use crate::route::Route;
use crate::types::{ContactID, Date, Duration, EndpointID, NodeID, Priority, RequestID, TaskID, Volume};

/// Selects the objective and feasibility rules of the scheduler.
///
/// The modes form a ladder: each one keeps the checks of the previous and
/// adds its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// Earliest target contact, no delivery validation at all.
    Naive,
    /// Earliest pickup that has some feasible delivery route.
    First,
    /// Earliest delivery time over nominal contact volumes.
    Cgr,
    /// Earliest delivery time over residual volumes, i.e. after deducting
    /// every previously scheduled task.
    CgrResource,
    /// As `CgrResource`, and the task carries its delivery route so relays
    /// can prefer it (Moderate Source Routing).
    Msr,
}

impl SchedulerMode {
    fn validate_pickup(self) -> bool {
        !matches!(self, SchedulerMode::Naive)
    }

    fn validate_delivery(self) -> bool {
        matches!(
            self,
            SchedulerMode::Cgr | SchedulerMode::CgrResource | SchedulerMode::Msr
        )
    }

    fn resource_aware(self) -> bool {
        matches!(self, SchedulerMode::CgrResource | SchedulerMode::Msr)
    }

    fn define_delivery(self) -> bool {
        matches!(self, SchedulerMode::Msr)
    }
}

/// Lifecycle of a pickup request, as reported to analytics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Submitted,
    Accepted,
    Acquired,
    Delivered,
    Failed,
}

/// An externally submitted demand: collect data from a target and deliver it
/// to an endpoint before a deadline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub uid: RequestID,
    pub target_id: NodeID,
    pub destination: EndpointID,
    pub size: Volume,
    pub priority: Priority,
    /// Lifetime of the bundle generated in response, from acquisition.
    pub lifetime: Duration,
    pub time_created: Date,
    pub deadline: Date,
    pub status: RequestStatus,
}

impl Request {
    pub fn new(
        uid: RequestID,
        target_id: NodeID,
        destination: EndpointID,
        size: Volume,
        priority: Priority,
        lifetime: Duration,
        time_created: Date,
    ) -> Self {
        Self {
            uid,
            target_id,
            destination,
            size,
            priority,
            lifetime,
            time_created,
            deadline: time_created + lifetime,
            status: RequestStatus::Submitted,
        }
    }
}

/// Lifecycle of a task. The ordering used by the gossip merge lives in the
/// task table module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Rescheduled,
    Acquired,
    Delivered,
    Failed,
}

/// The scheduler's plan to satisfy one or more requests by acquiring a
/// bundle at a specific target contact and shipping it along a delivery
/// route.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub uid: TaskID,
    pub target: NodeID,
    /// Start of the chosen target contact.
    pub pickup_time: Date,
    /// Node responsible for the acquisition.
    pub assignee: NodeID,
    pub destination: EndpointID,
    pub size: Volume,
    pub priority: Priority,
    /// Lifetime granted to the bundle at acquisition.
    pub lifetime: Duration,
    /// Latest moment the pickup contact can still produce a bundle.
    pub deadline_acquisition: Date,
    pub deadline_delivery: Date,
    /// The requests this task satisfies; never empty.
    pub request_ids: Vec<RequestID>,
    pub status: TaskStatus,
    /// Logical time of the last status change, the primary merge key.
    pub updated_at: Date,
    /// Delivery route chosen at scheduling time, carried onto the bundle
    /// when Moderate Source Routing is in use.
    pub base_route: Option<Vec<ContactID>>,
}

impl Task {
    /// Moves the task to a new status, bumping the merge timestamp.
    pub fn transition(&mut self, status: TaskStatus, now: Date) {
        self.status = status;
        self.updated_at = now;
    }

    /// Whether the delivery deadline has elapsed.
    pub fn expired(&self, now: Date) -> bool {
        now > self.deadline_delivery
    }
}

/// Converts requests into tasks by pairing a target contact with a delivery
/// route under volume and deadline feasibility.
#[derive(Clone, Debug)]
pub struct Scheduler {
    mode: SchedulerMode,
    /// The node this scheduler mints task ids on behalf of.
    origin: NodeID,
    /// Route-search depth per (pickup, destination) pair.
    k: usize,
    seq: u64,
}

impl Scheduler {
    pub fn new(mode: SchedulerMode, origin: NodeID, k: usize) -> Self {
        Self {
            mode,
            origin,
            k: k.max(1),
            seq: 0,
        }
    }

    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    fn next_task_id(&mut self) -> TaskID {
        let id = TaskID {
            origin: self.origin,
            seq: self.seq,
        };
        self.seq += 1;
        id
    }

    /// Schedules a request into a task.
    ///
    /// Walks the target contacts that can still observe the target within
    /// the request window, searches a delivery route from each candidate
    /// acquirer, and selects the (target contact, route) pair minimising the
    /// mode's objective. On success the request size is atomically deducted
    /// from the target contact and from every hop of the chosen route.
    ///
    /// # Parameters
    ///
    /// * `request` - The request to satisfy.
    /// * `now` - The current time; pickups are never scheduled in the past.
    /// * `routing_plan` - Node-to-node contacts, mutated by the booking.
    /// * `target_plan` - Satellite-to-target contacts, mutated by the
    ///   booking.
    ///
    /// # Returns
    ///
    /// * `Result<Task, EngineError>` - The task, or `NoFeasibleTask` when no
    ///   pair passes the filters.
    pub fn schedule(
        &mut self,
        request: &Request,
        now: Date,
        routing_plan: &mut ContactPlan,
        target_plan: &mut ContactPlan,
    ) -> Result<Task, EngineError> {
        let mut selected: Option<(ContactID, NodeID, Date, Date, Option<Route>, Date)> = None;

        let candidates: Vec<ContactID> = target_plan
            .contacts()
            .filter(|c| {
                c.rx_node == request.target_id
                    && c.start >= now
                    && c.start < request.deadline
                    && c.can_book(request.size, request.priority)
            })
            .map(|c| c.id)
            .collect();

        for id in candidates {
            let (assignee, pickup_time, pickup_close) = {
                let c: &Contact = target_plan.get(id).ok_or(EngineError::NoFeasibleTask)?;
                (c.tx_node, c.start, c.end)
            };

            if !self.mode.validate_pickup() {
                selected = Some((id, assignee, pickup_time, pickup_close, None, pickup_time));
                break;
            }

            let entry = pickup_time.max(now);
            let found = self.best_route(routing_plan, assignee, request, entry);
            let (route, delivery) = match found {
                Some(pair) => pair,
                None => continue,
            };

            if !self.mode.validate_delivery() {
                // Earliest feasible pickup wins; candidates come in start
                // order, so the first hit is the answer.
                selected = Some((id, assignee, pickup_time, pickup_close, Some(route), delivery));
                break;
            }

            let better = match &selected {
                Some((_, _, best_pickup, _, _, best_delivery)) => {
                    delivery < *best_delivery
                        || (delivery == *best_delivery && pickup_time < *best_pickup)
                }
                None => true,
            };
            if better {
                selected = Some((id, assignee, pickup_time, pickup_close, Some(route), delivery));
            }
        }

        let (target_contact, assignee, pickup_time, pickup_close, route, _delivery) =
            selected.ok_or(EngineError::NoFeasibleTask)?;

        if let Some(route) = &route {
            if self.mode.resource_aware() {
                routing_plan.book_route(&route.hops, request.size, request.priority)?;
            } else {
                routing_plan.book_route_saturating(&route.hops, request.size, request.priority);
            }
        }
        target_plan.book(target_contact, request.size, request.priority)?;

        let task = Task {
            uid: self.next_task_id(),
            target: request.target_id,
            pickup_time,
            assignee,
            destination: request.destination,
            size: request.size,
            priority: request.priority,
            lifetime: request.lifetime,
            deadline_acquisition: pickup_close.min(request.deadline),
            deadline_delivery: request.deadline,
            request_ids: vec![request.uid],
            status: TaskStatus::Pending,
            updated_at: now,
            base_route: if self.mode.define_delivery() {
                route.map(|r| r.hops)
            } else {
                None
            },
        };
        debug!(task = %task.uid, assignee, pickup_time, "task scheduled");
        Ok(task)
    }

    /// Best feasible delivery route from `from` for the request, entering
    /// the graph at `entry`.
    fn best_route(
        &self,
        routing_plan: &ContactPlan,
        from: NodeID,
        request: &Request,
        entry: Date,
    ) -> Option<(Route, Date)> {
        let routes = crate::routing::cgr_yens(
            from,
            request.destination,
            routing_plan,
            entry,
            request.deadline,
            self.k,
        );
        for route in routes {
            let available = if self.mode.resource_aware() {
                route.rebottleneck(routing_plan, request.priority)
            } else {
                routing_plan.nominal_bottleneck(&route.hops)
            };
            if available < request.size {
                continue;
            }
            let delivery = match route.delivery_time(routing_plan, entry, request.size) {
                Some(t) => t,
                None => continue,
            };
            if delivery > request.deadline {
                continue;
            }
            return Some((route, delivery));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::ContactRecord;

    const DEST: EndpointID = 999;

    fn request(size: Volume, lifetime: Duration) -> Request {
        Request::new(RequestID(1), 30, DEST, size, 0, lifetime, 0.0)
    }

    /// Satellites 10 and 11 both see target 30; 10 delivers quickly, 11
    /// slowly.
    fn plans() -> (ContactPlan, ContactPlan) {
        let routing = ContactPlan::from_records(&[
            ContactRecord::new(10, 20, 4.0, 8.0, 1.0).with_rx_eid(DEST),
            ContactRecord::new(11, 20, 12.0, 16.0, 1.0).with_rx_eid(DEST),
        ])
        .unwrap();
        let target = ContactPlan::from_records(&[
            ContactRecord::new(10, 30, 2.0, 3.0, 10.0),
            ContactRecord::new(11, 30, 1.0, 2.0, 10.0),
        ])
        .unwrap();
        (routing, target)
    }

    #[test]
    fn cgr_picks_earliest_delivery_pair() {
        let (mut routing, mut target) = plans();
        let mut scheduler = Scheduler::new(SchedulerMode::Cgr, 0, 3);
        let task = scheduler
            .schedule(&request(1.0, 20.0), 0.0, &mut routing, &mut target)
            .unwrap();
        // Satellite 11 sees the target first, but satellite 10 delivers at
        // t=5 against t=13.
        assert_eq!(task.assignee, 10);
        assert_eq!(task.pickup_time, 2.0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.request_ids, vec![RequestID(1)]);
        // Booking debited the route hop and the target contact.
        assert_eq!(routing.get(0).unwrap().residual_volume, 3.0);
        assert_eq!(target.get(0).unwrap().residual_volume, 9.0);
    }

    #[test]
    fn first_picks_earliest_feasible_pickup() {
        let (mut routing, mut target) = plans();
        let mut scheduler = Scheduler::new(SchedulerMode::First, 0, 3);
        let task = scheduler
            .schedule(&request(1.0, 20.0), 0.0, &mut routing, &mut target)
            .unwrap();
        assert_eq!(task.assignee, 11);
        assert_eq!(task.pickup_time, 1.0);
    }

    #[test]
    fn naive_skips_delivery_validation() {
        let (mut routing, mut target) = plans();
        let mut scheduler = Scheduler::new(SchedulerMode::Naive, 0, 3);
        // Far too large for any route, but naive does not look.
        let err = scheduler
            .schedule(&request(1000.0, 20.0), 0.0, &mut routing, &mut target)
            .unwrap_err();
        // The target contact itself cannot hold 1000 units either.
        assert_eq!(err, EngineError::NoFeasibleTask);
        let task = scheduler
            .schedule(&request(6.0, 20.0), 0.0, &mut routing, &mut target)
            .unwrap();
        assert_eq!(task.assignee, 11);
        assert!(task.base_route.is_none());
    }

    #[test]
    fn resource_aware_sees_prior_bookings() {
        let (mut routing, mut target) = plans();
        // A previous epoch consumed the fast downlink.
        routing.book(0, 4.0, 0).unwrap();
        let mut cgr = Scheduler::new(SchedulerMode::Cgr, 0, 3);
        let mut aware = Scheduler::new(SchedulerMode::CgrResource, 0, 3);

        let blind = cgr
            .schedule(&request(2.0, 20.0), 0.0, &mut routing.clone(), &mut target.clone())
            .unwrap();
        assert_eq!(blind.assignee, 10);

        let task = aware
            .schedule(&request(2.0, 20.0), 0.0, &mut routing, &mut target)
            .unwrap();
        assert_eq!(task.assignee, 11);
    }

    #[test]
    fn msr_tasks_carry_their_route() {
        let (mut routing, mut target) = plans();
        let mut scheduler = Scheduler::new(SchedulerMode::Msr, 0, 3);
        let task = scheduler
            .schedule(&request(1.0, 20.0), 0.0, &mut routing, &mut target)
            .unwrap();
        assert_eq!(task.base_route, Some(vec![0]));
    }

    #[test]
    fn past_pickups_are_never_scheduled() {
        let (mut routing, mut target) = plans();
        let mut scheduler = Scheduler::new(SchedulerMode::Cgr, 0, 3);
        let err = scheduler
            .schedule(&request(1.0, 20.0), 5.0, &mut routing, &mut target)
            .unwrap_err();
        // Both target contacts start before t=5.
        assert_eq!(err, EngineError::NoFeasibleTask);
    }

    #[test]
    fn task_ids_are_distinct_per_origin() {
        let (mut routing, mut target) = plans();
        let mut scheduler = Scheduler::new(SchedulerMode::Cgr, 7, 3);
        let a = scheduler
            .schedule(&request(1.0, 20.0), 0.0, &mut routing, &mut target)
            .unwrap();
        let b = scheduler
            .schedule(&request(1.0, 20.0), 0.0, &mut routing, &mut target)
            .unwrap();
        assert_ne!(a.uid, b.uid);
        assert_eq!(a.uid.origin, 7);
    }
}
