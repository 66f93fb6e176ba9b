use crate::bundle::DropReason;
use crate::types::{BundleID, Date, NodeID, RequestID, TaskID};

/// Events published by the engine while it runs.
///
/// Delivery to sinks is fire-and-forget; the only ordering guarantee is
/// per-publisher FIFO (each node's events arrive in the order the node
/// produced them).
#[derive(Clone, Debug, PartialEq)]
pub enum AnalyticsEvent {
    RequestSubmitted {
        request: RequestID,
        t: Date,
    },
    /// A request was appended to an existing task instead of spawning a new
    /// one.
    RequestDuplicated {
        request: RequestID,
        task: TaskID,
        t: Date,
    },
    /// The scheduler found no feasible (pickup, delivery) pair.
    RequestFailed {
        request: RequestID,
        t: Date,
    },
    TaskAdded {
        task: TaskID,
        request: RequestID,
        pickup_time: Date,
        t: Date,
    },
    TaskRescheduled {
        task: TaskID,
        t: Date,
        by_node: NodeID,
    },
    TaskFailed {
        task: TaskID,
        t: Date,
        on_node: NodeID,
    },
    BundleAcquired {
        bundle: BundleID,
        task: TaskID,
        on_node: NodeID,
        t: Date,
    },
    BundleForwarded {
        bundle: BundleID,
        on_node: NodeID,
        t: Date,
    },
    BundleDelivered {
        bundle: BundleID,
        task: TaskID,
        on_node: NodeID,
        created_at: Date,
        t: Date,
    },
    /// A bundle left circulation; the sim keeps going.
    BundleDropped {
        bundle: BundleID,
        task: TaskID,
        on_node: NodeID,
        reason: DropReason,
        t: Date,
    },
    /// A bundle was re-assigned away from its intended route.
    BundleRerouted {
        bundle: BundleID,
        on_node: NodeID,
        t: Date,
    },
}

impl AnalyticsEvent {
    /// The time the event happened, used for active-period filtering.
    pub fn time(&self) -> Date {
        match self {
            AnalyticsEvent::RequestSubmitted { t, .. }
            | AnalyticsEvent::RequestDuplicated { t, .. }
            | AnalyticsEvent::RequestFailed { t, .. }
            | AnalyticsEvent::TaskAdded { t, .. }
            | AnalyticsEvent::TaskRescheduled { t, .. }
            | AnalyticsEvent::TaskFailed { t, .. }
            | AnalyticsEvent::BundleAcquired { t, .. }
            | AnalyticsEvent::BundleForwarded { t, .. }
            | AnalyticsEvent::BundleDelivered { t, .. }
            | AnalyticsEvent::BundleDropped { t, .. }
            | AnalyticsEvent::BundleRerouted { t, .. } => *t,
        }
    }
}

/// A consumer of engine events.
pub trait EventSink {
    fn publish(&mut self, event: AnalyticsEvent);
}

/// A sink that drops everything.
#[derive(Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&mut self, _event: AnalyticsEvent) {}
}

/// Counting sink with an active period.
///
/// Events inside `[start, end]` feed the counters and latency series;
/// everything outside the window (warmup and cooldown) is ignored, and a
/// full event log is kept either way for scenario assertions.
pub struct Counters {
    start: Date,
    end: Date,
    pub requests_submitted: usize,
    pub requests_duplicated: usize,
    pub requests_failed: usize,
    pub tasks_added: usize,
    pub tasks_rescheduled: usize,
    pub tasks_failed: usize,
    pub bundles_acquired: usize,
    pub bundles_forwarded: usize,
    pub bundles_delivered: usize,
    pub bundles_dropped: usize,
    pub bundles_rerouted: usize,
    /// Bundle creation to delivery, one sample per delivered bundle.
    pub delivery_latencies: Vec<Date>,
    pub log: Vec<AnalyticsEvent>,
}

impl Counters {
    /// Builds a sink whose active period excludes `warmup` time at the start
    /// and `cooldown` time before `horizon`.
    pub fn new(horizon: Date, warmup: Date, cooldown: Date) -> Self {
        Self {
            start: warmup,
            end: horizon - cooldown,
            requests_submitted: 0,
            requests_duplicated: 0,
            requests_failed: 0,
            tasks_added: 0,
            tasks_rescheduled: 0,
            tasks_failed: 0,
            bundles_acquired: 0,
            bundles_forwarded: 0,
            bundles_delivered: 0,
            bundles_dropped: 0,
            bundles_rerouted: 0,
            delivery_latencies: Vec::new(),
            log: Vec::new(),
        }
    }

    /// A sink counting everything, for tests.
    pub fn unbounded() -> Self {
        Self::new(f64::MAX, 0.0, 0.0)
    }

    fn in_active_period(&self, t: Date) -> bool {
        self.start <= t && t <= self.end
    }

    pub fn delivery_latency_ave(&self) -> Option<Date> {
        mean(&self.delivery_latencies)
    }

    pub fn delivery_latency_stdev(&self) -> Option<Date> {
        stdev(&self.delivery_latencies)
    }

    /// Delivered fraction of the tasks created in the active period.
    pub fn delivery_ratio(&self) -> Option<f64> {
        if self.tasks_added == 0 {
            return None;
        }
        Some(self.bundles_delivered as f64 / self.tasks_added as f64)
    }
}

impl EventSink for Counters {
    fn publish(&mut self, event: AnalyticsEvent) {
        if self.in_active_period(event.time()) {
            match &event {
                AnalyticsEvent::RequestSubmitted { .. } => self.requests_submitted += 1,
                AnalyticsEvent::RequestDuplicated { .. } => self.requests_duplicated += 1,
                AnalyticsEvent::RequestFailed { .. } => self.requests_failed += 1,
                AnalyticsEvent::TaskAdded { .. } => self.tasks_added += 1,
                AnalyticsEvent::TaskRescheduled { .. } => self.tasks_rescheduled += 1,
                AnalyticsEvent::TaskFailed { .. } => self.tasks_failed += 1,
                AnalyticsEvent::BundleAcquired { .. } => self.bundles_acquired += 1,
                AnalyticsEvent::BundleForwarded { .. } => self.bundles_forwarded += 1,
                AnalyticsEvent::BundleDelivered { created_at, t, .. } => {
                    self.bundles_delivered += 1;
                    self.delivery_latencies.push(t - created_at);
                }
                AnalyticsEvent::BundleDropped { .. } => self.bundles_dropped += 1,
                AnalyticsEvent::BundleRerouted { .. } => self.bundles_rerouted += 1,
            }
        }
        self.log.push(event);
    }
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

fn stdev(samples: &[f64]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let m = mean(samples)?;
    let var = samples.iter().map(|s| (s - m) * (s - m)).sum::<f64>() / (samples.len() - 1) as f64;
    Some(var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivered(t: Date, created_at: Date) -> AnalyticsEvent {
        AnalyticsEvent::BundleDelivered {
            bundle: BundleID { origin: 1, seq: 0 },
            task: TaskID { origin: 0, seq: 0 },
            on_node: 2,
            created_at,
            t,
        }
    }

    #[test]
    fn warmup_and_cooldown_are_excluded() {
        let mut counters = Counters::new(100.0, 10.0, 10.0);
        counters.publish(delivered(5.0, 0.0));
        counters.publish(delivered(50.0, 40.0));
        counters.publish(delivered(95.0, 90.0));
        assert_eq!(counters.bundles_delivered, 1);
        assert_eq!(counters.delivery_latency_ave(), Some(10.0));
        // The raw log still has everything.
        assert_eq!(counters.log.len(), 3);
    }

    #[test]
    fn latency_statistics() {
        let mut counters = Counters::unbounded();
        counters.publish(delivered(4.0, 0.0));
        counters.publish(delivered(8.0, 0.0));
        assert_eq!(counters.delivery_latency_ave(), Some(6.0));
        let sd = counters.delivery_latency_stdev().unwrap();
        assert!((sd - 8.0_f64.sqrt()).abs() < 1e-9);
    }
}
