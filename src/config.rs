use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::scheduling::SchedulerMode;
use crate::types::{Date, Duration, Volume};

/// Who may alter the task table after the scheduler produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReschedulingMode {
    /// Remote nodes only ever receive the table.
    Off,
    /// A node may re-schedule its own tasks whose pickup was missed.
    PrePickup,
    /// Additionally, a node may seek a fresh delivery route for a bundle it
    /// had to drop.
    Any,
}

/// Engine configuration.
///
/// Defaults mirror the reference constants: assignment and polling every
/// time unit, a 100 000-unit node buffer and a 1 000-unit scheduler buffer,
/// no warmup or cooldown.
#[derive(Clone, Debug, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Config {
    #[derivative(Default(value = "SchedulerMode::CgrResource"))]
    pub scheduler_mode: SchedulerMode,
    #[derivative(Default(value = "false"))]
    pub request_duplication: bool,
    #[derivative(Default(value = "ReschedulingMode::Off"))]
    pub rescheduling: ReschedulingMode,
    /// Relays prefer the route a bundle was scheduled onto when it is still
    /// feasible.
    #[derivative(Default(value = "false"))]
    pub msr_enabled: bool,
    /// Route-table depth per destination.
    #[derivative(Default(value = "3"))]
    pub k_routes_per_pair: usize,
    #[derivative(Default(value = "1.0"))]
    pub bundle_assign_period: Duration,
    #[derivative(Default(value = "1.0"))]
    pub outbound_poll_period: Duration,
    #[derivative(Default(value = "100000.0"))]
    pub node_buffer_capacity: Volume,
    #[derivative(Default(value = "1000.0"))]
    pub scheduler_buffer_capacity: Volume,
    /// Leading span excluded from analytics.
    #[derivative(Default(value = "0.0"))]
    pub warmup: Date,
    /// Trailing span excluded from analytics.
    #[derivative(Default(value = "0.0"))]
    pub cooldown: Date,
}

impl Config {
    /// Clamps degenerate values that would stall the engine.
    pub fn sanitized(mut self) -> Self {
        self.k_routes_per_pair = self.k_routes_per_pair.max(1);
        self.bundle_assign_period = self.bundle_assign_period.max(f64::EPSILON);
        self.outbound_poll_period = self.outbound_poll_period.max(f64::EPSILON);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_constants() {
        let config = Config::default();
        assert_eq!(config.scheduler_mode, SchedulerMode::CgrResource);
        assert_eq!(config.bundle_assign_period, 1.0);
        assert_eq!(config.node_buffer_capacity, 100000.0);
        assert!(!config.msr_enabled);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"scheduler_mode": "msr", "rescheduling": "any"}"#).unwrap();
        assert_eq!(config.scheduler_mode, SchedulerMode::Msr);
        assert_eq!(config.rescheduling, ReschedulingMode::Any);
        assert_eq!(config.k_routes_per_pair, 3);
    }

    #[test]
    fn sanitize_repairs_degenerate_values() {
        let config = Config {
            k_routes_per_pair: 0,
            bundle_assign_period: 0.0,
            ..Config::default()
        }
        .sanitized();
        assert_eq!(config.k_routes_per_pair, 1);
        assert!(config.bundle_assign_period > 0.0);
    }
}
