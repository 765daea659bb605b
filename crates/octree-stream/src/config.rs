use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::packet::DATA_HEADER_LEN;

pub const DEFAULT_INTERVALS_PER_SECOND: u32 = 60;
pub const DEFAULT_PACKETS_PER_INTERVAL_PER_VIEWER: u32 = 10;
pub const DEFAULT_PACKETS_PER_INTERVAL_TOTAL: u32 = 2000;
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1464;

/// Which traversal policy new sessions are created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    Prioritized,
    Sweep,
}

/// Tunables for the streaming core. None of the defaults are load-bearing for
/// correctness; they can all be overridden from the server config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub intervals_per_second: u32,
    pub packets_per_second_per_viewer: u32,
    pub packets_per_second_total: u32,
    pub suppress_duplicates: bool,
    pub min_resend_interval_ms: u64,
    pub position_epsilon: f32,
    pub orientation_epsilon_degrees: f32,
    pub fov_epsilon_degrees: f32,
    pub history_capacity: usize,
    pub max_elements_per_pass: usize,
    pub traversal_budget_us: u64,
    pub max_no_update_ms: u64,
    pub max_packet_size: usize,
    pub max_oversize_multiplier: usize,
    pub idle_timeout_ms: u64,
    pub policy: PolicyKind,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            intervals_per_second: DEFAULT_INTERVALS_PER_SECOND,
            packets_per_second_per_viewer: DEFAULT_PACKETS_PER_INTERVAL_PER_VIEWER
                * DEFAULT_INTERVALS_PER_SECOND,
            packets_per_second_total: DEFAULT_PACKETS_PER_INTERVAL_TOTAL
                * DEFAULT_INTERVALS_PER_SECOND,
            suppress_duplicates: true,
            min_resend_interval_ms: 1_000,
            position_epsilon: 0.1,
            orientation_epsilon_degrees: 5.0,
            fov_epsilon_degrees: 1.0,
            history_capacity: 1_000,
            max_elements_per_pass: 4_096,
            traversal_budget_us: 200,
            max_no_update_ms: 5_000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_oversize_multiplier: 8,
            idle_timeout_ms: 30_000,
            policy: PolicyKind::Prioritized,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.intervals_per_second == 0 {
            return Err(StreamError::Config(
                "intervals_per_second must be greater than zero".into(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(StreamError::Config(
                "history_capacity must be greater than zero".into(),
            ));
        }
        if self.max_packet_size <= DATA_HEADER_LEN {
            return Err(StreamError::Config(format!(
                "max_packet_size must exceed the {DATA_HEADER_LEN} byte header"
            )));
        }
        if self.max_oversize_multiplier < 2 {
            return Err(StreamError::Config(
                "max_oversize_multiplier must be at least 2".into(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.intervals_per_second.max(1)))
    }

    pub fn min_resend_interval(&self) -> Duration {
        Duration::from_millis(self.min_resend_interval_ms)
    }

    pub fn traversal_budget(&self) -> Duration {
        Duration::from_micros(self.traversal_budget_us)
    }

    pub fn max_no_update(&self) -> Duration {
        Duration::from_millis(self.max_no_update_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StreamConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let parsed: StreamConfig =
            serde_json::from_str(r#"{"history_capacity": 3, "policy": "sweep"}"#)
                .expect("parse config");
        assert_eq!(parsed.history_capacity, 3);
        assert_eq!(parsed.policy, PolicyKind::Sweep);
        assert_eq!(parsed.intervals_per_second, DEFAULT_INTERVALS_PER_SECOND);
    }

    #[test]
    fn tiny_packet_size_rejected() {
        let config = StreamConfig {
            max_packet_size: 4,
            ..StreamConfig::default()
        };
        assert!(matches!(config.validate(), Err(StreamError::Config(_))));
    }
}
