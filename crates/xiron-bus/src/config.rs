//! Bus-wide settings shared by the dispatcher, the command façade, and the
//! WebSocket bridge.
//!
//! Every field has a serde default so a partial `config.toml` is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use xiron_types::{BusError, Topic};

/// Exponential backoff applied by poll-mode subscriptions before they give up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Consecutive failed queries tolerated before the subscription fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Fail on the first error.
    pub const NONE: RetryPolicy = RetryPolicy {
        max_retries: 0,
        initial_backoff_ms: 0,
        max_backoff_ms: 0,
    };

    /// Delay before retry number `attempt` (1-based): the initial backoff
    /// doubled per attempt, capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Settings for one bus instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Frames buffered per topic before slow subscribers start lagging.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Upper bound on a synchronous round trip (`get_pose`, poll queries).
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Topic velocity commands are published under.
    #[serde(default = "default_command_topic")]
    pub command_topic: String,

    #[serde(default = "default_pose_topic")]
    pub pose_topic: String,

    #[serde(default = "default_scan_topic")]
    pub scan_topic: String,

    /// Listen address of `xiron serve`.
    #[serde(default = "default_bridge_addr")]
    pub bridge_addr: String,

    /// URL clients dial to reach the bridge.
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    2_000
}
fn default_channel_capacity() -> usize {
    256
}
fn default_rpc_timeout_ms() -> u64 {
    1_000
}
fn default_command_topic() -> String {
    "vel".to_string()
}
fn default_pose_topic() -> String {
    "pose".to_string()
}
fn default_scan_topic() -> String {
    "scan".to_string()
}
fn default_bridge_addr() -> String {
    "127.0.0.1:8081".to_string()
}
fn default_bridge_url() -> String {
    "ws://127.0.0.1:8081".to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            command_topic: default_command_topic(),
            pose_topic: default_pose_topic(),
            scan_topic: default_scan_topic(),
            bridge_addr: default_bridge_addr(),
            bridge_url: default_bridge_url(),
            retry: RetryPolicy::default(),
        }
    }
}

impl BusConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn command_topic(&self) -> Result<Topic, BusError> {
        Topic::new(self.command_topic.as_str())
    }

    pub fn pose_topic(&self) -> Result<Topic, BusError> {
        Topic::new(self.pose_topic.as_str())
    }

    pub fn scan_topic(&self) -> Result<Topic, BusError> {
        Topic::new(self.scan_topic.as_str())
    }

    /// Reject settings the bus cannot run with.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.channel_capacity == 0 {
            return Err(BusError::Config("channel_capacity must be at least 1".to_string()));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(BusError::Config("rpc_timeout_ms must be at least 1".to_string()));
        }
        self.command_topic()?;
        self.pose_topic()?;
        self.scan_topic()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: BusConfig = serde_json::from_str(r#"{"command_topic":"cmd"}"#).unwrap();
        assert_eq!(cfg.command_topic, "cmd");
        assert_eq!(cfg.channel_capacity, 256);
        assert_eq!(cfg.retry, RetryPolicy::default());
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let cfg = BusConfig {
            channel_capacity: 0,
            ..BusConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(BusError::Config(_))));
    }

    #[test]
    fn validate_rejects_bad_topic() {
        let cfg = BusConfig {
            pose_topic: String::new(),
            ..BusConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(BusError::InvalidTopic(_))));
        assert!(BusConfig::default().validate().is_ok());
    }
}
