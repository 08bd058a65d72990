//! Per-device adapter settings.

use crate::error::{Result, TuyaDpError};
use crate::transaction::AckMode;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// Bursts from multi-dp reports must fit without dropping frames.
pub const MIN_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub command_timeout_ms: u64,
    /// Transmissions per command, the first send included
    pub attempts: u32,
    pub quiescence_ms: u64,
    pub echo_window_ms: u64,
    pub queue_depth: usize,
    /// Overrides the ack mode declared by the schema
    pub ack_mode: Option<AckMode>,
    pub corruption_threshold: u32,
    pub time_sync_interval_secs: Option<u64>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5000,
            attempts: 2,
            quiescence_ms: 200,
            echo_window_ms: 1000,
            queue_depth: MIN_QUEUE_DEPTH,
            ack_mode: None,
            corruption_threshold: 3,
            time_sync_interval_secs: None,
        }
    }
}

impl AdapterConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| TuyaDpError::Config(e.to_string()))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.max(MIN_QUEUE_DEPTH)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    pub fn time_sync_interval(&self) -> Option<Duration> {
        self.time_sync_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config = AdapterConfig::from_json(r#"{ "attempts": 4, "ack_mode": "dp_echo" }"#).unwrap();
        assert_eq!(config.attempts(), 4);
        assert_eq!(config.ack_mode, Some(AckMode::DpEcho));
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.quiescence(), Duration::from_millis(200));
        assert!(config.time_sync_interval().is_none());
    }

    #[test]
    fn queue_depth_has_a_floor() {
        let config = AdapterConfig {
            queue_depth: 4,
            ..AdapterConfig::default()
        };
        assert_eq!(config.queue_depth(), MIN_QUEUE_DEPTH);
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        assert!(matches!(
            AdapterConfig::from_json("{ \"attempts\": \"many\" }"),
            Err(TuyaDpError::Config(_))
        ));
    }
}
