//! Device health tracking.
//! Only exhausted commands and persistent frame corruption are surfaced;
//! everything else is expected to heal on its own.

use crate::error::{HEALTH_COMMAND_FAILED, HEALTH_FRAME_CORRUPTION, get_health_message};
use log::warn;
use serde::Serialize;
use std::collections::HashMap;

pub const DEFAULT_CORRUPTION_THRESHOLD: u32 = 3;

/// Warning surfaced to the hosting application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthWarning {
    CommandFailed { dp_id: u8, attempts: u32 },
    PersistentCorruption { dp_id: u8, consecutive: u32 },
}

impl HealthWarning {
    pub fn code(&self) -> u32 {
        match self {
            HealthWarning::CommandFailed { .. } => HEALTH_COMMAND_FAILED,
            HealthWarning::PersistentCorruption { .. } => HEALTH_FRAME_CORRUPTION,
        }
    }

    pub fn message(&self) -> &'static str {
        get_health_message(self.code())
    }
}

impl std::fmt::Display for HealthWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthWarning::CommandFailed { dp_id, attempts } => write!(
                f,
                "[{}] {} (dp {}, {} attempt(s))",
                self.code(),
                self.message(),
                dp_id,
                attempts
            ),
            HealthWarning::PersistentCorruption { dp_id, consecutive } => write!(
                f,
                "[{}] {} (dp {}, {} in a row)",
                self.code(),
                self.message(),
                dp_id,
                consecutive
            ),
        }
    }
}

/// Per-dp run length of truncated frames.
pub struct HealthMonitor {
    threshold: u32,
    truncated: HashMap<u8, u32>,
}

impl HealthMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            truncated: HashMap::new(),
        }
    }

    /// Record a truncated frame. Warns once when the run reaches the threshold.
    pub fn record_truncated(&mut self, dp_id: u8) -> Option<HealthWarning> {
        let run = self.truncated.entry(dp_id).or_insert(0);
        *run += 1;
        if *run == self.threshold {
            let warning = HealthWarning::PersistentCorruption {
                dp_id,
                consecutive: *run,
            };
            warn!("{}", warning);
            return Some(warning);
        }
        None
    }

    /// A well-formed frame for `dp_id` ends its truncation run.
    pub fn record_success(&mut self, dp_id: u8) {
        self.truncated.remove(&dp_id);
    }

    pub fn command_failed(&self, dp_id: u8, attempts: u32) -> HealthWarning {
        let warning = HealthWarning::CommandFailed { dp_id, attempts };
        warn!("{}", warning);
        warning
    }

    pub fn truncation_run(&self, dp_id: u8) -> u32 {
        self.truncated.get(&dp_id).copied().unwrap_or(0)
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_CORRUPTION_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warns_once_at_threshold() {
        let mut monitor = HealthMonitor::default();
        assert!(monitor.record_truncated(7).is_none());
        assert!(monitor.record_truncated(7).is_none());
        assert_eq!(
            monitor.record_truncated(7),
            Some(HealthWarning::PersistentCorruption {
                dp_id: 7,
                consecutive: 3
            })
        );
        assert!(monitor.record_truncated(7).is_none());
        assert_eq!(monitor.truncation_run(7), 4);
    }

    #[test]
    fn success_resets_run() {
        let mut monitor = HealthMonitor::new(2);
        monitor.record_truncated(7);
        monitor.record_success(7);
        assert!(monitor.record_truncated(7).is_none());
        // Other dps have their own runs
        assert!(monitor.record_truncated(8).is_none());
        assert!(monitor.record_truncated(7).is_some());
    }

    #[test]
    fn warning_codes() {
        let failed = HealthMonitor::default().command_failed(4, 2);
        assert_eq!(failed.code(), HEALTH_COMMAND_FAILED);
        assert_eq!(
            failed.to_string(),
            "[950] Command Retries Exhausted (dp 4, 2 attempt(s))"
        );
    }
}
