//! Engine tunables.
//!
//! The wake-up margins, resync cadence and release grace period were tuned
//! empirically on real hardware. They are policy, not invariants, so they
//! live here instead of as constants in the engine.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Scheduler and lifecycle tunables for the endpoint engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an unused endpoint lingers before it is released.
    pub release_grace_period_ms: u64,
    /// Re-anchor the time model on every loop while fewer spans than this
    /// have been handled since the device position was reset.
    pub startup_resync_loops: u64,
    /// After start-up, re-anchor once every this many spans.
    pub resync_interval_loops: u64,
    /// Wake-ahead margin as a fraction of one span duration.
    pub ahead_numerator: u32,
    pub ahead_denominator: u32,
    /// Lower bound of the wake-ahead margin.
    pub min_ahead_ns: i64,
    /// When a client is late, sleep until this long before the hardware read.
    pub unready_wait_ahead_ns: i64,
    /// Device buffers with spans this long or longer are rejected.
    pub max_span_duration_ns: i64,
    /// Streams one endpoint may link at once.
    pub max_linked_streams: usize,
    /// Start the device on the first link even if no stream is running yet.
    pub device_running_in_idle: bool,
    /// Work-loop wait while the endpoint has nothing to run.
    pub idle_wait_ms: u64,
    /// Wake-ups later than this are logged.
    pub late_wakeup_tolerance_ns: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            release_grace_period_ms: 30_000,
            startup_resync_loops: 20,
            resync_interval_loops: 40,
            ahead_numerator: 3,
            ahead_denominator: 4,
            min_ahead_ns: 1_000_000,
            unready_wait_ahead_ns: 1_000_000,
            max_span_duration_ns: 100_000_000,
            max_linked_streams: 10,
            device_running_in_idle: true,
            idle_wait_ms: 400,
            late_wakeup_tolerance_ns: 1_000_000,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields fall back to defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ahead_denominator == 0 {
            return Err(Error::invalid_param("ahead_denominator is zero"));
        }
        if self.ahead_numerator >= self.ahead_denominator {
            return Err(Error::invalid_param(format!(
                "wake-ahead ratio {}/{} must be below one span",
                self.ahead_numerator, self.ahead_denominator
            )));
        }
        if self.max_linked_streams == 0 {
            return Err(Error::invalid_param("max_linked_streams is zero"));
        }
        if self.resync_interval_loops == 0 {
            return Err(Error::invalid_param("resync_interval_loops is zero"));
        }
        if self.min_ahead_ns < 0 || self.unready_wait_ahead_ns < 0 || self.max_span_duration_ns <= 0 {
            return Err(Error::invalid_param("negative timing tunable"));
        }
        Ok(())
    }

    pub const fn release_grace_period(&self) -> Duration {
        Duration::from_millis(self.release_grace_period_ms)
    }

    pub const fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    /// Wake-ahead margin for a span of `span_duration_ns`.
    pub fn ahead_margin_ns(&self, span_duration_ns: i64) -> i64 {
        let scaled = span_duration_ns / i64::from(self.ahead_denominator)
            * i64::from(self.ahead_numerator);
        scaled.max(self.min_ahead_ns)
    }

    /// Whether the loop handling span number `span_index` should re-anchor.
    pub const fn should_resync(&self, span_index: u64) -> bool {
        span_index < self.startup_resync_loops || span_index % self.resync_interval_loops == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_ahead_margin() {
        let config = EngineConfig::default();
        // 20ms span -> 15ms ahead
        assert_eq!(config.ahead_margin_ns(20_000_000), 15_000_000);
        // 1ms span -> floored at 1ms
        assert_eq!(config.ahead_margin_ns(1_000_000), 1_000_000);
    }

    #[test]
    fn test_resync_schedule() {
        let config = EngineConfig::default();
        assert!(config.should_resync(0));
        assert!(config.should_resync(19));
        assert!(!config.should_resync(20));
        assert!(!config.should_resync(41));
        assert!(config.should_resync(40));
        assert!(config.should_resync(80));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(r#"{"release_grace_period_ms": 50}"#).unwrap();
        assert_eq!(config.release_grace_period(), Duration::from_millis(50));
        assert_eq!(config.max_linked_streams, 10);
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let err = EngineConfig::from_json_str(r#"{"ahead_numerator": 4, "ahead_denominator": 4}"#)
            .unwrap_err();
        assert!(err.is_invalid_param());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_linked_streams": 4, "idle_wait_ms": 10}}"#).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.max_linked_streams, 4);
        assert_eq!(config.idle_wait(), Duration::from_millis(10));
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/nonexistent/mixd.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
