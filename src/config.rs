//! Engine configuration
//!
//! All thresholds used by the pipeline live here so hosts can tune them from a
//! TOML file. Every section falls back to its defaults when omitted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TelemetryError;

/// Longest accepted inactivity timeout (7 days)
pub const MAX_INACTIVITY_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Longest accepted history lookback (10 years)
pub const MAX_HISTORY_LOOKBACK_DAYS: i64 = 3_650;

/// Longest accepted wait for a history source
pub const MAX_HISTORY_TIMEOUT_MS: u64 = 60_000;

/// What `start_session` does when the same user already has an active session
/// on the same activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveSessionPolicy {
    /// Fail with `DuplicateActiveSession`
    Reject,
    /// Return the id of the existing active session
    Resume,
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub stats: StatsConfig,
    pub monitor: MonitorConfig,
    pub persistence: PersistenceConfig,
    pub serialization: SerializationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub active_session_policy: ActiveSessionPolicy,
    /// Active sessions idle for longer than this are finalized as abandoned
    pub inactivity_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            active_session_policy: ActiveSessionPolicy::Resume,
            inactivity_timeout_secs: 900,
        }
    }
}

/// Windowed statistics thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Gap between consecutive events counted as a distraction
    pub distraction_gap_ms: i64,
    /// Gap between consecutive events recorded as a pause
    pub pause_gap_ms: i64,
    /// Trailing outcome window inspected for fatigue
    pub fatigue_window: usize,
    /// Minimum outcome events in the trailing window before fatigue is computed
    pub fatigue_min_events: usize,
    /// Minimum outcome events before a trend is computed
    pub trend_min_events: usize,
    /// Width of the sliding window used for consistency
    pub consistency_window: usize,
    /// Only the last N response times feed variability (all when unset)
    pub variability_window: Option<usize>,
    /// Errors answered faster than this count as impulsive
    pub impulsive_response_ms: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            distraction_gap_ms: 30_000,
            pause_gap_ms: 5_000,
            fatigue_window: 20,
            fatigue_min_events: 10,
            trend_min_events: 5,
            consistency_window: 5,
            variability_window: None,
            impulsive_response_ms: 500.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

/// Retry, cache and history settings for the persistence boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Reports kept in memory while waiting to be saved
    pub cache_capacity: usize,
    pub history_lookback_days: i64,
    pub history_limit: usize,
    /// How long `end_session` waits for each history source
    pub history_timeout_ms: u64,
    /// Directory for the local fallback store
    pub fallback_dir: Option<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            cache_capacity: 100,
            history_lookback_days: 30,
            history_limit: 10,
            history_timeout_ms: 2_000,
            fallback_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializationConfig {
    pub max_depth: usize,
}

impl Default for SerializationConfig {
    fn default() -> Self {
        Self { max_depth: 8 }
    }
}

impl EngineConfig {
    /// Parse configuration from a TOML string and validate it
    pub fn from_toml_str(raw: &str) -> Result<Self, TelemetryError> {
        let config: EngineConfig =
            toml::from_str(raw).map_err(|e| TelemetryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TelemetryError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<(), TelemetryError> {
        let stats = &self.stats;
        if stats.distraction_gap_ms <= 0 || stats.pause_gap_ms <= 0 {
            return Err(TelemetryError::Config(
                "gap thresholds must be positive".to_string(),
            ));
        }
        if stats.fatigue_min_events < 2 || stats.fatigue_window < stats.fatigue_min_events {
            return Err(TelemetryError::Config(
                "fatigue_window must be >= fatigue_min_events >= 2".to_string(),
            ));
        }
        if stats.trend_min_events < 3 {
            return Err(TelemetryError::Config(
                "trend_min_events must be at least 3".to_string(),
            ));
        }
        if stats.consistency_window == 0 {
            return Err(TelemetryError::Config(
                "consistency_window must be positive".to_string(),
            ));
        }
        let timeout = self.session.inactivity_timeout_secs;
        if timeout == 0 || timeout > MAX_INACTIVITY_TIMEOUT_SECS {
            return Err(TelemetryError::Config(format!(
                "inactivity_timeout_secs must be in 1..={MAX_INACTIVITY_TIMEOUT_SECS}, got {timeout}"
            )));
        }
        if self.monitor.interval_secs == 0 {
            return Err(TelemetryError::Config(
                "monitor interval must be positive".to_string(),
            ));
        }
        let persistence = &self.persistence;
        if persistence.max_attempts == 0 || persistence.cache_capacity == 0 {
            return Err(TelemetryError::Config(
                "max_attempts and cache_capacity must be positive".to_string(),
            ));
        }
        if persistence.base_delay_ms > persistence.max_delay_ms {
            return Err(TelemetryError::Config(
                "base_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        let lookback = persistence.history_lookback_days;
        if !(0..=MAX_HISTORY_LOOKBACK_DAYS).contains(&lookback) {
            return Err(TelemetryError::Config(format!(
                "history_lookback_days must be in 0..={MAX_HISTORY_LOOKBACK_DAYS}, got {lookback}"
            )));
        }
        let history_timeout = persistence.history_timeout_ms;
        if history_timeout == 0 || history_timeout > MAX_HISTORY_TIMEOUT_MS {
            return Err(TelemetryError::Config(format!(
                "history_timeout_ms must be in 1..={MAX_HISTORY_TIMEOUT_MS}, got {history_timeout}"
            )));
        }
        if self.serialization.max_depth == 0 {
            return Err(TelemetryError::Config(
                "serialization max_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
