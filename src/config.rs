//! Engine configuration
//!
//! A single [`NapConfig`] is built once at startup and handed to the window
//! buffer, classifier, state machine and link channel. Durations are expressed
//! in whole seconds so the JSON form stays readable.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{NapError, Result};

/// Ceiling for every configured duration. Keeps deadlines derived from a
/// timestamp well inside chrono's range.
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 3600;

/// Resends allowed per message
pub const MAX_RETRIES: u32 = 100;

/// Inclusive bounds for a physiological signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalBounds {
    pub min: f64,
    pub max: f64,
}

impl SignalBounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Width of the range
    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

/// Relative weights used to combine the per-signal scores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub heart_rate: f64,
    pub hrv: f64,
    pub motion: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            heart_rate: 1.0,
            hrv: 1.0,
            motion: 1.0,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> f64 {
        self.heart_rate + self.hrv + self.motion
    }
}

/// Reliable link parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Resends after the first transmission before a message is given up
    pub max_retries: u32,
    /// Time to wait for an Ack before resending (seconds)
    pub timeout_secs: u64,
    /// Idle time after which a heartbeat is sent (seconds)
    pub heartbeat_interval_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_secs: 10,
            heartbeat_interval_secs: 60,
        }
    }
}

impl LinkConfig {
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        seconds(self.heartbeat_interval_secs)
    }

    /// Silence from the peer longer than this marks the link disconnected
    pub fn disconnect_after(&self) -> Duration {
        self.heartbeat_interval() * 2
    }

    /// Time a sender keeps retrying one message before it gives up
    pub fn retry_horizon(&self) -> Duration {
        let transmissions = u64::from(self.max_retries) + 1;
        seconds(self.timeout_secs.saturating_mul(transmissions))
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 || self.heartbeat_interval_secs == 0 {
            return Err(invalid("link timeout and heartbeat interval must be positive"));
        }
        if self.max_retries > MAX_RETRIES {
            return Err(invalid(&format!("link max_retries must not exceed {MAX_RETRIES}")));
        }
        let horizon = self
            .timeout_secs
            .checked_mul(u64::from(self.max_retries) + 1);
        if horizon.map_or(true, |secs| secs > MAX_DURATION_SECS) {
            return Err(invalid("link timeout across all retries must not exceed one week"));
        }
        // Twice the heartbeat interval is the disconnect threshold
        if self.heartbeat_interval_secs > MAX_DURATION_SECS / 2 {
            return Err(invalid("link heartbeat_interval_secs must not exceed half a week"));
        }
        Ok(())
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NapConfig {
    pub window_size_secs: u64,
    pub minimum_data_points: usize,
    pub confidence_threshold: f64,
    pub heart_rate: SignalBounds,
    pub hrv: SignalBounds,
    pub max_motion: f64,
    pub weights: ScoreWeights,
    pub min_nap_duration_secs: u64,
    pub default_nap_duration_secs: u64,
    pub max_nap_duration_secs: u64,
    pub wake_window_secs: u64,
    pub monitoring_interval_secs: u64,
    /// Minimum time in Monitoring before sleep may be declared
    pub settle_period_secs: u64,
    /// Signal silence tolerated before a session is aborted for starvation
    pub starvation_grace_secs: u64,
    /// Consecutive Awake classifications that count as a natural wake
    pub sustained_awake_count: u32,
    pub link: LinkConfig,
}

impl Default for NapConfig {
    fn default() -> Self {
        Self {
            window_size_secs: 30,
            minimum_data_points: 5,
            confidence_threshold: 0.7,
            heart_rate: SignalBounds::new(40.0, 200.0),
            hrv: SignalBounds::new(5.0, 200.0),
            max_motion: 10.0,
            weights: ScoreWeights::default(),
            min_nap_duration_secs: 10 * 60,
            default_nap_duration_secs: 90 * 60,
            max_nap_duration_secs: 180 * 60,
            wake_window_secs: 10 * 60,
            monitoring_interval_secs: 30,
            settle_period_secs: 20,
            starvation_grace_secs: 120,
            sustained_awake_count: 3,
            link: LinkConfig::default(),
        }
    }
}

impl NapConfig {
    /// Load and validate a configuration from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check internal consistency of all parameters
    pub fn validate(&self) -> Result<()> {
        if self.window_size_secs == 0 {
            return Err(invalid("window_size_secs must be positive"));
        }
        if self.minimum_data_points == 0 {
            return Err(invalid("minimum_data_points must be at least 1"));
        }
        if !(self.confidence_threshold > 0.5 && self.confidence_threshold <= 1.0) {
            return Err(invalid("confidence_threshold must be in (0.5, 1.0]"));
        }
        for (name, bounds) in [("heart_rate", self.heart_rate), ("hrv", self.hrv)] {
            if !(bounds.min.is_finite() && bounds.max.is_finite() && bounds.min < bounds.max) {
                return Err(invalid(&format!("{name} bounds must satisfy min < max")));
            }
        }
        if !(self.max_motion.is_finite() && self.max_motion > 0.0) {
            return Err(invalid("max_motion must be positive"));
        }
        let w = self.weights;
        if [w.heart_rate, w.hrv, w.motion]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
            || w.total() <= 0.0
        {
            return Err(invalid("weights must be non-negative with a positive sum"));
        }
        if !(self.min_nap_duration_secs > 0
            && self.min_nap_duration_secs <= self.default_nap_duration_secs
            && self.default_nap_duration_secs <= self.max_nap_duration_secs)
        {
            return Err(invalid("nap durations must satisfy 0 < min <= default <= max"));
        }
        for (name, secs) in [
            ("window_size_secs", self.window_size_secs),
            ("max_nap_duration_secs", self.max_nap_duration_secs),
            ("monitoring_interval_secs", self.monitoring_interval_secs),
            ("settle_period_secs", self.settle_period_secs),
            ("starvation_grace_secs", self.starvation_grace_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(invalid(&format!("{name} must not exceed one week")));
            }
        }
        if self.wake_window_secs > self.max_nap_duration_secs {
            return Err(invalid("wake_window_secs must not exceed max nap duration"));
        }
        if self.monitoring_interval_secs == 0 {
            return Err(invalid("monitoring_interval_secs must be positive"));
        }
        if self.starvation_grace_secs == 0 {
            return Err(invalid("starvation_grace_secs must be positive"));
        }
        if self.sustained_awake_count == 0 {
            return Err(invalid("sustained_awake_count must be at least 1"));
        }
        self.link.validate()
    }

    pub fn window_size(&self) -> Duration {
        seconds(self.window_size_secs)
    }

    pub fn motion_bounds(&self) -> SignalBounds {
        SignalBounds::new(0.0, self.max_motion)
    }

    pub fn wake_window(&self) -> Duration {
        seconds(self.wake_window_secs)
    }

    pub fn monitoring_interval(&self) -> Duration {
        seconds(self.monitoring_interval_secs)
    }

    pub fn settle_period(&self) -> Duration {
        seconds(self.settle_period_secs)
    }

    pub fn starvation_grace(&self) -> Duration {
        seconds(self.starvation_grace_secs)
    }

    pub fn max_nap_duration(&self) -> Duration {
        seconds(self.max_nap_duration_secs)
    }

    /// Clamp a requested nap length into the allowed range, using the default
    /// when none was requested.
    pub fn clamp_nap_duration(&self, requested_secs: Option<u64>) -> u64 {
        requested_secs
            .unwrap_or(self.default_nap_duration_secs)
            .clamp(self.min_nap_duration_secs, self.max_nap_duration_secs)
    }
}

/// Whole seconds as a chrono duration, saturating at [`MAX_DURATION_SECS`]
pub(crate) fn seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

fn invalid(msg: &str) -> NapError {
    NapError::InvalidConfig(msg.to_string())
}
