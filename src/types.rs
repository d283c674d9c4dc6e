//! Core types for the Synheart Nap engine
//!
//! This module defines the data that flows between stages: raw sensor samples,
//! classification results, nap sessions and the state-change events the
//! presentation layer observes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::seconds;

/// A single raw reading from the wrist sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub timestamp: DateTime<Utc>,
    /// Heart rate (bpm)
    pub heart_rate: f64,
    /// Heart-rate variability (RMSSD, ms)
    pub hrv: f64,
    /// Motion magnitude (device units)
    pub motion: f64,
}

impl SensorSample {
    pub fn new(timestamp: DateTime<Utc>, heart_rate: f64, hrv: f64, motion: f64) -> Self {
        Self {
            timestamp,
            heart_rate,
            hrv,
            motion,
        }
    }
}

/// Sleep/wake judgment for one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepState {
    Awake,
    Asleep,
    Indeterminate,
}

/// Output of the classifier for one window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub window_end_time: DateTime<Utc>,
    pub state: SleepState,
    /// Combined sleep score in [0, 1]; high means asleep
    pub confidence: f64,
    pub sample_count: usize,
}

impl ClassificationResult {
    pub fn indeterminate(window_end_time: DateTime<Utc>, sample_count: usize) -> Self {
        Self {
            window_end_time,
            state: SleepState::Indeterminate,
            confidence: 0.0,
            sample_count,
        }
    }
}

/// Lifecycle state of a nap session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Scheduled,
    Monitoring,
    SleepDetected,
    WakeWindow,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Scheduled, Monitoring)
            | (Monitoring, SleepDetected)
            | (SleepDetected, WakeWindow)
            | (WakeWindow, Completed) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Scheduled => "scheduled",
            SessionState::Monitoring => "monitoring",
            SessionState::SleepDetected => "sleep_detected",
            SessionState::WakeWindow => "wake_window",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    NaturalWake,
    TimedWake,
    TimedOutWaitingForSleep,
    UserCancelled,
    DataStarvation,
    LinkDeliveryFailed,
    PeerDesynchronized,
}

impl EndReason {
    /// Human-readable explanation for the presentation layer
    pub fn describe(&self) -> &'static str {
        match self {
            EndReason::NaturalWake => "You woke up naturally near the end of your nap.",
            EndReason::TimedWake => "Your nap time is up.",
            EndReason::TimedOutWaitingForSleep => {
                "No sleep was detected before the nap time ran out."
            }
            EndReason::UserCancelled => "The nap was cancelled.",
            EndReason::DataStarvation => {
                "The nap stopped because sensor data from the watch was lost."
            }
            EndReason::LinkDeliveryFailed => {
                "The nap stopped because the watch and phone could not stay in sync."
            }
            EndReason::PeerDesynchronized => {
                "The nap stopped because the watch and phone disagreed about its state."
            }
        }
    }
}

/// A single nap attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NapSession {
    pub id: Uuid,
    /// Planned sleep time after sleep onset (seconds), already clamped
    pub scheduled_duration_secs: u64,
    pub state: SessionState,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub sleep_detected_at: Option<DateTime<Utc>>,
    pub wake_window_deadline: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl NapSession {
    pub fn scheduled_duration(&self) -> Duration {
        seconds(self.scheduled_duration_secs)
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// State-change event emitted for every session transition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionTransition {
    pub session_id: Uuid,
    /// `None` when the session was just created
    pub from: Option<SessionState>,
    pub to: SessionState,
    pub at: DateTime<Utc>,
    pub reason: Option<EndReason>,
}

/// A session decision as relayed to the peer device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub session_id: Uuid,
    pub new_state: SessionState,
    pub reason: Option<EndReason>,
    pub at: DateTime<Utc>,
    /// Present on `Scheduled` so the peer can create the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_duration_secs: Option<u64>,
}

impl SessionUpdate {
    pub fn from_transition(transition: &SessionTransition, scheduled_duration_secs: u64) -> Self {
        Self {
            session_id: transition.session_id,
            new_state: transition.to,
            reason: transition.reason,
            at: transition.at,
            scheduled_duration_secs: (transition.to == SessionState::Scheduled)
                .then_some(scheduled_duration_secs),
        }
    }
}

/// Which side of the pairing an orchestrator runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Wrist unit: authoritative for classification
    Sensor,
    /// Companion device: authoritative for timing and cancellation
    Controller,
    /// Single device doing both, without a link
    Standalone,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sensor => "sensor",
            Role::Controller => "controller",
            Role::Standalone => "standalone",
        }
    }

    pub fn authority(&self) -> Authority {
        match self {
            Role::Sensor => Authority {
                classification: true,
                timing: false,
            },
            Role::Controller => Authority {
                classification: false,
                timing: true,
            },
            Role::Standalone => Authority {
                classification: true,
                timing: true,
            },
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sensor" => Ok(Role::Sensor),
            "controller" => Ok(Role::Controller),
            "standalone" => Ok(Role::Standalone),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Decisions a state machine instance is allowed to make on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authority {
    /// Sleep onset, natural wake and sensor starvation
    pub classification: bool,
    /// Deadline-driven transitions
    pub timing: bool,
}

impl Authority {
    pub const FULL: Authority = Authority {
        classification: true,
        timing: true,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(Scheduled.can_transition_to(Monitoring));
        assert!(Monitoring.can_transition_to(SleepDetected));
        assert!(SleepDetected.can_transition_to(WakeWindow));
        assert!(WakeWindow.can_transition_to(Completed));
        assert!(Scheduled.can_transition_to(Aborted));
        assert!(WakeWindow.can_transition_to(Aborted));

        assert!(!Monitoring.can_transition_to(Completed));
        assert!(!Scheduled.can_transition_to(SleepDetected));
        assert!(!Completed.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Monitoring));
        assert!(!Monitoring.can_transition_to(Monitoring));
    }

    #[test]
    fn test_role_parsing_and_authority() {
        assert_eq!("Sensor".parse::<Role>().unwrap(), Role::Sensor);
        assert!("watch".parse::<Role>().is_err());
        assert!(Role::Sensor.authority().classification);
        assert!(!Role::Sensor.authority().timing);
        assert!(Role::Controller.authority().timing);
        assert_eq!(Role::Standalone.authority(), Authority::FULL);
    }

    #[test]
    fn test_sample_serialization() {
        let json = r#"{"timestamp":"2024-01-15T14:00:00Z","heart_rate":52.0,"hrv":70.5,"motion":0.2}"#;
        let sample: SensorSample = serde_json::from_str(json).unwrap();
        assert_eq!(sample.heart_rate, 52.0);
        assert_eq!(sample.timestamp.to_rfc3339(), "2024-01-15T14:00:00+00:00");
    }

    #[test]
    fn test_end_reasons_are_described() {
        assert!(!EndReason::DataStarvation.describe().is_empty());
        let json = serde_json::to_string(&EndReason::TimedOutWaitingForSleep).unwrap();
        assert_eq!(json, "\"timed_out_waiting_for_sleep\"");
    }
}
