//! Error types for Synheart Nap

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::SessionState;

/// Errors surfaced by the nap engine.
///
/// Sensor noise and transient link loss are absorbed internally and never show
/// up here; only caller mistakes, exhausted retries and protocol violations do.
#[derive(Debug, Error)]
pub enum NapError {
    #[error("Out-of-order sample: {received} is not after {previous}")]
    OutOfOrderSample {
        previous: DateTime<Utc>,
        received: DateTime<Utc>,
    },

    #[error("Invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: Option<SessionState>,
        to: SessionState,
    },

    #[error("Link delivery failed for message {sequence_number} after {attempts} attempts")]
    LinkDeliveryFailed { sequence_number: u64, attempts: u32 },

    #[error("A nap session is already active: {0}")]
    SessionAlreadyActive(uuid::Uuid),

    #[error("No active nap session")]
    NoActiveSession,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported wire version: {0}")]
    UnsupportedWireVersion(u16),

    #[error("Wire codec error: {0}")]
    Codec(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NapError>;
