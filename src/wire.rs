//! Watch link wire format
//!
//! Messages travel as UTF-8 JSON inside a versioned frame:
//!
//! ```text
//! {"v":1,"message":{"sequence_number":7,"kind":{"session_event":{...}},"sent_at":"..."}}
//! ```
//!
//! Field order follows the struct definitions, so encoding is deterministic.
//! Decoders ignore unknown fields, which lets newer peers add fields without
//! breaking older ones. A frame whose version is newer than [`WIRE_VERSION`]
//! is rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NapError, Result};
use crate::types::{ClassificationResult, SessionUpdate, SleepState};

/// Current wire format version
pub const WIRE_VERSION: u16 = 1;

/// Classification summary relayed from the sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub state: SleepState,
    pub confidence: f64,
    pub window_end_time: DateTime<Utc>,
}

impl From<&ClassificationResult> for ClassificationReport {
    fn from(result: &ClassificationResult) -> Self {
        Self {
            state: result.state,
            confidence: result.confidence,
            window_end_time: result.window_end_time,
        }
    }
}

/// Message kind and payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ClassificationEvent(ClassificationReport),
    SessionEvent(SessionUpdate),
    Heartbeat,
    Ack { acked_sequence_number: u64 },
}

impl MessageKind {
    /// Whether the peer must acknowledge this message
    pub fn is_reliable(&self) -> bool {
        matches!(
            self,
            MessageKind::ClassificationEvent(_) | MessageKind::SessionEvent(_)
        )
    }

    /// Session the payload refers to, if any
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            MessageKind::SessionEvent(update) => Some(update.session_id),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::ClassificationEvent(_) => "classification_event",
            MessageKind::SessionEvent(_) => "session_event",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Ack { .. } => "ack",
        }
    }
}

/// One message on the link
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WatchMessage {
    pub sequence_number: u64,
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct FrameOut<'a> {
    v: u16,
    message: &'a WatchMessage,
}

#[derive(Deserialize)]
struct FrameVersion {
    v: u16,
}

#[derive(Deserialize)]
struct FrameIn {
    message: WatchMessage,
}

impl WatchMessage {
    /// Encode into a versioned frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        let frame = FrameOut {
            v: WIRE_VERSION,
            message: self,
        };
        serde_json::to_vec(&frame).map_err(|e| NapError::Codec(e.to_string()))
    }

    /// Decode a versioned frame
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let version: FrameVersion =
            serde_json::from_slice(bytes).map_err(|e| NapError::Codec(e.to_string()))?;
        if version.v == 0 || version.v > WIRE_VERSION {
            return Err(NapError::UnsupportedWireVersion(version.v));
        }
        let frame: FrameIn =
            serde_json::from_slice(bytes).map_err(|e| NapError::Codec(e.to_string()))?;
        Ok(frame.message)
    }
}
