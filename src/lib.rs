//! Synheart Nap - On-device nap detection and nap session engine
//!
//! Nap turns a stream of wrist sensor samples into sleep/wake judgments and runs
//! nap sessions on top of them: window buffering → classification → session
//! state machine → reliable relay to the paired device.
//!
//! ## Modules
//!
//! - **Signal pipeline**: `window`, `normalizer`, `classifier`
//! - **Sessions**: `session` (lifecycle), `orchestrator` (per-device wiring)
//! - **Watch link**: `wire` (frame codec), `link` (acks, retries, ordering, liveness)
//!
//! The engine performs no I/O and reads no clock: callers pass `now` and move
//! frames between devices themselves.

pub mod classifier;
pub mod config;
pub mod error;
pub mod link;
pub mod normalizer;
pub mod orchestrator;
pub mod session;
pub mod types;
pub mod window;
pub mod wire;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use classifier::SleepStateClassifier;
pub use config::{LinkConfig, NapConfig};
pub use error::NapError;
pub use link::{LinkChannel, LinkEvent, LinkStatus};
pub use orchestrator::{OrchestratorEvent, SessionOrchestrator};
pub use session::NapSessionStateMachine;
pub use types::{
    ClassificationResult, EndReason, NapSession, Role, SensorSample, SessionState, SleepState,
};
pub use window::SignalWindowBuffer;
pub use wire::{WatchMessage, WIRE_VERSION};

/// Library version
pub const NAP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI
pub const PRODUCER_NAME: &str = "synheart-nap";
