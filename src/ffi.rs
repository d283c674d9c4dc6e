//! FFI bindings for Synheart Nap
//!
//! This module provides C-compatible functions for driving a nap orchestrator
//! from the host app (watch or phone). Strings are null-terminated UTF-8;
//! structured values travel as JSON. Returned strings are allocated here and
//! must be freed with `nap_free_string`.
//!
//! Time is passed in as Unix epoch milliseconds (`now_ms`). The handle wraps
//! the orchestrator in a mutex, so it may be shared between the sensor callback
//! thread and the UI thread.

use chrono::{DateTime, TimeZone, Utc};
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::Mutex;

use crate::config::NapConfig;
use crate::orchestrator::SessionOrchestrator;
use crate::types::{Role, SensorSample};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn timestamp(now_ms: i64) -> Result<DateTime<Utc>, String> {
    Utc.timestamp_millis_opt(now_ms)
        .single()
        .ok_or_else(|| format!("Timestamp out of range: {now_ms}"))
}

/// Opaque handle to a SessionOrchestrator
pub struct NapOrchestratorHandle {
    orchestrator: Mutex<SessionOrchestrator>,
}

/// Lock the handle and run `f`, recording any failure as the last error
unsafe fn with_orchestrator<T>(
    handle: *mut NapOrchestratorHandle,
    f: impl FnOnce(&mut SessionOrchestrator) -> Result<T, String>,
) -> Option<T> {
    clear_last_error();

    if handle.is_null() {
        set_last_error("Null orchestrator pointer");
        return None;
    }
    let handle = &*handle;
    let mut orchestrator = match handle.orchestrator.lock() {
        Ok(guard) => guard,
        Err(_) => {
            set_last_error("Orchestrator lock poisoned");
            return None;
        }
    };
    match f(&mut orchestrator) {
        Ok(value) => Some(value),
        Err(msg) => {
            set_last_error(&msg);
            None
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Create an orchestrator.
///
/// # Safety
/// - `role` must be a valid null-terminated C string: "sensor", "controller"
///   or "standalone".
/// - `config_json` may be NULL for the default configuration; otherwise it must
///   be a valid null-terminated C string. Missing fields take defaults.
/// - Returns NULL on error; call `nap_last_error` to get the error message.
/// - Must be freed with `nap_orchestrator_free`.
#[no_mangle]
pub unsafe extern "C" fn nap_orchestrator_new(
    role: *const c_char,
    config_json: *const c_char,
    now_ms: i64,
) -> *mut NapOrchestratorHandle {
    clear_last_error();

    let role: Role = match cstr_to_string(role).map(|s| s.parse()) {
        Some(Ok(role)) => role,
        Some(Err(msg)) => {
            set_last_error(&msg);
            return ptr::null_mut();
        }
        None => {
            set_last_error("Invalid role string pointer");
            return ptr::null_mut();
        }
    };

    let config = if config_json.is_null() {
        NapConfig::default()
    } else {
        let parsed = cstr_to_string(config_json)
            .ok_or_else(|| "Invalid config string pointer".to_string())
            .and_then(|json| NapConfig::from_json(&json).map_err(|e| e.to_string()));
        match parsed {
            Ok(config) => config,
            Err(msg) => {
                set_last_error(&msg);
                return ptr::null_mut();
            }
        }
    };

    let created = timestamp(now_ms)
        .and_then(|now| SessionOrchestrator::new(role, config, now).map_err(|e| e.to_string()));
    match created {
        Ok(orchestrator) => Box::into_raw(Box::new(NapOrchestratorHandle {
            orchestrator: Mutex::new(orchestrator),
        })),
        Err(msg) => {
            set_last_error(&msg);
            ptr::null_mut()
        }
    }
}

/// Free an orchestrator.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `nap_orchestrator_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn nap_orchestrator_free(handle: *mut NapOrchestratorHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

// ============================================================================
// Inputs
// ============================================================================

/// Ingest one sensor sample (JSON `SensorSample`) and return the
/// classification result as JSON.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `nap_orchestrator_new`.
/// - `sample_json` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `nap_free_string`.
/// - Returns NULL on error; call `nap_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn nap_ingest_sample(
    handle: *mut NapOrchestratorHandle,
    sample_json: *const c_char,
    now_ms: i64,
) -> *mut c_char {
    let json = cstr_to_string(sample_json);
    with_orchestrator(handle, |orchestrator| {
        let json = json.ok_or_else(|| "Invalid sample string pointer".to_string())?;
        let sample: SensorSample = serde_json::from_str(&json).map_err(|e| e.to_string())?;
        let result = orchestrator
            .ingest_sample(sample, timestamp(now_ms)?)
            .map_err(|e| e.to_string())?;
        serde_json::to_string(&result).map_err(|e| e.to_string())
    })
    .map_or(ptr::null_mut(), |json| string_to_cstr(&json))
}

/// Schedule a nap and start monitoring. Returns the new session id.
///
/// `duration_secs <= 0` requests the configured default duration.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `nap_orchestrator_new`.
/// - Returns a newly allocated string that must be freed with `nap_free_string`.
/// - Returns NULL on error; call `nap_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn nap_schedule_nap(
    handle: *mut NapOrchestratorHandle,
    duration_secs: i64,
    now_ms: i64,
) -> *mut c_char {
    let requested = u64::try_from(duration_secs).ok().filter(|secs| *secs > 0);
    with_orchestrator(handle, |orchestrator| {
        orchestrator
            .schedule_nap(requested, timestamp(now_ms)?)
            .map_err(|e| e.to_string())
    })
    .map_or(ptr::null_mut(), |id| string_to_cstr(&id.to_string()))
}

/// Cancel the active nap.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `nap_orchestrator_new`.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn nap_cancel_nap(handle: *mut NapOrchestratorHandle, now_ms: i64) -> i32 {
    with_orchestrator(handle, |orchestrator| {
        orchestrator
            .cancel_nap(timestamp(now_ms)?)
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
    .map_or(-1, |_| 0)
}

/// Hand a frame received from the peer device to the engine.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `nap_orchestrator_new`.
/// - `data` must point to `len` readable bytes.
/// - Returns 0 on success, -1 on error (the frame is discarded).
#[no_mangle]
pub unsafe extern "C" fn nap_receive_frame(
    handle: *mut NapOrchestratorHandle,
    data: *const u8,
    len: usize,
    now_ms: i64,
) -> i32 {
    if data.is_null() {
        set_last_error("Null frame pointer");
        return -1;
    }
    let frame = std::slice::from_raw_parts(data, len);
    with_orchestrator(handle, |orchestrator| {
        orchestrator
            .receive_frame(frame, timestamp(now_ms)?)
            .map_err(|e| e.to_string())
    })
    .map_or(-1, |_| 0)
}

/// Drive retries, heartbeats and session deadlines.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `nap_orchestrator_new`.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn nap_tick(handle: *mut NapOrchestratorHandle, now_ms: i64) -> i32 {
    with_orchestrator(handle, |orchestrator| {
        orchestrator
            .tick(timestamp(now_ms)?)
            .map_err(|e| e.to_string())
    })
    .map_or(-1, |_| 0)
}

// ============================================================================
// Outputs
// ============================================================================

/// Drain pending UI events as a JSON array.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `nap_orchestrator_new`.
/// - Returns a newly allocated string that must be freed with `nap_free_string`.
#[no_mangle]
pub unsafe extern "C" fn nap_drain_events(handle: *mut NapOrchestratorHandle) -> *mut c_char {
    with_orchestrator(handle, |orchestrator| {
        serde_json::to_string(&orchestrator.drain_events()).map_err(|e| e.to_string())
    })
    .map_or(ptr::null_mut(), |json| string_to_cstr(&json))
}

/// Drain frames to send to the peer as a JSON array of strings.
///
/// Each element is one frame, to be written to the transport as UTF-8 bytes.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `nap_orchestrator_new`.
/// - Returns a newly allocated string that must be freed with `nap_free_string`.
#[no_mangle]
pub unsafe extern "C" fn nap_drain_outbound(handle: *mut NapOrchestratorHandle) -> *mut c_char {
    with_orchestrator(handle, |orchestrator| {
        let frames = orchestrator
            .drain_outbound()
            .into_iter()
            .map(|frame| String::from_utf8(frame).map_err(|e| e.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        serde_json::to_string(&frames).map_err(|e| e.to_string())
    })
    .map_or(ptr::null_mut(), |json| string_to_cstr(&json))
}

/// Current or most recently finished session as JSON (`null` if none).
///
/// # Safety
/// - `handle` must be a valid pointer returned by `nap_orchestrator_new`.
/// - Returns a newly allocated string that must be freed with `nap_free_string`.
#[no_mangle]
pub unsafe extern "C" fn nap_session(handle: *mut NapOrchestratorHandle) -> *mut c_char {
    with_orchestrator(handle, |orchestrator| {
        serde_json::to_string(&orchestrator.session()).map_err(|e| e.to_string())
    })
    .map_or(ptr::null_mut(), |json| string_to_cstr(&json))
}

/// When `nap_tick` should next be called (epoch ms), or -1 if nothing is pending.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `nap_orchestrator_new`.
#[no_mangle]
pub unsafe extern "C" fn nap_next_wakeup_ms(handle: *mut NapOrchestratorHandle) -> i64 {
    with_orchestrator(handle, |orchestrator| Ok(orchestrator.next_wakeup()))
        .flatten()
        .map_or(-1, |at| at.timestamp_millis())
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by Nap functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Nap function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn nap_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next Nap function call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn nap_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn nap_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
