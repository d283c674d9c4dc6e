//! Signal normalization
//!
//! Raw sensor readings are clamped to their configured bounds and mapped onto a
//! common 0-1 "asleep-ness" scale:
//! - Heart rate: lower is more asleep (inverted)
//! - HRV: higher is more asleep
//! - Motion: stiller is more asleep (inverted)
//!
//! Out-of-range readings are sensor noise, not errors. They are clamped, never
//! dropped, so a single bad reading cannot stall classification.

use crate::config::{NapConfig, SignalBounds};

/// Clamp a raw value into `bounds`. NaN maps to the lower bound.
pub fn clamp_to(raw: f64, bounds: SignalBounds) -> f64 {
    if raw.is_nan() {
        return bounds.min;
    }
    raw.clamp(bounds.min, bounds.max)
}

/// Map a raw value to [0, 1] by linear interpolation between the bounds.
///
/// With `invert` set, the lower bound scores 1 and the upper bound scores 0.
pub fn normalize(raw: f64, bounds: SignalBounds, invert: bool) -> f64 {
    let span = bounds.span();
    if span <= 0.0 {
        return 0.0;
    }
    let position = (clamp_to(raw, bounds) - bounds.min) / span;
    let score = if invert { 1.0 - position } else { position };
    score.clamp(0.0, 1.0)
}

pub fn clamp_heart_rate(raw: f64, config: &NapConfig) -> f64 {
    clamp_to(raw, config.heart_rate)
}

pub fn clamp_hrv(raw: f64, config: &NapConfig) -> f64 {
    clamp_to(raw, config.hrv)
}

pub fn clamp_motion(raw: f64, config: &NapConfig) -> f64 {
    clamp_to(raw, config.motion_bounds())
}

/// Heart-rate score: 1 at the resting floor, 0 at the ceiling
pub fn heart_rate_score(raw: f64, config: &NapConfig) -> f64 {
    normalize(raw, config.heart_rate, true)
}

/// HRV score: rises with variability
pub fn hrv_score(raw: f64, config: &NapConfig) -> f64 {
    normalize(raw, config.hrv, false)
}

/// Motion score: 1 when perfectly still
pub fn motion_score(raw: f64, config: &NapConfig) -> f64 {
    normalize(raw, config.motion_bounds(), true)
}
