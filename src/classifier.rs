//! Sleep/wake classification
//!
//! Turns a window of samples into a confidence-scored judgment:
//! 1. Too few samples → Indeterminate with confidence 0
//! 2. Mean clamped heart rate, HRV and motion → per-signal scores in [0, 1]
//! 3. Weighted average of the scores → confidence
//! 4. Hysteresis band around the threshold → Asleep / Awake / Indeterminate
//!
//! The classifier holds only configuration, so identical windows always yield
//! identical results and recorded sessions can be replayed.

use serde::{Deserialize, Serialize};

use crate::config::NapConfig;
use crate::normalizer::{
    clamp_heart_rate, clamp_hrv, clamp_motion, heart_rate_score, hrv_score, motion_score,
};
use crate::types::{ClassificationResult, SleepState};
use crate::window::Window;

/// Per-signal scores for one window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalScores {
    pub heart_rate: f64,
    pub hrv: f64,
    pub motion: f64,
    /// Weighted combination of the three
    pub combined: f64,
}

/// Stateless window classifier
#[derive(Debug, Clone)]
pub struct SleepStateClassifier {
    config: NapConfig,
}

impl SleepStateClassifier {
    pub fn new(config: &NapConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Classify a window
    pub fn classify(&self, window: &Window<'_>) -> ClassificationResult {
        let sample_count = window.sample_count();
        let scores = match self.score(window) {
            Some(scores) => scores,
            None => return ClassificationResult::indeterminate(window.end_time(), sample_count),
        };

        ClassificationResult {
            window_end_time: window.end_time(),
            state: self.state_for(scores.combined),
            confidence: scores.combined,
            sample_count,
        }
    }

    /// Per-signal scores, or `None` when the window holds fewer than
    /// `minimum_data_points` samples
    pub fn score(&self, window: &Window<'_>) -> Option<SignalScores> {
        let samples = window.samples();
        if samples.len() < self.config.minimum_data_points {
            return None;
        }

        let n = samples.len() as f64;
        let config = &self.config;
        let mean_hr = samples
            .iter()
            .map(|s| clamp_heart_rate(s.heart_rate, config))
            .sum::<f64>()
            / n;
        let mean_hrv = samples.iter().map(|s| clamp_hrv(s.hrv, config)).sum::<f64>() / n;
        let mean_motion = samples
            .iter()
            .map(|s| clamp_motion(s.motion, config))
            .sum::<f64>()
            / n;

        let heart_rate = heart_rate_score(mean_hr, config);
        let hrv = hrv_score(mean_hrv, config);
        let motion = motion_score(mean_motion, config);

        let weights = config.weights;
        let combined = ((heart_rate * weights.heart_rate
            + hrv * weights.hrv
            + motion * weights.motion)
            / weights.total())
        .clamp(0.0, 1.0);

        Some(SignalScores {
            heart_rate,
            hrv,
            motion,
            combined,
        })
    }

    /// Apply the hysteresis band to a combined score
    pub fn state_for(&self, confidence: f64) -> SleepState {
        let threshold = self.config.confidence_threshold;
        if confidence >= threshold {
            SleepState::Asleep
        } else if confidence <= 1.0 - threshold {
            SleepState::Awake
        } else {
            SleepState::Indeterminate
        }
    }
}
