//! Rolling signal window
//!
//! Keeps the most recent `window_size` of sensor samples. Eviction is lazy:
//! samples older than the horizon are dropped when the window is read, not on a
//! timer.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use tracing::warn;

use crate::config::NapConfig;
use crate::error::{NapError, Result};
use crate::types::SensorSample;

/// Ordered view of the samples in the current window, oldest first
#[derive(Debug, Clone, Copy)]
pub struct Window<'a> {
    samples: &'a [SensorSample],
    end_time: DateTime<Utc>,
}

impl<'a> Window<'a> {
    pub fn new(samples: &'a [SensorSample], end_time: DateTime<Utc>) -> Self {
        Self { samples, end_time }
    }

    pub fn samples(&self) -> &'a [SensorSample] {
        self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Timestamp of the newest sample (the window's "now")
    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }
}

/// Append-only sample buffer with oldest-first eviction
#[derive(Debug, Clone)]
pub struct SignalWindowBuffer {
    samples: VecDeque<SensorSample>,
    window_size: Duration,
    last_timestamp: Option<DateTime<Utc>>,
}

impl SignalWindowBuffer {
    pub fn new(config: &NapConfig) -> Self {
        Self {
            samples: VecDeque::new(),
            window_size: config.window_size(),
            last_timestamp: None,
        }
    }

    /// Append a sample. Samples must arrive in strictly increasing time order.
    pub fn ingest(&mut self, sample: SensorSample) -> Result<()> {
        if let Some(previous) = self.last_timestamp {
            if sample.timestamp <= previous {
                warn!(
                    previous = %previous,
                    received = %sample.timestamp,
                    "rejecting out-of-order sample"
                );
                return Err(NapError::OutOfOrderSample {
                    previous,
                    received: sample.timestamp,
                });
            }
        }
        self.last_timestamp = Some(sample.timestamp);
        self.samples.push_back(sample);
        Ok(())
    }

    /// The samples within `window_size` of the latest ingested sample.
    ///
    /// Returns `None` before the first sample.
    pub fn current_window(&mut self) -> Option<Window<'_>> {
        let end_time = self.last_timestamp?;
        let horizon = end_time - self.window_size;
        while self
            .samples
            .front()
            .is_some_and(|oldest| oldest.timestamp < horizon)
        {
            self.samples.pop_front();
        }
        Some(Window::new(self.samples.make_contiguous(), end_time))
    }

    pub fn last_sample_at(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    /// Number of buffered samples, including any not yet evicted
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drop all samples and forget the ordering watermark
    pub fn clear(&mut self) {
        self.samples.clear();
        self.last_timestamp = None;
    }
}
