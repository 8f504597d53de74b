//! Shake detection from accelerometer samples.
//!
//! speed = |Δ(x+y+z)| / Δt * scale, with Δt in milliseconds. Samples closer
//! than `min_interval_ms` to the last accepted one are dropped; the first
//! accepted sample of a cycle only primes the rolling state.

use crate::config::ShakeConfig;
use crate::device::MotionSample;

/// What a single sample did to the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShakeStatus {
    /// First usable sample; nothing to compare against yet.
    Primed,
    /// Too close to the previous accepted sample, or missing an axis.
    Discarded,
    /// Accepted, below threshold.
    Below { speed: f64 },
    /// Accepted, above threshold.
    Fired { speed: f64 },
}

#[derive(Debug, Clone, Copy)]
struct Last {
    sum: f64,
    timestamp_ms: i64,
}

/// Rolling shake detector. Create a fresh one for every arming cycle.
#[derive(Debug)]
pub struct ShakeDetector {
    threshold: f64,
    min_interval_ms: i64,
    scale: f64,
    last: Option<Last>,
}

impl ShakeDetector {
    pub fn new(config: &ShakeConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_interval_ms: config.min_interval_ms,
            scale: config.scale,
            last: None,
        }
    }

    pub fn observe(&mut self, sample: &MotionSample) -> ShakeStatus {
        let (Some(x), Some(y), Some(z)) = (sample.x, sample.y, sample.z) else {
            return ShakeStatus::Discarded;
        };
        let sum = x + y + z;

        let Some(last) = self.last else {
            self.last = Some(Last {
                sum,
                timestamp_ms: sample.timestamp_ms,
            });
            return ShakeStatus::Primed;
        };

        let diff_ms = sample.timestamp_ms - last.timestamp_ms;
        if diff_ms <= self.min_interval_ms {
            return ShakeStatus::Discarded;
        }

        let speed = (sum - last.sum).abs() / diff_ms as f64 * self.scale;
        self.last = Some(Last {
            sum,
            timestamp_ms: sample.timestamp_ms,
        });

        if speed > self.threshold {
            ShakeStatus::Fired { speed }
        } else {
            ShakeStatus::Below { speed }
        }
    }
}
