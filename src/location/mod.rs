//! Location acquisition.
//! `acquire()` walks a cascade: fresh cache → high-accuracy fix → low-accuracy
//! fix → stale cache → `NoFix`. A single shared watch keeps the cache warm
//! once access has been granted.

pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch as cell;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::LocationConfig;
use crate::device::{Capability, CapabilityTracker, PermissionState, PositionOptions, PositionProvider};
use crate::error::{AlertError, DeviceError};

pub use self::watch::LocationWatch;

/// One position reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Radius of uncertainty in meters.
    pub accuracy: f64,
    pub timestamp_ms: i64,
}

impl LocationSample {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.timestamp_ms
    }

    /// Recent and accurate enough to skip re-acquisition.
    pub fn is_fresh(&self, now_ms: i64, policy: &FreshnessPolicy) -> bool {
        self.age_ms(now_ms) < policy.max_age_ms && self.accuracy < policy.max_accuracy_m
    }

    /// `"lat, lon"` at four decimals, as burned into evidence frames.
    pub fn short_label(&self) -> String {
        format!("{:.4}, {:.4}", self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreshnessPolicy {
    pub max_age_ms: i64,
    pub max_accuracy_m: f64,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            max_age_ms: 10_000,
            max_accuracy_m: 20.0,
        }
    }
}

impl From<&LocationConfig> for FreshnessPolicy {
    fn from(config: &LocationConfig) -> Self {
        Self {
            max_age_ms: config.fresh_max_age_ms,
            max_accuracy_m: config.fresh_max_accuracy_m,
        }
    }
}

/// The single "current" sample. Newer readings overwrite it; no history.
pub struct LocationCache {
    tx: cell::Sender<Option<LocationSample>>,
}

impl LocationCache {
    pub fn new() -> Self {
        let (tx, _) = cell::channel(None);
        Self { tx }
    }

    /// Store `sample` unless the cache already holds a newer reading.
    pub fn store(&self, sample: LocationSample) -> bool {
        self.tx.send_if_modified(|slot| match slot {
            Some(current) if current.timestamp_ms > sample.timestamp_ms => false,
            _ => {
                *slot = Some(sample);
                true
            }
        })
    }

    pub fn current(&self) -> Option<LocationSample> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> cell::Receiver<Option<LocationSample>> {
        self.tx.subscribe()
    }
}

impl Default for LocationCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    HighAccuracy,
    LowAccuracy,
}

impl Stage {
    fn label(self) -> &'static str {
        match self {
            Stage::HighAccuracy => "high-accuracy fix",
            Stage::LowAccuracy => "low-accuracy fix",
        }
    }
}

pub struct LocationAcquirer {
    provider: Arc<dyn PositionProvider>,
    cache: Arc<LocationCache>,
    clock: Arc<dyn Clock>,
    capabilities: Arc<CapabilityTracker>,
    config: LocationConfig,
    watch: Mutex<Option<LocationWatch>>,
}

impl LocationAcquirer {
    pub fn new(
        provider: Arc<dyn PositionProvider>,
        cache: Arc<LocationCache>,
        clock: Arc<dyn Clock>,
        capabilities: Arc<CapabilityTracker>,
        config: LocationConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            clock,
            capabilities,
            config,
            watch: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<LocationCache> {
        &self.cache
    }

    /// Best available location, or `NoFix` once every stage is exhausted.
    pub async fn acquire(&self) -> Result<LocationSample, AlertError> {
        let policy = FreshnessPolicy::from(&self.config);
        let cached = self.cache.current();
        if let Some(sample) = cached {
            if sample.is_fresh(self.clock.now_ms(), &policy) {
                debug!(accuracy = sample.accuracy, "using fresh cached location");
                return Ok(sample);
            }
        }

        for stage in [Stage::HighAccuracy, Stage::LowAccuracy] {
            match self.fix(stage).await {
                Ok(sample) => {
                    self.cache.store(sample);
                    info!(stage = stage.label(), accuracy = sample.accuracy, "location_acquired");
                    return Ok(sample);
                }
                Err(e) => warn!(stage = stage.label(), error = %e, "location stage failed"),
            }
        }

        // Re-read: the watch may have delivered something while we waited.
        match self.cache.current().or(cached) {
            Some(sample) => {
                warn!(
                    age_ms = sample.age_ms(self.clock.now_ms()),
                    "falling back to stale cached location"
                );
                Ok(sample)
            }
            None => Err(AlertError::NoFix),
        }
    }

    async fn fix(&self, stage: Stage) -> Result<LocationSample, AlertError> {
        let options = PositionOptions {
            high_accuracy: matches!(stage, Stage::HighAccuracy),
            timeout: Duration::from_millis(self.config.fix_timeout_ms),
            maximum_age: Duration::ZERO,
        };
        match tokio::time::timeout(options.timeout, self.provider.current_position(options)).await {
            Ok(Ok(sample)) => Ok(sample),
            Ok(Err(DeviceError::PermissionDenied(cap))) => {
                self.capabilities.set(Capability::Location, PermissionState::Denied);
                Err(AlertError::PermissionDenied(cap))
            }
            Ok(Err(DeviceError::Timeout)) | Err(_) => Err(AlertError::Timeout(stage.label())),
            Ok(Err(e)) => {
                debug!(stage = stage.label(), error = %e, "position unavailable");
                Err(AlertError::NoFix)
            }
        }
    }

    /// One-shot fix that doubles as the location permission prompt. On success
    /// the capability becomes Granted and the shared watch is started.
    pub async fn request_access(&self) -> Result<LocationSample, AlertError> {
        let options = PositionOptions {
            high_accuracy: true,
            timeout: Duration::from_millis(self.config.fix_timeout_ms),
            maximum_age: Duration::ZERO,
        };
        let result =
            tokio::time::timeout(options.timeout, self.provider.current_position(options)).await;
        match result {
            Ok(Ok(sample)) => {
                self.cache.store(sample);
                self.capabilities.set(Capability::Location, PermissionState::Granted);
                self.start_watch();
                Ok(sample)
            }
            Ok(Err(DeviceError::PermissionDenied(_))) => {
                self.capabilities.set(Capability::Location, PermissionState::Denied);
                Err(AlertError::PermissionDenied(Capability::Location))
            }
            Ok(Err(DeviceError::Timeout)) | Err(_) => Err(AlertError::Timeout("location access")),
            Ok(Err(e)) => {
                warn!(error = %e, "location access request failed");
                Err(AlertError::NoFix)
            }
        }
    }

    /// Start the continuous watch if it is not already running.
    pub fn start_watch(&self) -> bool {
        let mut slot = self.watch.lock();
        if slot.as_ref().is_some_and(|w| w.is_running()) {
            return false;
        }
        let options = PositionOptions {
            high_accuracy: true,
            timeout: Duration::from_millis(self.config.watch_timeout_ms),
            maximum_age: Duration::from_millis(self.config.watch_max_age_ms),
        };
        match LocationWatch::spawn(
            self.provider.as_ref(),
            options,
            Arc::clone(&self.cache),
            Arc::clone(&self.capabilities),
        ) {
            Ok(watch) => {
                *slot = Some(watch);
                true
            }
            Err(e) => {
                warn!(error = %e, "location watch failed to start");
                if let DeviceError::PermissionDenied(_) = e {
                    self.capabilities.set(Capability::Location, PermissionState::Denied);
                }
                false
            }
        }
    }

    pub fn stop_watch(&self) {
        if let Some(watch) = self.watch.lock().take() {
            watch.stop();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watch.lock().as_ref().is_some_and(|w| w.is_running())
    }
}

impl Drop for LocationAcquirer {
    fn drop(&mut self) {
        self.stop_watch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(accuracy: f64, timestamp_ms: i64) -> LocationSample {
        LocationSample {
            latitude: 12.97,
            longitude: 77.59,
            accuracy,
            timestamp_ms,
        }
    }

    #[test]
    fn freshness_needs_recent_and_accurate() {
        let policy = FreshnessPolicy::default();
        let now = 100_000;
        assert!(sample(15.0, now - 5_000).is_fresh(now, &policy));
        assert!(!sample(25.0, now - 5_000).is_fresh(now, &policy));
        assert!(!sample(15.0, now - 15_000).is_fresh(now, &policy));
        assert!(!sample(15.0, now - 10_000).is_fresh(now, &policy));
    }

    #[test]
    fn cache_keeps_newest_sample() {
        let cache = LocationCache::new();
        assert!(cache.current().is_none());
        assert!(cache.store(sample(10.0, 2_000)));
        assert!(!cache.store(sample(5.0, 1_000)));
        assert_eq!(cache.current().unwrap().timestamp_ms, 2_000);
        assert!(cache.store(sample(30.0, 3_000)));
        assert_eq!(cache.current().unwrap().accuracy, 30.0);
    }

    #[test]
    fn cache_subscribers_see_updates() {
        let cache = LocationCache::new();
        let rx = cache.subscribe();
        cache.store(sample(10.0, 1));
        assert_eq!(rx.borrow().map(|s| s.timestamp_ms), Some(1));
    }

    #[test]
    fn short_label_uses_four_decimals() {
        let s = LocationSample {
            latitude: 12.971598,
            longitude: 77.594566,
            accuracy: 5.0,
            timestamp_ms: 0,
        };
        assert_eq!(s.short_label(), "12.9716, 77.5946");
    }
}
