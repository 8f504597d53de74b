//! Continuous position watch feeding the shared cache.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::LocationCache;
use crate::device::{Capability, CapabilityTracker, PermissionState, PositionOptions, PositionProvider};
use crate::error::DeviceError;

/// A running watch. One per acquirer, however many readers use the cache.
pub struct LocationWatch {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl LocationWatch {
    pub fn spawn(
        provider: &dyn PositionProvider,
        options: PositionOptions,
        cache: Arc<LocationCache>,
        capabilities: Arc<CapabilityTracker>,
    ) -> Result<Self, DeviceError> {
        let mut updates = provider.watch_position(options)?;
        let stop = updates.stop_token();
        info!(
            max_age_ms = options.maximum_age.as_millis() as u64,
            timeout_ms = options.timeout.as_millis() as u64,
            "location_watch_started"
        );

        let task = tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                match update {
                    Ok(sample) => {
                        if cache.store(sample) {
                            debug!(accuracy = sample.accuracy, "watch updated location");
                        }
                    }
                    Err(DeviceError::PermissionDenied(_)) => {
                        capabilities.set(Capability::Location, PermissionState::Denied);
                        warn!("location permission revoked, ending watch");
                        break;
                    }
                    Err(e) => debug!(error = %e, "watch update failed"),
                }
            }
            updates.stop();
            info!("location_watch_ended");
        });

        Ok(Self { stop, task })
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled() && !self.task.is_finished()
    }

    /// Stop the device subscription; the task exits on its own.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for LocationWatch {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
