//! Engine notifications for the embedding application.

use tokio::sync::broadcast;
use tracing::trace;

use crate::device::Capability;
use crate::dispatch::Ack;
use crate::error::AlertError;
use crate::geo::PoliceStation;
use crate::location::LocationSample;
use crate::state_machine::{AlarmState, TriggerSource};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged {
        from: AlarmState,
        to: AlarmState,
        generation: u64,
    },
    Triggered {
        source: TriggerSource,
        generation: u64,
    },
    LocationAcquired(LocationSample),
    /// Cascade exhausted; the alert goes out without coordinates.
    LocationUnavailable,
    AddressResolved(String),
    StationFound(PoliceStation),
    AlertSent {
        ack: Ack,
        followup: bool,
    },
    RecordingStarted,
    EvidenceUploaded {
        url: String,
    },
    CapabilityRevoked(Capability),
    /// A failure the user needs to see.
    Failure(AlertError),
}

/// Fan-out of engine events. Sending never blocks and never fails the caller.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        trace!(?event, "engine_event");
        let _ = self.tx.send(event);
    }

    /// Emit a failure only if it is one the user should see.
    pub fn report(&self, error: AlertError) {
        if error.is_user_visible() {
            self.emit(EngineEvent::Failure(error));
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
