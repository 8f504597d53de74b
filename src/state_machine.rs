//! Alarm state machine: Idle → Armed → Activated → Idle.
//! Cooldown is the timed tail of Activated. Any state may be disarmed to Idle.
//! Illegal requests are ignored, never errors: stray events delivered after a
//! reset must not disturb the next cycle.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::location::LocationSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlarmState {
    Idle,
    Armed,
    Activated,
}

impl std::fmt::Display for AlarmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlarmState::Idle => write!(f, "Idle"),
            AlarmState::Armed => write!(f, "Armed"),
            AlarmState::Activated => write!(f, "Activated"),
        }
    }
}

impl AlarmState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: AlarmState) -> bool {
        matches!(
            (self, next),
            (AlarmState::Idle, AlarmState::Armed)
                | (AlarmState::Armed, AlarmState::Activated)
                | (AlarmState::Armed, AlarmState::Idle) // disarm
                | (AlarmState::Activated, AlarmState::Idle) // cooldown elapsed or disarm
        )
    }
}

/// Which source tripped the alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Shake,
    Voice,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Manual => write!(f, "manual"),
            TriggerSource::Shake => write!(f, "shake"),
            TriggerSource::Voice => write!(f, "voice"),
        }
    }
}

/// The one live alarm session. Exists from arm until the return to Idle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmSession {
    pub id: Uuid,
    /// Arming-cycle counter, shared with the cycle's listeners and timers.
    pub generation: u64,
    pub state: AlarmState,
    pub armed_at: DateTime<Utc>,
    pub arm_location: Option<LocationSample>,
    pub activated_at: Option<DateTime<Utc>>,
    pub trigger_source: Option<TriggerSource>,
}

/// A state change that actually happened.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: AlarmState,
    pub to: AlarmState,
    pub session: AlarmSession,
}

/// Thread-safe state machine with watch channel for reactive subscribers.
pub struct StateMachine {
    session: RwLock<Option<AlarmSession>>,
    generation: RwLock<u64>,
    state_tx: watch::Sender<AlarmState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(AlarmState::Idle);
        Self {
            session: RwLock::new(None),
            generation: RwLock::new(0),
            state_tx,
        }
    }

    /// Current state (non-blocking read).
    pub fn current(&self) -> AlarmState {
        self.session
            .read()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(AlarmState::Idle)
    }

    /// Snapshot of the live session, if any.
    pub fn session(&self) -> Option<AlarmSession> {
        self.session.read().clone()
    }

    /// Idle → Armed. Starts a new arming cycle.
    pub fn arm(&self, arm_location: Option<LocationSample>) -> Option<Transition> {
        let mut slot = self.session.write();
        let current = slot.as_ref().map(|s| s.state).unwrap_or(AlarmState::Idle);
        if !current.can_transition_to(AlarmState::Armed) {
            debug!(from = %current, "arm ignored");
            return None;
        }
        let generation = {
            let mut gen = self.generation.write();
            *gen += 1;
            *gen
        };
        let session = AlarmSession {
            id: Uuid::new_v4(),
            generation,
            state: AlarmState::Armed,
            armed_at: Utc::now(),
            arm_location,
            activated_at: None,
            trigger_source: None,
        };
        *slot = Some(session.clone());
        self.publish(current, AlarmState::Armed, &session);
        Some(Transition {
            from: current,
            to: AlarmState::Armed,
            session,
        })
    }

    /// Armed → Activated for the given cycle. No-op when already Activated,
    /// not Armed, or when the trigger belongs to an older cycle.
    pub fn activate(&self, generation: u64, source: TriggerSource) -> Option<Transition> {
        let mut slot = self.session.write();
        let session = match slot.as_mut() {
            Some(s) if s.generation == generation => s,
            _ => {
                debug!(generation, source = %source, "stale trigger ignored");
                return None;
            }
        };
        let current = session.state;
        if !current.can_transition_to(AlarmState::Activated) {
            debug!(from = %current, source = %source, "trigger ignored");
            return None;
        }
        session.state = AlarmState::Activated;
        session.activated_at = Some(Utc::now());
        session.trigger_source = Some(source);
        let snapshot = session.clone();
        self.publish(current, AlarmState::Activated, &snapshot);
        Some(Transition {
            from: current,
            to: AlarmState::Activated,
            session: snapshot,
        })
    }

    /// Activated → Idle when the cooldown of cycle `generation` elapses.
    pub fn reset(&self, generation: u64) -> Option<Transition> {
        let mut slot = self.session.write();
        match slot.as_ref() {
            Some(s) if s.generation == generation && s.state == AlarmState::Activated => {}
            _ => {
                debug!(generation, "stale reset ignored");
                return None;
            }
        }
        slot.take().map(|session| {
            self.publish(AlarmState::Activated, AlarmState::Idle, &session);
            Transition {
                from: AlarmState::Activated,
                to: AlarmState::Idle,
                session,
            }
        })
    }

    /// Any state → Idle on explicit user cancellation.
    pub fn disarm(&self) -> Option<Transition> {
        let mut slot = self.session.write();
        let session = slot.take()?;
        self.publish(session.state, AlarmState::Idle, &session);
        Some(Transition {
            from: session.state,
            to: AlarmState::Idle,
            session,
        })
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<AlarmState> {
        self.state_tx.subscribe()
    }

    fn publish(&self, from: AlarmState, to: AlarmState, session: &AlarmSession) {
        self.state_tx.send_replace(to);
        info!(
            from = %from,
            to = %to,
            session = %session.id,
            generation = session.generation,
            "state_transition"
        );
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
