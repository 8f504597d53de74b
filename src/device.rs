//! Device capability adapters.
//! Every sensor, camera and recognizer is reached through a trait here so the
//! engine never touches platform APIs directly. Streams are `Subscription`s:
//! cancellable on explicit `stop()` or on drop, observable from the device side.

use std::collections::HashMap;

use async_trait::async_trait;
use image::RgbaImage;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::DeviceError;
use crate::location::LocationSample;

/// A permission-gated device capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Capability {
    Motion,
    Location,
    Microphone,
    Camera,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Motion => write!(f, "motion"),
            Capability::Location => write!(f, "location"),
            Capability::Microphone => write!(f, "microphone"),
            Capability::Camera => write!(f, "camera"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PermissionState {
    Granted,
    Denied,
    /// Not asked yet, or the prompt is unresolved.
    Prompt,
}

/// Per-capability permission state, shared by every component.
pub struct CapabilityTracker {
    states: RwLock<HashMap<Capability, PermissionState>>,
}

impl CapabilityTracker {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, capability: Capability) -> PermissionState {
        self.states
            .read()
            .get(&capability)
            .copied()
            .unwrap_or(PermissionState::Prompt)
    }

    /// Record a new state. Returns the previous one.
    pub fn set(&self, capability: Capability, state: PermissionState) -> PermissionState {
        let prev = self
            .states
            .write()
            .insert(capability, state)
            .unwrap_or(PermissionState::Prompt);
        if prev != state {
            info!(capability = %capability, from = ?prev, to = ?state, "permission_changed");
        }
        prev
    }

    pub fn is_granted(&self, capability: Capability) -> bool {
        self.get(capability) == PermissionState::Granted
    }

    pub fn snapshot(&self) -> HashMap<Capability, PermissionState> {
        self.states.read().clone()
    }
}

impl Default for CapabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

// --- Subscriptions ---

/// Create a linked producer/consumer pair with a shared stop signal.
pub fn subscription<T>(capacity: usize) -> (Feed<T>, Subscription<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stop = CancellationToken::new();
    (
        Feed {
            tx,
            stop: stop.clone(),
        },
        Subscription { rx, stop },
    )
}

/// Device-side half of a subscription.
pub struct Feed<T> {
    tx: mpsc::Sender<T>,
    stop: CancellationToken,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stop: self.stop.clone(),
        }
    }
}

impl<T> Feed<T> {
    /// Deliver an item. Returns false once the consumer has stopped.
    pub async fn send(&self, item: T) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        tokio::select! {
            res = self.tx.send(item) => res.is_ok(),
            _ = self.stop.cancelled() => false,
        }
    }

    /// Non-blocking delivery; drops the item when the buffer is full.
    pub fn try_send(&self, item: T) -> bool {
        !self.stop.is_cancelled() && self.tx.try_send(item).is_ok()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the consumer stops or goes away.
    pub async fn stopped(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

/// Consumer half of a subscription. Dropping it stops the device side.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    stop: CancellationToken,
}

impl<T> Subscription<T> {
    /// Next item, or `None` once stopped or the device ended the stream.
    pub async fn recv(&mut self) -> Option<T> {
        if self.stop.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// A handle that stops this subscription from elsewhere.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

// --- Payload types ---

/// One accelerometer reading (acceleration including gravity, m/s²).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub timestamp_ms: i64,
}

impl MotionSample {
    pub fn new(x: f64, y: f64, z: f64, timestamp_ms: i64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            z: Some(z),
            timestamp_ms,
        }
    }
}

/// Options for a position request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub timeout: std::time::Duration,
    /// Oldest cached device fix the caller accepts.
    pub maximum_age: std::time::Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// A (possibly interim) transcript for result slot `index`.
    Result {
        index: usize,
        transcript: String,
        is_final: bool,
    },
    Error(RecognitionError),
    /// The recognizer ended the session on its own.
    End,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecognitionError {
    #[error("microphone not allowed")]
    NotAllowed,
    #[error("no speech detected")]
    NoSpeech,
    #[error("recognition aborted")]
    Aborted,
    #[error("recognition network error")]
    Network,
    #[error("recognition error: {0}")]
    Other(String),
}

/// A raw camera frame at the source's native resolution.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: RgbaImage,
}

/// Interleaved PCM block from the microphone track.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// An acquired camera + microphone stream. Releasing stops both tracks.
pub struct MediaStream {
    pub video: Subscription<VideoFrame>,
    pub audio: Option<Subscription<AudioBlock>>,
    pub width: u32,
    pub height: u32,
}

impl MediaStream {
    pub fn release(self) {
        self.video.stop();
        if let Some(audio) = &self.audio {
            audio.stop();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

// --- Capability traits ---

#[async_trait]
pub trait PermissionBroker: Send + Sync {
    /// Ask for a capability; resolves once the prompt is answered.
    async fn request(&self, capability: Capability) -> PermissionState;
}

pub trait MotionSensor: Send + Sync {
    fn subscribe(&self) -> Result<Subscription<MotionSample>, DeviceError>;
}

#[async_trait]
pub trait PositionProvider: Send + Sync {
    /// Single fix.
    async fn current_position(&self, options: PositionOptions) -> Result<LocationSample, DeviceError>;

    /// Continuous updates until the subscription is stopped.
    fn watch_position(
        &self,
        options: PositionOptions,
    ) -> Result<Subscription<Result<LocationSample, DeviceError>>, DeviceError>;
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Start a continuous, interim-results recognition session.
    async fn start(&self) -> Result<Subscription<RecognitionEvent>, RecognitionError>;
}

#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Acquire the camera (and microphone, when present).
    async fn open(&self) -> Result<MediaStream, DeviceError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speak and resolve when the utterance finishes or is cancelled.
    async fn speak(&self, utterance: &Utterance) -> Result<(), DeviceError>;

    /// Cancel queued and in-progress speech.
    fn cancel(&self);
}
