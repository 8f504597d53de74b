#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

use safeguard::clock::{Clock, SystemClock};
use safeguard::device::{
    subscription, AudioBlock, Capability, Feed, MediaDevice, MediaStream, MotionSample, MotionSensor,
    PermissionBroker, PermissionState, PositionOptions, PositionProvider, RecognitionError, RecognitionEvent,
    SpeechRecognizer, SpeechSynthesizer, Subscription, Utterance, VideoFrame,
};
use safeguard::dispatch::{Ack, AlertPayload, Notifier};
use safeguard::evidence::upload::MediaUploader;
use safeguard::evidence::EvidenceBlob;
use safeguard::geo::{Geocoder, PlaceCategory, PlaceRecord, PlacesSearch};
use safeguard::{
    AlarmEngine, AlarmState, DeviceError, Devices, EngineConfig, EngineEvent, LocationSample, NetworkError, Services,
};

pub fn sample(latitude: f64, longitude: f64, accuracy: f64, timestamp_ms: i64) -> LocationSample {
    LocationSample {
        latitude,
        longitude,
        accuracy,
        timestamp_ms,
    }
}

/// Config with the side effects tests usually do not care about switched off.
pub fn quiet_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.subject_id = "X".into();
    config.alarm.voice_alert = false;
    config.evidence.auto_start = false;
    config
}

// --- Notifier ---

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<AlertPayload>>,
    pub fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn payloads(&self) -> Vec<AlertPayload> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, payload: &AlertPayload) -> Result<Ack, NetworkError> {
        self.sent.lock().push(payload.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(NetworkError::Request("connection refused".into()));
        }
        Ok(Ack {
            id: Some(format!("ack-{}", self.sent.lock().len())),
            message: "SOS sent".into(),
        })
    }
}

// --- Positions ---

#[derive(Debug, Clone)]
pub enum Fix {
    Ok(LocationSample),
    Fail(DeviceError),
    /// Never answers; the caller's timeout has to kick in.
    Hang,
}

/// Answers single-fix requests from a script; an empty script hangs.
#[derive(Default)]
pub struct ScriptedPositions {
    script: Mutex<VecDeque<Fix>>,
    pub requests: Mutex<Vec<PositionOptions>>,
    pub watch_feed: Mutex<Option<Feed<Result<LocationSample, DeviceError>>>>,
    pub watch_starts: AtomicU32,
}

impl ScriptedPositions {
    pub fn new(script: impl IntoIterator<Item = Fix>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn push(&self, fix: Fix) {
        self.script.lock().push_back(fix);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn watch_feed(&self) -> Option<Feed<Result<LocationSample, DeviceError>>> {
        self.watch_feed.lock().clone()
    }
}

#[async_trait]
impl PositionProvider for ScriptedPositions {
    async fn current_position(&self, options: PositionOptions) -> Result<LocationSample, DeviceError> {
        self.requests.lock().push(options);
        let next = self.script.lock().pop_front().unwrap_or(Fix::Hang);
        match next {
            Fix::Ok(sample) => Ok(sample),
            Fix::Fail(e) => Err(e),
            Fix::Hang => std::future::pending().await,
        }
    }

    fn watch_position(
        &self,
        _options: PositionOptions,
    ) -> Result<Subscription<Result<LocationSample, DeviceError>>, DeviceError> {
        let (feed, sub) = subscription(16);
        *self.watch_feed.lock() = Some(feed);
        self.watch_starts.fetch_add(1, Ordering::SeqCst);
        Ok(sub)
    }
}

// --- Motion ---

#[derive(Default)]
pub struct FakeMotion {
    feed: Mutex<Option<Feed<MotionSample>>>,
    pub denied: AtomicBool,
}

impl FakeMotion {
    pub fn feed(&self) -> Feed<MotionSample> {
        self.feed.lock().clone().expect("motion not subscribed")
    }

    pub fn is_subscribed(&self) -> bool {
        self.feed.lock().as_ref().is_some_and(|f| !f.is_stopped())
    }
}

impl MotionSensor for FakeMotion {
    fn subscribe(&self) -> Result<Subscription<MotionSample>, DeviceError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied(Capability::Motion));
        }
        let (feed, sub) = subscription(64);
        *self.feed.lock() = Some(feed);
        Ok(sub)
    }
}

// --- Speech recognition ---

/// Plays one scripted event list per session. Sessions beyond the script stay
/// open and silent until stopped.
#[derive(Default)]
pub struct ScriptedRecognizer {
    sessions: Mutex<VecDeque<Vec<RecognitionEvent>>>,
    live: Mutex<Vec<Feed<RecognitionEvent>>>,
    pub starts: AtomicU32,
    pub refuse: AtomicBool,
}

impl ScriptedRecognizer {
    pub fn new(sessions: impl IntoIterator<Item = Vec<RecognitionEvent>>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> usize {
        self.live.lock().iter().filter(|f| !f.is_stopped()).count()
    }

    /// Push an event into the newest session.
    pub fn say(&self, event: RecognitionEvent) -> bool {
        match self.live.lock().last() {
            Some(feed) => feed.try_send(event),
            None => false,
        }
    }
}

pub fn heard(index: usize, text: &str) -> RecognitionEvent {
    RecognitionEvent::Result {
        index,
        transcript: text.into(),
        is_final: true,
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn start(&self) -> Result<Subscription<RecognitionEvent>, RecognitionError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RecognitionError::NotAllowed);
        }
        let (feed, sub) = subscription(32);
        if let Some(events) = self.sessions.lock().pop_front() {
            for event in events {
                feed.try_send(event);
            }
        }
        self.live.lock().push(feed);
        Ok(sub)
    }
}

// --- Camera ---

/// Emits a flat grey frame every 20 ms and a short audio block alongside it
/// until the stream is released.
pub struct FakeCamera {
    pub width: u32,
    pub height: u32,
    pub opens: AtomicU32,
    pub releases: Arc<AtomicU32>,
    pub deny: AtomicBool,
    pub open_delay: Duration,
}

impl FakeCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            opens: AtomicU32::new(0),
            releases: Arc::new(AtomicU32::new(0)),
            deny: AtomicBool::new(false),
            open_delay: Duration::ZERO,
        }
    }

    /// Simulates a slow hardware handshake before the stream is live.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn released(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevice for FakeCamera {
    async fn open(&self) -> Result<MediaStream, DeviceError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied(Capability::Camera));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (video_feed, video) = subscription::<VideoFrame>(4);
        let (audio_feed, audio) = subscription::<AudioBlock>(16);
        let (width, height) = (self.width, self.height);
        let releases = Arc::clone(&self.releases);

        tokio::spawn(async move {
            let grey = RgbaImage::from_pixel(width, height, Rgba([90, 90, 90, 255]));
            loop {
                tokio::select! {
                    _ = video_feed.stopped() => break,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {
                        video_feed.try_send(VideoFrame { image: grey.clone() });
                        audio_feed.try_send(AudioBlock {
                            samples: vec![0; 320],
                            sample_rate: 16_000,
                            channels: 1,
                        });
                    }
                }
            }
            releases.fetch_add(1, Ordering::SeqCst);
        });

        Ok(MediaStream {
            video,
            audio: Some(audio),
            width,
            height,
        })
    }
}

// --- Uploads ---

pub struct FakeUploader {
    pub uploads: Mutex<Vec<EvidenceBlob>>,
    pub url: String,
    pub delay: Duration,
    pub fail: AtomicBool,
}

impl FakeUploader {
    pub fn new(url: &str) -> Self {
        Self {
            uploads: Mutex::new(Vec::new()),
            url: url.into(),
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl MediaUploader for FakeUploader {
    async fn upload(&self, blob: &EvidenceBlob) -> Result<String, NetworkError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.uploads.lock().push(blob.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(NetworkError::Status {
                status: 500,
                body: "Server error".into(),
            });
        }
        Ok(self.url.clone())
    }
}

// --- Speech synthesis ---

#[derive(Default)]
pub struct CountingSynth {
    pub spoken: AtomicU32,
    pub cancels: AtomicU32,
}

#[async_trait]
impl SpeechSynthesizer for CountingSynth {
    async fn speak(&self, _utterance: &Utterance) -> Result<(), DeviceError> {
        self.spoken.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

// --- Permissions ---

/// Answers every prompt from a fixed table; unknown capabilities are granted.
/// A held broker leaves prompts open until `answer` is called.
#[derive(Default)]
pub struct StaticBroker {
    answers: Mutex<HashMap<Capability, PermissionState>>,
    pub asked: Mutex<Vec<Capability>>,
    held: AtomicBool,
    answered: Notify,
}

impl StaticBroker {
    pub fn deny(self, capability: Capability) -> Self {
        self.answers.lock().insert(capability, PermissionState::Denied);
        self
    }

    pub fn hold(self) -> Self {
        self.held.store(true, Ordering::SeqCst);
        self
    }

    /// Let the pending prompt resolve.
    pub fn answer(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.answered.notify_one();
    }
}

#[async_trait]
impl PermissionBroker for StaticBroker {
    async fn request(&self, capability: Capability) -> PermissionState {
        self.asked.lock().push(capability);
        if self.held.load(Ordering::SeqCst) {
            self.answered.notified().await;
        }
        self.answers
            .lock()
            .get(&capability)
            .copied()
            .unwrap_or(PermissionState::Granted)
    }
}

// --- Geodata ---

pub struct FakeGeocoder {
    pub address: Option<String>,
    pub delay: Duration,
}

#[async_trait]
impl Geocoder for FakeGeocoder {
    async fn reverse(&self, _latitude: f64, _longitude: f64) -> Result<Option<String>, NetworkError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.address.clone())
    }
}

pub struct FakePlaces {
    pub records: Vec<PlaceRecord>,
    pub fail: bool,
}

#[async_trait]
impl PlacesSearch for FakePlaces {
    async fn nearby(
        &self,
        _latitude: f64,
        _longitude: f64,
        _radius_m: u32,
        _category: PlaceCategory,
    ) -> Result<Vec<PlaceRecord>, NetworkError> {
        if self.fail {
            return Err(NetworkError::Status {
                status: 504,
                body: "gateway timeout".into(),
            });
        }
        Ok(self.records.clone())
    }
}

pub fn station(name: &str, latitude: f64, longitude: f64) -> PlaceRecord {
    let mut tags = HashMap::new();
    tags.insert("name".to_string(), name.to_string());
    tags.insert("phone".to_string(), "100".to_string());
    PlaceRecord {
        latitude,
        longitude,
        tags,
    }
}

// --- Harness ---

/// Every fake an engine needs, kept around for assertions.
pub struct Rig {
    pub broker: Arc<StaticBroker>,
    pub positions: Arc<ScriptedPositions>,
    pub motion: Arc<FakeMotion>,
    pub recognizer: Arc<ScriptedRecognizer>,
    pub camera: Arc<FakeCamera>,
    pub synth: Arc<CountingSynth>,
    pub notifier: Arc<RecordingNotifier>,
    pub uploader: Arc<FakeUploader>,
    pub geocoder: Arc<FakeGeocoder>,
    pub places: Arc<FakePlaces>,
    pub clock: Arc<dyn Clock>,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(StaticBroker::default()),
            positions: Arc::new(ScriptedPositions::default()),
            motion: Arc::new(FakeMotion::default()),
            recognizer: Arc::new(ScriptedRecognizer::default()),
            camera: Arc::new(FakeCamera::new(320, 240)),
            synth: Arc::new(CountingSynth::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            uploader: Arc::new(FakeUploader::new("http://localhost:3001/uploads/recording.mjpeg")),
            geocoder: Arc::new(FakeGeocoder {
                address: Some("MG Road, Bengaluru".into()),
                delay: Duration::from_millis(50),
            }),
            places: Arc::new(FakePlaces {
                records: vec![station("Cubbon Park Police Station", 12.976, 77.595)],
                fail: false,
            }),
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn launch(&self, config: EngineConfig) -> Arc<AlarmEngine> {
        let devices = Devices {
            permissions: self.broker.clone(),
            positions: self.positions.clone(),
            motion: Some(self.motion.clone()),
            recognizer: Some(self.recognizer.clone()),
            camera: Some(self.camera.clone()),
            synthesizer: Some(self.synth.clone()),
        };
        let services = Services {
            notifier: self.notifier.clone(),
            geocoder: self.geocoder.clone(),
            places: self.places.clone(),
            uploader: self.uploader.clone(),
        };
        AlarmEngine::launch(config, devices, services, Arc::clone(&self.clock))
    }
}

/// Let spawned tasks run without moving the paused clock far.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub async fn wait_for_state(engine: &AlarmEngine, state: AlarmState) {
    let mut rx = engine.subscribe_state();
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| *s == state))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
}

/// Everything currently buffered on an event receiver.
pub fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
