//! Alarm orchestration.
//! Triggers and cooldown timers funnel through one event loop, so every state
//! transition is serialized. Handlers never await: anything slow (pipeline,
//! evidence, voice alarm) is spawned under the activation cancellation scope.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancellation::{CancelCoordinator, GenerationGuard};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::device::{
    Capability, CapabilityTracker, MediaDevice, MotionSensor, PermissionBroker, PermissionState, PositionProvider,
    SpeechRecognizer, SpeechSynthesizer,
};
use crate::dispatch::{AlertDispatcher, HttpNotifier, LogNotifier, Notifier};
use crate::error::{AlertError, DeviceError, NetworkError};
use crate::events::{EngineEvent, EventBus};
use crate::evidence::upload::{HttpUploader, MediaUploader, UnconfiguredUploader};
use crate::evidence::{CameraLease, EvidenceBlob, EvidenceCapture, UploadTicket};
use crate::geo::{GeoEnrichment, Geocoder, NominatimGeocoder, OverpassSearch, PlacesSearch};
use crate::location::{LocationAcquirer, LocationCache, LocationSample};
use crate::metrics::MetricsRegistry;
use crate::pipeline::{ActivationPipeline, PipelineReport};
use crate::state_machine::{AlarmSession, AlarmState, StateMachine, Transition, TriggerSource};
use crate::trigger::{DetectorHandle, TriggerDetector, TriggerSignal, TriggerSink};
use crate::voice_alarm::VoiceAlarm;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(15);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Device capabilities available to the engine. Missing optional devices
/// simply disable the features that need them.
pub struct Devices {
    pub permissions: Arc<dyn PermissionBroker>,
    pub positions: Arc<dyn PositionProvider>,
    pub motion: Option<Arc<dyn MotionSensor>>,
    pub recognizer: Option<Arc<dyn SpeechRecognizer>>,
    pub camera: Option<Arc<dyn MediaDevice>>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
}

/// External collaborators.
pub struct Services {
    pub notifier: Arc<dyn Notifier>,
    pub geocoder: Arc<dyn Geocoder>,
    pub places: Arc<dyn PlacesSearch>,
    pub uploader: Arc<dyn MediaUploader>,
}

impl Services {
    /// HTTP-backed services. Without an alert endpoint alerts are logged;
    /// without an upload URL clips are kept locally.
    pub fn http(config: &EngineConfig) -> Result<Self, NetworkError> {
        let notifier: Arc<dyn Notifier> = match &config.dispatch.endpoint {
            Some(endpoint) => Arc::new(HttpNotifier::new(endpoint.clone(), DISPATCH_TIMEOUT)?),
            None => {
                info!("no alert endpoint configured, alerts will be logged");
                Arc::new(LogNotifier)
            }
        };
        let uploader: Arc<dyn MediaUploader> = match &config.evidence.upload_url {
            Some(url) => Arc::new(HttpUploader::new(url.clone(), UPLOAD_TIMEOUT)?),
            None => {
                warn!("no upload endpoint configured, evidence stays local");
                Arc::new(UnconfiguredUploader)
            }
        };
        Ok(Self {
            notifier,
            geocoder: Arc::new(NominatimGeocoder::new(&config.geo)?),
            places: Arc::new(OverpassSearch::new(&config.geo)?),
            uploader,
        })
    }
}

#[derive(Debug)]
enum Command {
    AutoReset { generation: u64 },
}

pub struct AlarmEngine {
    config: EngineConfig,
    state: StateMachine,
    cancel: CancelCoordinator,
    capabilities: Arc<CapabilityTracker>,
    events: EventBus,
    metrics: Arc<MetricsRegistry>,
    permissions: Arc<dyn PermissionBroker>,
    has_recognizer: bool,
    acquirer: Arc<LocationAcquirer>,
    enrichment: Arc<GeoEnrichment>,
    dispatcher: Arc<AlertDispatcher>,
    detector: TriggerDetector,
    evidence: Option<Arc<EvidenceCapture>>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    sink: Mutex<Option<TriggerSink>>,
    listeners: Mutex<Option<DetectorHandle>>,
    pipeline: Mutex<Option<JoinHandle<PipelineReport>>>,
    /// Cancelled once the last wind-down has released the camera.
    camera_released: Mutex<CancellationToken>,
    trigger_tx: mpsc::UnboundedSender<TriggerSignal>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl AlarmEngine {
    /// Build the engine and start its event loop on the current runtime.
    pub fn launch(config: EngineConfig, devices: Devices, services: Services, clock: Arc<dyn Clock>) -> Arc<Self> {
        let capabilities = Arc::new(CapabilityTracker::new());
        let events = EventBus::default();
        let metrics = Arc::new(MetricsRegistry::new());
        let cache = Arc::new(LocationCache::new());

        let acquirer = Arc::new(LocationAcquirer::new(
            devices.positions,
            Arc::clone(&cache),
            clock,
            Arc::clone(&capabilities),
            config.location.clone(),
        ));
        let enrichment = Arc::new(GeoEnrichment::new(
            services.geocoder,
            services.places,
            config.geo.station_radius_m,
        ));
        let dispatcher = Arc::new(AlertDispatcher::new(config.subject_id.clone(), services.notifier));
        let has_recognizer = devices.recognizer.is_some();
        let detector = TriggerDetector::new(
            devices.motion,
            devices.recognizer,
            config.shake.clone(),
            config.keyword.clone(),
            Arc::clone(&capabilities),
            events.clone(),
        );
        let evidence = devices.camera.map(|camera| {
            Arc::new(EvidenceCapture::new(
                camera,
                CameraLease::new(),
                services.uploader,
                cache.subscribe(),
                Arc::clone(&capabilities),
                events.clone(),
                Arc::clone(&metrics),
                config.evidence.clone(),
            ))
        });

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let engine = Arc::new(Self {
            config,
            state: StateMachine::new(),
            cancel: CancelCoordinator::new(),
            capabilities,
            events,
            metrics,
            permissions: devices.permissions,
            has_recognizer,
            acquirer,
            enrichment,
            dispatcher,
            detector,
            evidence,
            synthesizer: devices.synthesizer,
            sink: Mutex::new(None),
            listeners: Mutex::new(None),
            pipeline: Mutex::new(None),
            camera_released: Mutex::new(released_token()),
            trigger_tx,
            commands,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(run_event_loop(Arc::downgrade(&engine), trigger_rx, command_rx, shutdown));
        info!(subject = %engine.config.subject_id, "alarm engine started");
        engine
    }

    // --- Queries ---

    pub fn state(&self) -> AlarmState {
        self.state.current()
    }

    pub fn session(&self) -> Option<AlarmSession> {
        self.state.session()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AlarmState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn capabilities(&self) -> &Arc<CapabilityTracker> {
        &self.capabilities
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn location_cache(&self) -> &Arc<LocationCache> {
        self.acquirer.cache()
    }

    pub fn is_watching_location(&self) -> bool {
        self.acquirer.is_watching()
    }

    // --- Commands ---

    /// Idle → Armed. `location` defaults to the cached sample. Returns `None`
    /// when the alarm is not Idle.
    ///
    /// Shake listening starts right away; the returned future then waits on
    /// the microphone prompt and adds keyword spotting if it is granted.
    pub async fn arm(&self, location: Option<LocationSample>) -> Option<AlarmSession> {
        let arm_location = location.or_else(|| self.acquirer.cache().current());
        let transition = self.state.arm(arm_location)?;
        self.publish(&transition);
        let session = transition.session;
        let generation = session.generation;

        let guard = self.cancel.listening.cancel_and_advance();
        let sink = TriggerSink::new(generation, self.trigger_tx.clone());
        *self.sink.lock() = Some(sink.clone());

        if self.capabilities.is_granted(Capability::Location) {
            self.acquirer.start_watch();
        }

        let handle = self.detector.start(sink.clone(), guard.clone());
        if let Some(previous) = self.listeners.lock().replace(handle) {
            previous.abort();
        }
        info!(generation, "listening for triggers");

        if self.has_recognizer && self.request_microphone(&guard).await {
            let mut listeners = self.listeners.lock();
            match listeners.as_mut() {
                Some(handle) if guard.should_continue() => {
                    if let Some(task) = self.detector.start_keyword(sink, guard) {
                        handle.attach(task);
                        info!(generation, "keyword spotting started");
                    }
                }
                _ => debug!(generation, "arming cycle ended before keyword spotting started"),
            }
        }
        Some(session)
    }

    async fn request_microphone(&self, guard: &GenerationGuard) -> bool {
        if self.capabilities.get(Capability::Microphone) == PermissionState::Denied {
            return false;
        }
        let answer = tokio::select! {
            biased;
            _ = guard.cancelled() => return false,
            answer = self.permissions.request(Capability::Microphone) => answer,
        };
        self.capabilities.set(Capability::Microphone, answer);
        if answer == PermissionState::Denied {
            self.events.report(AlertError::PermissionDenied(Capability::Microphone));
        }
        answer == PermissionState::Granted
    }

    /// Fire the manual trigger. Only honored while Armed.
    pub fn trigger_manual(&self) -> bool {
        if self.state.current() != AlarmState::Armed {
            debug!(state = %self.state.current(), "manual trigger ignored");
            return false;
        }
        match self.sink.lock().as_ref() {
            Some(sink) => sink.fire(TriggerSource::Manual),
            None => false,
        }
    }

    /// Any state → Idle.
    pub fn disarm(&self) -> bool {
        match self.state.disarm() {
            Some(transition) => {
                self.publish(&transition);
                self.wind_down();
                true
            }
            None => false,
        }
    }

    /// One-shot fix that doubles as the location permission prompt; starts
    /// the shared watch on success.
    pub async fn request_location_access(&self) -> Result<LocationSample, AlertError> {
        let result = self.acquirer.request_access().await;
        if let Err(e) = &result {
            self.events.report(e.clone());
        }
        result
    }

    /// Start a recording by hand. Outside an activation the upload is
    /// announced but no alert is sent.
    pub async fn start_recording(&self) -> Result<Option<UploadTicket>, DeviceError> {
        let Some(capture) = &self.evidence else {
            return Err(DeviceError::Unavailable("no camera".into()));
        };
        let released = self.camera_released.lock().clone();
        released.cancelled().await;
        capture.start().await
    }

    pub async fn stop_recording(&self) -> Option<Result<String, AlertError>> {
        match &self.evidence {
            Some(capture) => capture.stop().await,
            None => None,
        }
    }

    pub fn take_unsent_clip(&self) -> Option<EvidenceBlob> {
        self.evidence.as_ref().and_then(|c| c.take_unsent_clip())
    }

    /// Wait for the most recent activation pipeline to finish.
    pub async fn wait_for_pipeline(&self) -> Option<PipelineReport> {
        let handle = self.pipeline.lock().take()?;
        handle.await.ok()
    }

    /// Tear everything down, including the location watch.
    pub async fn shutdown(&self) {
        if let Some(transition) = self.state.disarm() {
            self.publish(&transition);
        }
        self.wind_down();
        self.shutdown.cancel();
        self.acquirer.stop_watch();
        if let Some(capture) = &self.evidence {
            capture.close().await;
        }
        info!("alarm engine shut down");
    }

    // --- Event loop handlers ---

    fn on_trigger(&self, signal: TriggerSignal) {
        let Some(transition) = self.state.activate(signal.generation, signal.source) else {
            return;
        };
        self.publish(&transition);
        self.events.emit(EngineEvent::Triggered {
            source: signal.source,
            generation: signal.generation,
        });

        // Leaving Armed: listeners go quiet.
        self.cancel.listening.cancel_all();
        self.sink.lock().take();
        self.listeners.lock().take();

        let activation = self.cancel.activation.cancel_and_advance();
        self.schedule_auto_reset(signal.generation);

        if self.config.alarm.voice_alert {
            if let Some(synth) = &self.synthesizer {
                let alarm = VoiceAlarm::new(Arc::clone(synth), &self.config.alarm);
                tokio::spawn(alarm.run(activation.clone()));
            }
        }

        let evidence = match &self.evidence {
            Some(capture) if self.config.evidence.auto_start => {
                let (relay_tx, relay_rx) = oneshot::channel();
                let released = self.camera_released.lock().clone();
                tokio::spawn(run_activation_evidence(
                    Arc::clone(capture),
                    activation,
                    released,
                    relay_tx,
                ));
                Some(relay_rx)
            }
            _ => None,
        };

        let pipeline = ActivationPipeline {
            generation: signal.generation,
            triggered_at: Instant::now(),
            acquirer: Arc::clone(&self.acquirer),
            enrichment: Arc::clone(&self.enrichment),
            dispatcher: Arc::clone(&self.dispatcher),
            evidence,
            events: self.events.clone(),
            metrics: Arc::clone(&self.metrics),
        };
        *self.pipeline.lock() = Some(tokio::spawn(pipeline.run()));
    }

    fn schedule_auto_reset(&self, generation: u64) {
        let commands = self.commands.clone();
        let cooldown = self.config.alarm.cooldown();
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let _ = commands.send(Command::AutoReset { generation });
        });
    }

    fn on_auto_reset(&self, generation: u64) {
        match self.state.reset(generation) {
            Some(transition) => {
                info!(generation, "cooldown elapsed, returning to idle");
                self.publish(&transition);
                self.wind_down();
            }
            None => debug!(generation, "auto-reset ignored"),
        }
    }

    /// Cancel listeners and everything the activation started, and release
    /// the camera even if the recording was started by hand.
    fn wind_down(&self) {
        self.cancel.cancel_all();
        self.sink.lock().take();
        self.listeners.lock().take();
        if let Some(capture) = &self.evidence {
            let capture = Arc::clone(capture);
            let released = CancellationToken::new();
            *self.camera_released.lock() = released.clone();
            tokio::spawn(async move {
                capture.close().await;
                released.cancel();
            });
        }
    }

    fn publish(&self, transition: &Transition) {
        self.events.emit(EngineEvent::StateChanged {
            from: transition.from,
            to: transition.to,
            generation: transition.session.generation,
        });
    }
}

fn released_token() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}

/// Record for the lifetime of one activation, then close (which uploads) and
/// hand the result to the pipeline. A recording already running is adopted;
/// the camera is released on the way out even if starting failed.
async fn run_activation_evidence(
    capture: Arc<EvidenceCapture>,
    activation: GenerationGuard,
    released: CancellationToken,
    relay: oneshot::Sender<Result<String, AlertError>>,
) {
    let started = tokio::select! {
        biased;
        _ = activation.cancelled() => None,
        r = async {
            released.cancelled().await;
            capture.start().await
        } => Some(r),
    };
    let ticket = match started {
        Some(Ok(Some(ticket))) => Some(ticket),
        Some(Ok(None)) => {
            debug!("recording already running, activation adopts it");
            None
        }
        Some(Err(e)) => {
            warn!(error = %e, "evidence capture unavailable");
            None
        }
        None => None,
    };

    activation.cancelled().await;
    capture.close().await;

    if let Some(ticket) = ticket {
        if let Ok(result) = ticket.await {
            let _ = relay.send(result);
        }
    }
}

async fn run_event_loop(
    engine: Weak<AlarmEngine>,
    mut triggers: mpsc::UnboundedReceiver<TriggerSignal>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    info!("engine event loop started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(signal) = triggers.recv() => {
                let Some(engine) = engine.upgrade() else { break };
                engine.on_trigger(signal);
            }
            Some(command) = commands.recv() => {
                let Some(engine) = engine.upgrade() else { break };
                match command {
                    Command::AutoReset { generation } => engine.on_auto_reset(generation),
                }
            }
            else => break,
        }
    }
    info!("engine event loop exiting");
}
