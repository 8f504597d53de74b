//! Evidence capture: watermarked audio/video recording and upload.
//!
//! `open` leases the camera and starts a render loop that stamps every frame
//! onto a shared surface. A recording samples that surface at a fixed rate, so
//! the watermark is part of the recorded pixels. `stop` finalizes the clip
//! and uploads it once; `close` also releases the device.
//!
//! `open` and `close` are serialized: a start that arrives while the device
//! is still opening joins that stream, and a close issued meanwhile releases
//! it once the open completes.

pub mod encoder;
pub mod upload;
pub mod watermark;

use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EvidenceConfig;
use crate::device::{
    AudioBlock, Capability, CapabilityTracker, MediaDevice, MediaStream, PermissionState, Subscription,
};
use crate::error::{AlertError, DeviceError};
use crate::events::{EngineEvent, EventBus};
use crate::location::LocationSample;
use crate::metrics::{metric_names, MetricsRegistry};

use self::encoder::{ClipEncoder, MjpegEncoder};
use self::upload::MediaUploader;
use self::watermark::{timestamp_text, Watermark};

/// Resolves with the evidence URL once the recording is uploaded.
pub type UploadTicket = oneshot::Receiver<Result<String, AlertError>>;

/// Exclusive-use lease for one physical camera/microphone pair.
#[derive(Clone)]
pub struct CameraLease {
    permit: Arc<Semaphore>,
}

impl CameraLease {
    pub fn new() -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
        }
    }

    fn try_acquire(&self) -> Result<OwnedSemaphorePermit, DeviceError> {
        Arc::clone(&self.permit)
            .try_acquire_owned()
            .map_err(|_| DeviceError::Busy(Capability::Camera))
    }

    pub fn is_held(&self) -> bool {
        self.permit.available_permits() == 0
    }
}

impl Default for CameraLease {
    fn default() -> Self {
        Self::new()
    }
}

/// Encoded chunks of one recording, in arrival order.
#[derive(Debug)]
pub struct EvidenceClip {
    id: Uuid,
    chunks: Vec<Vec<u8>>,
    content_type: String,
    file_extension: &'static str,
}

impl EvidenceClip {
    pub fn new(content_type: String, file_extension: &'static str) -> Self {
        Self {
            id: Uuid::new_v4(),
            chunks: Vec::new(),
            content_type,
            file_extension,
        }
    }

    pub fn push(&mut self, chunk: Vec<u8>) {
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate every chunk plus the container trailer.
    pub fn finalize(self, trailer: Vec<u8>) -> EvidenceBlob {
        let size: usize = self.chunks.iter().map(Vec::len).sum::<usize>() + trailer.len();
        let mut data = Vec::with_capacity(size);
        for chunk in self.chunks {
            data.extend_from_slice(&chunk);
        }
        data.extend_from_slice(&trailer);
        EvidenceBlob {
            id: self.id,
            data,
            content_type: self.content_type,
            file_name: format!("recording.{}", self.file_extension),
        }
    }
}

/// A finished clip ready for upload.
#[derive(Debug, Clone)]
pub struct EvidenceBlob {
    pub id: Uuid,
    pub data: Vec<u8>,
    pub content_type: String,
    pub file_name: String,
}

/// Latest watermarked frame plus the audio tap of the active recording.
#[derive(Default)]
struct Surface {
    frame: Mutex<Option<RgbaImage>>,
    audio_tap: Mutex<Option<mpsc::UnboundedSender<AudioBlock>>>,
}

impl Surface {
    fn snapshot(&self) -> Option<RgbaImage> {
        self.frame.lock().clone()
    }
}

struct OpenStream {
    _permit: OwnedSemaphorePermit,
    surface: Arc<Surface>,
    stop: CancellationToken,
    render: JoinHandle<()>,
}

struct Recording {
    stop: CancellationToken,
    task: JoinHandle<EvidenceBlob>,
    ticket: oneshot::Sender<Result<String, AlertError>>,
}

#[derive(Default)]
struct Inner {
    stream: Option<OpenStream>,
    recording: Option<Recording>,
}

pub struct EvidenceCapture {
    device: Arc<dyn MediaDevice>,
    lease: CameraLease,
    uploader: Arc<dyn MediaUploader>,
    location: watch::Receiver<Option<LocationSample>>,
    capabilities: Arc<CapabilityTracker>,
    events: EventBus,
    metrics: Arc<MetricsRegistry>,
    config: EvidenceConfig,
    watermark: Watermark,
    gate: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
    unsent: Mutex<Option<EvidenceBlob>>,
}

impl EvidenceCapture {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<dyn MediaDevice>,
        lease: CameraLease,
        uploader: Arc<dyn MediaUploader>,
        location: watch::Receiver<Option<LocationSample>>,
        capabilities: Arc<CapabilityTracker>,
        events: EventBus,
        metrics: Arc<MetricsRegistry>,
        config: EvidenceConfig,
    ) -> Self {
        Self {
            device,
            lease,
            uploader,
            location,
            capabilities,
            events,
            metrics,
            config,
            watermark: Watermark::default(),
            gate: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner::default()),
            unsent: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().stream.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().recording.is_some()
    }

    /// Acquire the camera/microphone and start the render loop. Opening an
    /// already-open capture is a no-op.
    pub async fn open(&self) -> Result<(), DeviceError> {
        let _gate = self.gate.lock().await;
        if self.is_open() {
            return Ok(());
        }
        let permit = self.lease.try_acquire()?;
        let stream = match self.device.open().await {
            Ok(stream) => stream,
            Err(e) => {
                if let DeviceError::PermissionDenied(cap) = &e {
                    self.capabilities.set(*cap, PermissionState::Denied);
                    self.events.report(AlertError::PermissionDenied(*cap));
                }
                return Err(e);
            }
        };
        self.capabilities.set(Capability::Camera, PermissionState::Granted);
        info!(width = stream.width, height = stream.height, "evidence_stream_opened");

        let surface = Arc::new(Surface::default());
        let stop = CancellationToken::new();
        let render = tokio::spawn(render_loop(
            stream,
            Arc::clone(&surface),
            self.watermark,
            self.location.clone(),
            stop.clone(),
        ));

        self.inner.lock().stream = Some(OpenStream {
            _permit: permit,
            surface,
            stop,
            render,
        });
        Ok(())
    }

    /// Start recording, opening the stream first if needed. Returns `None`
    /// when a recording is already running.
    pub async fn start(&self) -> Result<Option<UploadTicket>, DeviceError> {
        self.open().await?;

        let mut inner = self.inner.lock();
        if inner.recording.is_some() {
            debug!("recording already in progress");
            return Ok(None);
        }
        let Some(stream) = inner.stream.as_ref() else {
            return Err(DeviceError::Unavailable("evidence stream closed".into()));
        };

        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        *stream.surface.audio_tap.lock() = Some(audio_tx);

        let stop = CancellationToken::new();
        let encoder = MjpegEncoder::new(self.config.jpeg_quality);
        let task = tokio::spawn(record(
            Arc::clone(&stream.surface),
            Box::new(encoder),
            self.config.fps,
            audio_rx,
            stop.clone(),
        ));
        let (ticket_tx, ticket_rx) = oneshot::channel();
        inner.recording = Some(Recording {
            stop,
            task,
            ticket: ticket_tx,
        });
        drop(inner);

        self.events.emit(EngineEvent::RecordingStarted);
        info!(fps = self.config.fps, "recording_started");
        Ok(Some(ticket_rx))
    }

    /// Stop the recording and upload the clip. `None` if nothing was recording.
    pub async fn stop(&self) -> Option<Result<String, AlertError>> {
        let recording = {
            let mut inner = self.inner.lock();
            let recording = inner.recording.take()?;
            if let Some(stream) = &inner.stream {
                stream.surface.audio_tap.lock().take();
            }
            recording
        };
        recording.stop.cancel();

        let result = match recording.task.await {
            Ok(blob) => self.upload(blob).await,
            Err(e) => {
                error!(error = %e, "recording task failed");
                Err(AlertError::UploadError(format!("recording failed: {e}")))
            }
        };
        let _ = recording.ticket.send(result.clone());
        Some(result)
    }

    async fn upload(&self, blob: EvidenceBlob) -> Result<String, AlertError> {
        let span = self.metrics.span(metric_names::EVIDENCE_UPLOADED);
        info!(clip = %blob.id, bytes = blob.data.len(), "uploading evidence");
        match self.uploader.upload(&blob).await {
            Ok(url) => {
                span.finish();
                self.events.emit(EngineEvent::EvidenceUploaded { url: url.clone() });
                Ok(url)
            }
            Err(e) => {
                let err = AlertError::UploadError(e.to_string());
                warn!(clip = %blob.id, error = %e, "evidence upload failed, clip kept");
                *self.unsent.lock() = Some(blob);
                self.events.report(err.clone());
                Err(err)
            }
        }
    }

    /// The last clip whose upload failed. Never re-sent automatically.
    pub fn take_unsent_clip(&self) -> Option<EvidenceBlob> {
        self.unsent.lock().take()
    }

    /// Stop (and upload) any recording, then release the device.
    pub async fn close(&self) {
        let _gate = self.gate.lock().await;
        self.stop().await;
        let stream = self.inner.lock().stream.take();
        if let Some(stream) = stream {
            stream.stop.cancel();
            if let Err(e) = stream.render.await {
                error!(error = %e, "render loop failed");
            }
            info!("evidence_stream_released");
        }
    }
}

async fn render_loop(
    mut stream: MediaStream,
    surface: Arc<Surface>,
    watermark: Watermark,
    location: watch::Receiver<Option<LocationSample>>,
    stop: CancellationToken,
) {
    let mut audio_open = stream.audio.is_some();
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            frame = stream.video.recv() => {
                let Some(frame) = frame else {
                    warn!("camera stream ended");
                    break;
                };
                let mut image = frame.image;
                let label = location.borrow().map(|s| s.short_label());
                watermark.stamp(&mut image, &timestamp_text(chrono::Local::now()), label.as_deref());
                *surface.frame.lock() = Some(image);
            }
            block = next_audio(&mut stream.audio), if audio_open => {
                match block {
                    Some(block) => {
                        if let Some(tap) = surface.audio_tap.lock().as_ref() {
                            let _ = tap.send(block);
                        }
                    }
                    None => audio_open = false,
                }
            }
        }
    }
    stream.release();
}

async fn next_audio(audio: &mut Option<Subscription<AudioBlock>>) -> Option<AudioBlock> {
    match audio.as_mut() {
        Some(audio) => audio.recv().await,
        None => None,
    }
}

async fn record(
    surface: Arc<Surface>,
    mut encoder: Box<dyn ClipEncoder>,
    fps: u32,
    mut audio: mpsc::UnboundedReceiver<AudioBlock>,
    stop: CancellationToken,
) -> EvidenceBlob {
    let mut clip = EvidenceClip::new(encoder.content_type(), encoder.file_extension());
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / fps.max(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Some(block) = audio.recv() => {
                let offset = started.elapsed().as_millis() as u64;
                match encoder.encode_audio(&block, offset) {
                    Ok(chunk) => clip.push(chunk),
                    Err(e) => debug!(error = %e, "audio block dropped"),
                }
            }
            _ = ticker.tick() => {
                let Some(frame) = surface.snapshot() else { continue };
                let offset = started.elapsed().as_millis() as u64;
                match encoder.encode_frame(&frame, offset) {
                    Ok(chunk) => clip.push(chunk),
                    Err(e) => debug!(error = %e, "frame dropped"),
                }
            }
        }
    }

    debug!(chunks = clip.chunk_count(), "recording stopped");
    let trailer = encoder.finish();
    clip.finalize(trailer)
}
