//! Trigger fusion.
//! Manual, shake and keyword sources of one arming cycle share a latch, so at
//! most one trigger reaches the engine per cycle no matter how many fire.

pub mod keyword;
pub mod shake;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancellation::GenerationGuard;
use crate::config::{KeywordConfig, ShakeConfig};
use crate::device::{
    Capability, CapabilityTracker, MotionSample, MotionSensor, PermissionState, SpeechRecognizer, Subscription,
};
use crate::error::DeviceError;
use crate::events::EventBus;
use crate::state_machine::TriggerSource;

use self::keyword::{KeywordListener, PhraseMatcher};
use self::shake::{ShakeDetector, ShakeStatus};

/// A trigger that made it through the latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSignal {
    pub source: TriggerSource,
    pub generation: u64,
}

/// Per-cycle entry point for every trigger source.
#[derive(Clone)]
pub struct TriggerSink {
    latch: Arc<AtomicBool>,
    generation: u64,
    tx: mpsc::UnboundedSender<TriggerSignal>,
}

impl TriggerSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TriggerSignal>) -> Self {
        Self {
            latch: Arc::new(AtomicBool::new(false)),
            generation,
            tx,
        }
    }

    /// Deliver a trigger. Only the first call per cycle goes through.
    pub fn fire(&self, source: TriggerSource) -> bool {
        if self.latch.swap(true, Ordering::SeqCst) {
            debug!(source = %source, generation = self.generation, "trigger suppressed by latch");
            return false;
        }
        info!(source = %source, generation = self.generation, "trigger_fired");
        self.tx
            .send(TriggerSignal {
                source,
                generation: self.generation,
            })
            .is_ok()
    }

    pub fn has_fired(&self) -> bool {
        self.latch.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Background listener tasks of one arming cycle.
pub struct DetectorHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl DetectorHandle {
    /// Add a listener that started later in the cycle.
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct TriggerDetector {
    motion: Option<Arc<dyn MotionSensor>>,
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    shake: ShakeConfig,
    keyword: KeywordConfig,
    capabilities: Arc<CapabilityTracker>,
    events: EventBus,
}

impl TriggerDetector {
    pub fn new(
        motion: Option<Arc<dyn MotionSensor>>,
        recognizer: Option<Arc<dyn SpeechRecognizer>>,
        shake: ShakeConfig,
        keyword: KeywordConfig,
        capabilities: Arc<CapabilityTracker>,
        events: EventBus,
    ) -> Self {
        Self {
            motion,
            recognizer,
            shake,
            keyword,
            capabilities,
            events,
        }
    }

    /// Start the shake listener for one cycle. It needs no prompt, so it runs
    /// from the moment the alarm is armed. Stops when `guard` is cancelled or
    /// the cycle's trigger fires.
    pub fn start(&self, sink: TriggerSink, guard: GenerationGuard) -> DetectorHandle {
        let mut tasks = Vec::new();

        if let Some(motion) = &self.motion {
            match motion.subscribe() {
                Ok(samples) => {
                    let detector = ShakeDetector::new(&self.shake);
                    tasks.push(tokio::spawn(run_shake(samples, detector, guard, sink)));
                }
                Err(DeviceError::PermissionDenied(_)) => {
                    self.capabilities.set(Capability::Motion, PermissionState::Denied);
                    warn!("motion access denied, shake trigger unavailable");
                }
                Err(e) => warn!(error = %e, "motion sensor unavailable"),
            }
        }

        DetectorHandle { tasks }
    }

    /// Keyword spotting for the same cycle, once the microphone is granted.
    /// `None` without a recognizer or with an unusable safety word.
    pub fn start_keyword(&self, sink: TriggerSink, guard: GenerationGuard) -> Option<JoinHandle<()>> {
        let recognizer = self.recognizer.as_ref()?;
        let matcher = match PhraseMatcher::new(&self.keyword.safety_word) {
            Ok(matcher) => matcher,
            Err(e) => {
                warn!(error = %e, "invalid safety word, keyword spotting disabled");
                return None;
            }
        };
        let listener = KeywordListener::new(
            Arc::clone(recognizer),
            matcher,
            self.keyword.restart_backoff(),
            Arc::clone(&self.capabilities),
            self.events.clone(),
        );
        Some(tokio::spawn(listener.run(guard, sink)))
    }
}

async fn run_shake(
    mut samples: Subscription<MotionSample>,
    mut detector: ShakeDetector,
    guard: GenerationGuard,
    sink: TriggerSink,
) {
    loop {
        let sample = tokio::select! {
            biased;
            _ = guard.cancelled() => break,
            s = samples.recv() => s,
        };
        let Some(sample) = sample else { break };
        if sink.has_fired() {
            break;
        }
        if let ShakeStatus::Fired { speed } = detector.observe(&sample) {
            info!(speed, "shake detected");
            sink.fire(TriggerSource::Shake);
            break;
        }
    }
    samples.stop();
}
