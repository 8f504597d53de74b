//! Audible alarm: repeats a spoken phrase until the activation is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancellation::GenerationGuard;
use crate::config::AlarmConfig;
use crate::device::{SpeechSynthesizer, Utterance};

pub struct VoiceAlarm {
    synth: Arc<dyn SpeechSynthesizer>,
    utterance: Utterance,
    pause: Duration,
}

impl VoiceAlarm {
    pub fn new(synth: Arc<dyn SpeechSynthesizer>, config: &AlarmConfig) -> Self {
        Self {
            synth,
            utterance: Utterance {
                text: config.voice_text.clone(),
                rate: 1.2,
                pitch: 1.2,
                volume: 1.0,
            },
            pause: Duration::from_millis(config.voice_pause_ms),
        }
    }

    /// Speak, pause, repeat. Returns once `guard` is cancelled.
    pub async fn run(self, guard: GenerationGuard) {
        self.synth.cancel();
        info!(text = %self.utterance.text, "voice_alarm_started");
        let mut repeats = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = guard.cancelled() => break,
                res = self.synth.speak(&self.utterance) => {
                    if let Err(e) = res {
                        warn!(error = %e, "speech failed");
                    }
                }
            }
            repeats += 1;
            tokio::select! {
                biased;
                _ = guard.cancelled() => break,
                _ = tokio::time::sleep(self.pause) => {}
            }
        }
        self.synth.cancel();
        debug!(repeats, "voice_alarm_stopped");
    }
}
