//! Keyword spotting over a continuous speech transcript.
//! Fires when the safety word is heard twice in a row ("help help",
//! "help, help!"). The recognizer session is restarted after a fixed back-off
//! whenever it ends or errors, until the listening scope is cancelled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use super::TriggerSink;
use crate::cancellation::GenerationGuard;
use crate::device::{
    Capability, CapabilityTracker, PermissionState, RecognitionError, RecognitionEvent, SpeechRecognizer,
};
use crate::events::{EngineEvent, EventBus};
use crate::state_machine::TriggerSource;

/// Matches two or more consecutive occurrences of the safety word.
#[derive(Debug, Clone)]
pub struct PhraseMatcher {
    re: Regex,
}

impl PhraseMatcher {
    pub fn new(word: &str) -> Result<Self, regex::Error> {
        let word = regex::escape(word.trim());
        let re = Regex::new(&format!(r"(?i)(?:{word}[\s\p{{P}}]*){{2,}}"))?;
        Ok(Self { re })
    }

    pub fn matches(&self, transcript: &str) -> bool {
        self.re.is_match(transcript)
    }
}

/// Transcript of one recognition session. Interim results for an index are
/// replaced by later ones for the same index.
#[derive(Debug, Default)]
pub struct TranscriptBuffer {
    results: BTreeMap<usize, String>,
}

impl TranscriptBuffer {
    pub fn update(&mut self, index: usize, transcript: &str) {
        self.results.insert(index, transcript.to_string());
    }

    pub fn text(&self) -> String {
        self.results
            .values()
            .map(|s| s.trim())
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn clear(&mut self) {
        self.results.clear();
    }
}

enum SessionEnd {
    Matched,
    Ended,
    Revoked,
    Cancelled,
}

pub struct KeywordListener {
    recognizer: Arc<dyn SpeechRecognizer>,
    matcher: PhraseMatcher,
    backoff: Duration,
    capabilities: Arc<CapabilityTracker>,
    events: EventBus,
}

impl KeywordListener {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        matcher: PhraseMatcher,
        backoff: Duration,
        capabilities: Arc<CapabilityTracker>,
        events: EventBus,
    ) -> Self {
        Self {
            recognizer,
            matcher,
            backoff,
            capabilities,
            events,
        }
    }

    /// Listen until a match, a permission revocation, or cancellation.
    pub async fn run(self, guard: GenerationGuard, sink: TriggerSink) {
        let mut restarts = 0u32;
        while guard.should_continue() {
            let end = self.session(&guard).await;
            match end {
                SessionEnd::Matched => {
                    info!(restarts, "safety phrase detected");
                    sink.fire(TriggerSource::Voice);
                    return;
                }
                SessionEnd::Revoked => {
                    self.capabilities.set(Capability::Microphone, PermissionState::Denied);
                    self.events.emit(EngineEvent::CapabilityRevoked(Capability::Microphone));
                    warn!("microphone access revoked, keyword spotting stopped");
                    return;
                }
                SessionEnd::Cancelled => return,
                SessionEnd::Ended => {
                    tokio::select! {
                        biased;
                        _ = guard.cancelled() => return,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                    restarts += 1;
                    debug!(restarts, "restarting recognition");
                }
            }
        }
    }

    async fn session(&self, guard: &GenerationGuard) -> SessionEnd {
        let started = tokio::select! {
            biased;
            _ = guard.cancelled() => return SessionEnd::Cancelled,
            r = self.recognizer.start() => r,
        };
        let mut events = match started {
            Ok(events) => events,
            Err(RecognitionError::NotAllowed) => return SessionEnd::Revoked,
            Err(e) => {
                warn!(error = %e, "recognition failed to start");
                return SessionEnd::Ended;
            }
        };

        let mut transcript = TranscriptBuffer::default();
        let end = loop {
            let event = tokio::select! {
                biased;
                _ = guard.cancelled() => break SessionEnd::Cancelled,
                ev = events.recv() => ev,
            };
            match event {
                Some(RecognitionEvent::Result {
                    index, transcript: text, ..
                }) => {
                    transcript.update(index, &text);
                    if self.matcher.matches(&transcript.text()) {
                        break SessionEnd::Matched;
                    }
                }
                Some(RecognitionEvent::Error(RecognitionError::NotAllowed)) => break SessionEnd::Revoked,
                Some(RecognitionEvent::Error(e)) => {
                    debug!(error = %e, "recognition error");
                    break SessionEnd::Ended;
                }
                Some(RecognitionEvent::End) | None => break SessionEnd::Ended,
            }
        };
        events.stop();
        end
    }
}
