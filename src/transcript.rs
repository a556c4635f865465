//! Utterance assembly
//!
//! Partial recognition results overwrite each other as live feedback; a
//! final result closes the utterance. When the transcription service never
//! marks results final, a silence timeout can close the utterance instead.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// How the end of an utterance is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentationPolicy {
    /// The service's `is_final` flag ends the utterance
    #[default]
    FinalFlag,
    /// Legacy fallback: the utterance ends once no new text arrived for the timeout
    SilenceTimeout(Duration),
}

/// One complete unit of recognized user speech.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
}

#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    policy: SegmentationPolicy,
    pending: Option<String>,
    deadline: Option<Instant>,
}

impl TranscriptAssembler {
    pub fn new(policy: SegmentationPolicy) -> Self {
        Self {
            policy,
            pending: None,
            deadline: None,
        }
    }

    /// The in-progress text, if any.
    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// When the silence fallback will close the current utterance.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Feed one recognition event. Returns the completed utterance when the
    /// event closes one.
    pub fn on_event(&mut self, text: String, is_final: bool, now: Instant) -> Option<Utterance> {
        if is_final {
            self.deadline = None;
            self.pending = None;
            return Self::emit(text);
        }

        debug!("Partial transcript: {}", text);
        if let SegmentationPolicy::SilenceTimeout(timeout) = self.policy {
            if !text.trim().is_empty() {
                self.deadline = Some(now + timeout);
            }
        }
        self.pending = Some(text);
        None
    }

    /// Close the utterance if the silence deadline has passed.
    pub fn on_deadline(&mut self, now: Instant) -> Option<Utterance> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                let text = self.pending.take()?;
                debug!("Silence timeout closed utterance");
                Self::emit(text)
            }
            _ => None,
        }
    }

    /// Forget any in-progress text.
    pub fn clear(&mut self) {
        self.pending = None;
        self.deadline = None;
    }

    // Empty finals close the utterance without starting a turn.
    fn emit(text: String) -> Option<Utterance> {
        if text.trim().is_empty() {
            debug!("Suppressing empty utterance");
            return None;
        }
        Some(Utterance { text })
    }
}
