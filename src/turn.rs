//! Turn pipeline
//!
//! Owns the conversation log and the in-flight reply buffer. A completed
//! user utterance closes any reply still streaming, is appended, and the
//! whole log becomes the next dialogue request. Streamed reply events are
//! folded into the buffer and committed as one assistant message on
//! `complete`.
//!
//! The dialogue service answers requests strictly in order, so a reply cut
//! short by barge-in keeps streaming until its own `complete`. Everything
//! it sends after the cut belongs to a dead turn and is dropped.

use crate::history::{ChatHistory, ChatMessage, HistoryStore, Role};
use crate::playback::AudioSegment;
use crate::protocol::{decode_audio, DialogueMessage, DialogueRequest};
use tracing::{debug, info, warn};

/// Result of starting a new user turn.
#[derive(Debug)]
pub struct TurnStart {
    /// Reply that was still streaming and got closed early
    pub interrupted: Option<ChatMessage>,
    pub request: DialogueRequest,
}

/// What the session must do after a dialogue event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogueEffect {
    /// Show the fragment as part of the live reply
    Streaming(String),
    /// Queue the segment for playback
    Enqueue(AudioSegment),
    /// A reply was committed to the log
    Committed(ChatMessage),
    Ignored,
}

pub struct TurnPipeline {
    history: ChatHistory,
    response: String,
    /// Requests sent whose `complete` has not arrived yet
    in_flight: usize,
    /// Whether the newest in-flight request still belongs to this conversation
    live: bool,
    store: Box<dyn HistoryStore>,
    key: String,
}

impl TurnPipeline {
    /// Build a pipeline, restoring any log persisted under `key`.
    pub fn restore(capacity: usize, store: Box<dyn HistoryStore>, key: &str) -> Self {
        let history = match store.load(key) {
            Ok(Some(blob)) => match ChatHistory::from_json(capacity, &blob) {
                Ok(history) => {
                    info!("📜 Restored {} of up to {} messages", history.len(), history.capacity());
                    history
                }
                Err(e) => {
                    warn!("Ignoring corrupt persisted history: {}", e);
                    ChatHistory::with_capacity(capacity)
                }
            },
            Ok(None) => ChatHistory::with_capacity(capacity),
            Err(e) => {
                warn!("Could not load persisted history: {}", e);
                ChatHistory::with_capacity(capacity)
            }
        };

        Self {
            history,
            response: String::new(),
            in_flight: 0,
            live: true,
            store,
            key: key.to_string(),
        }
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    /// The reply text streamed so far in the current turn.
    pub fn response(&self) -> &str {
        &self.response
    }

    /// Start a new turn from a completed utterance.
    pub fn begin_turn(&mut self, text: String) -> TurnStart {
        let interrupted = if self.in_flight > 0 && !self.response.is_empty() {
            info!("✂️ Barge-in closed the streaming reply");
            Some(self.commit_response())
        } else {
            None
        };
        // any reply still streaming is now stale
        self.response.clear();

        info!("🗣️ User: {}", text);
        self.history.push(ChatMessage::new(Role::User, text));
        self.persist();
        self.in_flight += 1;
        self.live = true;

        TurnStart {
            interrupted,
            request: DialogueRequest {
                context: self.history.messages().clone(),
            },
        }
    }

    /// Apply one successful dialogue event.
    pub fn on_dialogue(&mut self, message: DialogueMessage) -> DialogueEffect {
        match message {
            DialogueMessage::Chunk { text } => {
                if self.streaming_stale() {
                    debug!("Dropping chunk of an interrupted reply");
                    return DialogueEffect::Ignored;
                }
                self.response.push_str(&text);
                DialogueEffect::Streaming(text)
            }
            DialogueMessage::Audio { audio } => {
                if self.streaming_stale() {
                    debug!("Dropping audio of an interrupted reply");
                    return DialogueEffect::Ignored;
                }
                match decode_audio(&audio) {
                    Ok(bytes) => DialogueEffect::Enqueue(AudioSegment::new(bytes)),
                    Err(e) => {
                        warn!("Dropping undecodable audio segment: {}", e);
                        DialogueEffect::Ignored
                    }
                }
            }
            DialogueMessage::Complete => {
                let stale = self.streaming_stale();
                self.in_flight = self.in_flight.saturating_sub(1);
                if stale {
                    // already committed at barge-in, or forgotten by a reset
                    debug!("Absorbing completion of an interrupted reply");
                    return DialogueEffect::Ignored;
                }
                DialogueEffect::Committed(self.commit_response())
            }
        }
    }

    /// True while the reply being streamed is not the current turn's.
    fn streaming_stale(&self) -> bool {
        self.in_flight > 1 || (self.in_flight == 1 && !self.live)
    }

    /// Forget the conversation, including its persisted copy.
    pub fn reset(&mut self) {
        self.history.clear();
        self.response.clear();
        // a reply still streaming belongs to the forgotten conversation
        self.live = false;
        if let Err(e) = self.store.remove(&self.key) {
            warn!("Could not remove persisted history: {}", e);
        }
        info!("🧹 History cleared");
    }

    fn commit_response(&mut self) -> ChatMessage {
        let message = ChatMessage::new(Role::Assistant, std::mem::take(&mut self.response));
        debug!("Committing reply ({} chars)", message.content.len());
        self.history.push(message.clone());
        self.persist();
        message
    }

    fn persist(&self) {
        let blob = match self.history.to_json() {
            Ok(blob) => blob,
            Err(e) => {
                warn!("Could not serialize history: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.save(&self.key, &blob) {
            warn!("Could not persist history: {}", e);
        }
    }
}
