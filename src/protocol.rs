//! Wire types for the two service channels
//!
//! Transcription channel: outbound frames are bare base64 text, inbound
//! messages are JSON tagged on `type`. Dialogue channel: outbound requests
//! carry the full conversation context, inbound messages are tagged on
//! `type` and carry a `status`.

use crate::history::ChatMessage;
use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Status value the dialogue service attaches to well-formed replies.
pub const STATUS_SUCCESS: &str = "success";

/// Inbound message on the transcription channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptionMessage {
    Transcription {
        text: String,
        #[serde(default)]
        is_final: bool,
    },
}

/// Inbound message on the dialogue channel, before status filtering.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DialogueEnvelope {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub message: DialogueMessage,
}

impl DialogueEnvelope {
    /// Unwrap the payload of a successful reply. Anything else is a server
    /// side failure and yields the offending status instead.
    pub fn into_success(self) -> Result<DialogueMessage, String> {
        match self.status.as_deref() {
            Some(STATUS_SUCCESS) => Ok(self.message),
            Some(other) => Err(other.to_string()),
            None => Err("<missing>".to_string()),
        }
    }
}

/// Streamed reply events from the dialogue service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DialogueMessage {
    /// One fragment of reply text
    Chunk { text: String },
    /// One synthesized segment, base64 encoded
    Audio { audio: String },
    /// The reply is finished
    Complete,
}

/// Outbound request on the dialogue channel.
#[derive(Debug, Serialize)]
pub struct DialogueRequest {
    pub context: VecDeque<ChatMessage>,
}

/// Encode one captured frame for the transcription channel.
pub fn encode_frame(pcm: &[u8]) -> String {
    general_purpose::STANDARD.encode(pcm)
}

/// Decode a base64 audio payload from the dialogue channel.
pub fn decode_audio(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    general_purpose::STANDARD.decode(data)
}
