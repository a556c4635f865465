//! Talkback - spoken conversation client
//!
//! Streams microphone audio to a transcription service, turns recognized
//! utterances into dialogue requests, and plays the streamed reply text and
//! synthesized audio back in order. The user can barge in at any time.

#![forbid(unsafe_code)]

/// Microphone capture engine
pub mod capture;
/// Environment driven configuration
pub mod config;
/// Duplex channel management
pub mod connection;
/// Conversation log and its persistence
pub mod history;
/// Ordered playback of synthesized segments
pub mod playback;
/// Wire types for the transcription and dialogue channels
pub mod protocol;
/// The session coordinator
pub mod session;
/// Utterance assembly from recognition events
pub mod transcript;
/// Turn pipeline between recognized speech and the dialogue service
pub mod turn;
/// Amplitude metering of the active segment
pub mod volume;

pub use config::SessionConfig;
pub use session::{Command, Session, SessionError, SessionUpdate};
