//! Duplex channel management
//!
//! Each channel is one WebSocket driven by a single task: it connects,
//! drains the outbound queue in order, and decodes inbound frames into the
//! channel's message type. Messages sent while the socket is still
//! connecting are queued and flushed once it opens. The queue is bounded:
//! when the socket stalls, further sends are refused rather than buffered.
//! A channel that closes or fails stays dead; there is no reconnect.

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Outbound messages held while the socket connects or stalls.
pub const OUTBOUND_CAPACITY: usize = 32;

/// How long `close` waits for queued messages and the close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Transcription,
    Dialogue,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Transcription => write!(f, "transcription"),
            ChannelKind::Dialogue => write!(f, "dialogue"),
        }
    }
}

/// Lifecycle of one channel. `Closed` and `Errored` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Errored)
    }

    /// Whether a send would be accepted in this state.
    pub fn accepts_sends(self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Open)
    }
}

/// Events a channel delivers to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent<M> {
    Opened,
    Message(M),
    Closed,
    Errored(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("{kind} channel is not open ({state:?})")]
    NotOpen { kind: ChannelKind, state: ChannelState },

    #[error("{kind} channel outbound queue is full")]
    QueueFull { kind: ChannelKind },

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Handle to one duplex channel.
pub struct Channel {
    kind: ChannelKind,
    state: watch::Receiver<ChannelState>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    outbound: mpsc::Sender<Message>,
    task: JoinHandle<()>,
}

impl Channel {
    /// Start connecting to `url`. Returns at once; inbound messages decoded
    /// as `M` arrive on the returned receiver.
    pub fn open<M>(kind: ChannelKind, url: &str) -> (Self, mpsc::UnboundedReceiver<ChannelEvent<M>>)
    where
        M: DeserializeOwned + Send + 'static,
    {
        let (state_tx, state) = watch::channel(ChannelState::Connecting);
        let state_tx = Arc::new(state_tx);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_socket(
            kind,
            url.to_string(),
            outbound_rx,
            events_tx,
            state_tx.clone(),
        ));

        let channel = Self {
            kind,
            state,
            state_tx,
            outbound,
            task,
        };
        (channel, events_rx)
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Wait until the channel leaves `Connecting`.
    pub async fn wait_open(&self) -> ChannelState {
        let mut state = self.state.clone();
        let settled = match state.wait_for(|s| *s != ChannelState::Connecting).await {
            Ok(s) => *s,
            Err(_) => self.state(),
        };
        settled
    }

    /// Queue a text frame.
    pub fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        self.send(Message::Text(text.into()))
    }

    /// Queue a JSON payload as a text frame.
    pub fn send_json<T: Serialize>(&self, payload: &T) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(payload)?;
        self.send_text(text)
    }

    fn send(&self, message: Message) -> Result<(), ConnectionError> {
        let state = self.state();
        if !state.accepts_sends() {
            warn!("📪 Dropping outbound message on {} channel: {:?}", self.kind, state);
            return Err(ConnectionError::NotOpen {
                kind: self.kind,
                state,
            });
        }
        match self.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("📪 {} channel queue full, dropping message", self.kind);
                Err(ConnectionError::QueueFull { kind: self.kind })
            }
            Err(TrySendError::Closed(_)) => {
                // the socket task is gone, so the state is already terminal
                let state = self.state();
                warn!("📪 {} channel task has exited ({:?})", self.kind, state);
                Err(ConnectionError::NotOpen {
                    kind: self.kind,
                    state,
                })
            }
        }
    }

    /// Close the channel. Queued messages are flushed before the close
    /// frame; the socket task gets `CLOSE_TIMEOUT` to finish.
    pub async fn close(mut self) {
        if self.state().is_terminal() {
            return;
        }
        info!("Closing {} channel", self.kind);
        transition(&self.state_tx, ChannelState::Closed);

        let outbound = &self.outbound;
        let task = &mut self.task;
        let flushed = tokio::time::timeout(CLOSE_TIMEOUT, async move {
            if outbound.send(Message::Close(None)).await.is_ok() {
                let _ = task.await;
            }
        })
        .await;
        if flushed.is_err() {
            warn!("⏱️ {} channel did not close in time", self.kind);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Move to `next` unless already in a terminal state.
fn transition(state: &watch::Sender<ChannelState>, next: ChannelState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() || *current == next {
            return false;
        }
        *current = next;
        true
    })
}

/// Decode one inbound frame. `None` means the frame carries nothing for
/// the owner (control frames, malformed payloads).
pub fn dispatch<M: DeserializeOwned>(kind: ChannelKind, message: Message) -> Option<ChannelEvent<M>> {
    let text = match &message {
        Message::Text(text) => text.as_str(),
        Message::Binary(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                warn!("Dropping non-UTF-8 binary frame on {} channel ({} bytes)", kind, bytes.len());
                return None;
            }
        },
        Message::Close(frame) => {
            info!("{} channel closed by peer: {:?}", kind, frame);
            return Some(ChannelEvent::Closed);
        }
        _ => return None,
    };

    match serde_json::from_str::<M>(text) {
        Ok(msg) => Some(ChannelEvent::Message(msg)),
        Err(e) => {
            warn!("Dropping malformed message on {} channel: {}", kind, e);
            debug!("Raw message: {}", text);
            None
        }
    }
}

async fn run_socket<M>(
    kind: ChannelKind,
    url: String,
    mut outbound_rx: mpsc::Receiver<Message>,
    events: mpsc::UnboundedSender<ChannelEvent<M>>,
    state: Arc<watch::Sender<ChannelState>>,
) where
    M: DeserializeOwned + Send + 'static,
{
    info!("🔌 Connecting {} channel to {}", kind, url);
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _resp)) => ws,
        Err(e) => {
            error!("❌ {} channel failed to open: {}", kind, e);
            transition(&state, ChannelState::Errored);
            let _ = events.send(ChannelEvent::Errored(e.to_string()));
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    if !transition(&state, ChannelState::Open) {
        // closed by the owner while connecting: flush what was queued, then close
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
        return;
    }
    info!("✅ {} channel open", kind);
    let _ = events.send(ChannelEvent::Opened);

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(message) = outgoing else {
                    let _ = sink.close().await;
                    break;
                };
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    error!("❌ {} channel send failed: {}", kind, e);
                    transition(&state, ChannelState::Errored);
                    let _ = events.send(ChannelEvent::Errored(e.to_string()));
                    break;
                }
                if closing {
                    let _ = events.send(ChannelEvent::Closed);
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(message)) => match dispatch::<M>(kind, message) {
                    Some(ChannelEvent::Closed) => {
                        transition(&state, ChannelState::Closed);
                        let _ = events.send(ChannelEvent::Closed);
                        break;
                    }
                    Some(event) => {
                        if events.send(event).is_err() {
                            debug!("{} channel owner is gone", kind);
                            break;
                        }
                    }
                    None => {}
                },
                Some(Err(e)) => {
                    error!("❌ {} channel error: {}", kind, e);
                    transition(&state, ChannelState::Errored);
                    let _ = events.send(ChannelEvent::Errored(e.to_string()));
                    break;
                }
                None => {
                    info!("{} channel stream ended", kind);
                    transition(&state, ChannelState::Closed);
                    let _ = events.send(ChannelEvent::Closed);
                    break;
                }
            }
        }
    }
    debug!("{} channel task terminated", kind);
}
