//! Session coordinator
//!
//! One explicit session object owns both channels, the capture engine,
//! the turn pipeline and the playback queue. [`Session::run`] is the only
//! task that mutates any of them: it multiplexes user commands, captured
//! frames, transcription events, dialogue events and playback completions
//! with `select!`, so every handler runs to completion before the next
//! event is looked at.

use crate::capture::{CaptureEngine, CaptureEvent, CaptureState, DeviceProvider, PulseDevices};
use crate::config::SessionConfig;
use crate::connection::{Channel, ChannelEvent, ChannelKind, ChannelState};
use crate::history::{ChatMessage, FileStore, HistoryStore};
use crate::playback::{PlaybackDone, PlaybackQueue, RodioPlayer, SegmentPlayer};
use crate::protocol::{encode_frame, DialogueEnvelope, TranscriptionMessage};
use crate::transcript::{TranscriptAssembler, Utterance};
use crate::turn::{DialogueEffect, TurnPipeline};
use crate::volume::{spawn_meter, Meter};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Requests from the user interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartCapture,
    PauseCapture,
    StopCapture,
    /// Start when idle or paused, stop when recording or starting
    ToggleCapture,
    /// Clear the conversation and any playback
    Reset,
    Shutdown,
}

/// What the user interface should show.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Live transcript of the utterance in progress
    Pending(Option<String>),
    /// A completed utterance that started a turn
    Utterance(String),
    /// One fragment of the streaming reply
    ReplyChunk(String),
    /// A message was committed to the log
    Committed(ChatMessage),
    Capture(CaptureState),
    CaptureFailed(String),
    /// A channel reached a terminal state; recreate the session to recover
    ChannelDown { kind: ChannelKind, state: ChannelState },
    HistoryCleared,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(#[from] crate::connection::ConnectionError),

    #[error("Capture error: {0}")]
    Capture(#[from] crate::capture::CaptureError),

    #[error("Playback error: {0}")]
    Playback(#[from] crate::playback::PlaybackError),

    #[error("Storage error: {0}")]
    Store(#[from] crate::history::StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

pub struct Session {
    transcription: Channel,
    transcription_rx: mpsc::UnboundedReceiver<ChannelEvent<TranscriptionMessage>>,
    dialogue: Channel,
    dialogue_rx: mpsc::UnboundedReceiver<ChannelEvent<DialogueEnvelope>>,
    capture: CaptureEngine,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    assembler: TranscriptAssembler,
    turns: TurnPipeline,
    playback: PlaybackQueue,
    playback_rx: mpsc::UnboundedReceiver<PlaybackDone>,
    meter: Meter,
    updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl Session {
    /// Build a session: start connecting both channels, restore the log,
    /// and prepare capture and playback. Must be called inside a runtime.
    pub fn open(
        config: &SessionConfig,
        devices: Arc<dyn DeviceProvider>,
        player: Arc<dyn SegmentPlayer>,
        store: Box<dyn HistoryStore>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        info!("🚀 Opening session");
        let (transcription, transcription_rx) =
            Channel::open::<TranscriptionMessage>(ChannelKind::Transcription, &config.transcription_url);
        let (dialogue, dialogue_rx) =
            Channel::open::<DialogueEnvelope>(ChannelKind::Dialogue, &config.dialogue_url);

        let (capture, capture_rx) = CaptureEngine::new(devices, config.frame_duration, config.sample_rate);
        let turns = TurnPipeline::restore(config.history_capacity, store, &config.storage_key);

        let tap = player.sample_tap();
        let (playback, playback_rx) = PlaybackQueue::new(player);
        let meter = spawn_meter(playback.subscribe(), tap, config.meter_interval);

        let (updates, updates_rx) = mpsc::unbounded_channel();
        let session = Self {
            transcription,
            transcription_rx,
            dialogue,
            dialogue_rx,
            capture,
            capture_rx,
            assembler: TranscriptAssembler::new(config.segmentation),
            turns,
            playback,
            playback_rx,
            meter,
            updates,
        };
        (session, updates_rx)
    }

    /// Open a session on the default output device and the configured
    /// PulseAudio source, persisting the log under `config.history_dir`.
    pub fn open_default(
        config: &SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionUpdate>), SessionError> {
        let player = RodioPlayer::open()?;
        let devices = PulseDevices::new(&config.app_name, config.input_device.clone());
        let store = FileStore::new(config.history_dir.clone());
        info!("💾 Persisting history under {:?}", store.dir());
        Ok(Self::open(config, Arc::new(devices), Arc::new(player), Box::new(store)))
    }

    /// Messages restored from the persisted log.
    pub fn history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.turns.history().iter()
    }

    /// Smoothed amplitude of whatever is playing.
    pub fn volume(&self) -> watch::Receiver<f32> {
        self.meter.level()
    }

    pub fn capture_state(&self) -> watch::Receiver<CaptureState> {
        self.capture.subscribe()
    }

    /// Wait until both channels have either opened or failed, returning
    /// the transcription and dialogue states.
    pub async fn wait_ready(&self) -> (ChannelState, ChannelState) {
        tokio::join!(self.transcription.wait_open(), self.dialogue.wait_open())
    }

    /// Drive the session until `Shutdown` or until the command sender is
    /// dropped, then tear everything down.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let deadline = self.assembler.deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.capture_rx.recv() => self.handle_capture(event),
                Some(event) = self.transcription_rx.recv() => self.handle_transcription(event),
                Some(event) = self.dialogue_rx.recv() => self.handle_dialogue(event),
                Some(done) = self.playback_rx.recv() => self.playback.on_finished(done),
                _ = wait_deadline(deadline) => {
                    if let Some(utterance) = self.assembler.on_deadline(Instant::now()) {
                        self.publish(SessionUpdate::Pending(None));
                        self.begin_turn(utterance);
                    }
                }
            }
        }
        self.teardown().await;
    }

    // ===== COMMANDS =====

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCapture => self.start_capture(),
            Command::PauseCapture => {
                self.capture.pause();
                self.publish(SessionUpdate::Capture(self.capture.state()));
            }
            Command::StopCapture => self.stop_capture(),
            Command::ToggleCapture => {
                match self.capture.state() {
                    CaptureState::Recording | CaptureState::Starting => self.stop_capture(),
                    CaptureState::Idle | CaptureState::Paused => self.start_capture(),
                }
            }
            Command::Reset => self.reset(),
            Command::Shutdown => {}
        }
    }

    /// Acquisition runs on the capture thread; its outcome comes back as
    /// a capture event.
    fn start_capture(&mut self) {
        let state = self.transcription.state();
        if state.is_terminal() {
            warn!("Not starting capture: transcription channel is {:?}", state);
            self.channel_down(ChannelKind::Transcription);
            return;
        }

        match self.capture.start() {
            Ok(()) => self.publish(SessionUpdate::Capture(self.capture.state())),
            Err(e) => {
                warn!("🎤 Capture failed to start: {}", e);
                self.publish(SessionUpdate::CaptureFailed(e.to_string()));
                self.publish(SessionUpdate::Capture(self.capture.state()));
            }
        }
    }

    fn stop_capture(&mut self) {
        self.capture.stop();
        self.publish(SessionUpdate::Capture(self.capture.state()));
    }

    fn reset(&mut self) {
        info!("🔄 Resetting session");
        self.playback.clear();
        self.assembler.clear();
        self.turns.reset();
        self.publish(SessionUpdate::Pending(None));
        self.publish(SessionUpdate::HistoryCleared);
    }

    // ===== CAPTURE =====

    fn handle_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Started => self.publish(SessionUpdate::Capture(self.capture.state())),
            CaptureEvent::Frame(frame) => {
                // frames still queued after a pause or stop are not sent
                if self.capture.state() != CaptureState::Recording {
                    debug!("Discarding frame {} captured before pause/stop", frame.seq);
                    return;
                }
                if let Err(e) = self.transcription.send_text(encode_frame(&frame.pcm)) {
                    debug!("Frame {} not sent: {}", frame.seq, e);
                }
            }
            CaptureEvent::Failed(reason) => {
                warn!("🎤 Capture failed: {}", reason);
                self.publish(SessionUpdate::CaptureFailed(reason));
                self.publish(SessionUpdate::Capture(self.capture.state()));
            }
        }
    }

    // ===== TRANSCRIPTION CHANNEL =====

    fn handle_transcription(&mut self, event: ChannelEvent<TranscriptionMessage>) {
        match event {
            ChannelEvent::Message(TranscriptionMessage::Transcription { text, is_final }) => {
                let utterance = self.assembler.on_event(text, is_final, Instant::now());
                self.publish(SessionUpdate::Pending(self.assembler.pending().map(str::to_string)));
                if let Some(utterance) = utterance {
                    self.begin_turn(utterance);
                }
            }
            ChannelEvent::Opened => debug!("Transcription channel ready"),
            ChannelEvent::Closed | ChannelEvent::Errored(_) => {
                // input is useless without somewhere to send it
                self.capture.stop();
                self.publish(SessionUpdate::Capture(self.capture.state()));
                self.channel_down(ChannelKind::Transcription);
            }
        }
    }

    fn begin_turn(&mut self, utterance: Utterance) {
        let start = self.turns.begin_turn(utterance.text.clone());
        if let Some(message) = start.interrupted {
            self.publish(SessionUpdate::Committed(message));
        }
        self.publish(SessionUpdate::Utterance(utterance.text.clone()));
        self.publish(SessionUpdate::Committed(ChatMessage::new(
            crate::history::Role::User,
            utterance.text,
        )));

        // barge-in: the previous reply's audio must not outlive the new turn
        self.playback.clear();

        if let Err(e) = self.dialogue.send_json(&start.request) {
            warn!("💬 Turn context not sent: {}", e);
        }
    }

    // ===== DIALOGUE CHANNEL =====

    fn handle_dialogue(&mut self, event: ChannelEvent<DialogueEnvelope>) {
        let envelope = match event {
            ChannelEvent::Message(envelope) => envelope,
            ChannelEvent::Opened => {
                debug!("Dialogue channel ready");
                return;
            }
            ChannelEvent::Closed | ChannelEvent::Errored(_) => {
                self.channel_down(ChannelKind::Dialogue);
                return;
            }
        };

        let message = match envelope.into_success() {
            Ok(message) => message,
            Err(status) => {
                warn!("Dropping dialogue message with status {:?}", status);
                return;
            }
        };

        match self.turns.on_dialogue(message) {
            DialogueEffect::Streaming(text) => self.publish(SessionUpdate::ReplyChunk(text)),
            DialogueEffect::Enqueue(segment) => self.playback.enqueue(segment),
            DialogueEffect::Committed(message) => {
                info!("🤖 Assistant: {}", message.content);
                self.publish(SessionUpdate::Committed(message));
            }
            DialogueEffect::Ignored => {}
        }
    }

    fn channel_down(&self, kind: ChannelKind) {
        let channel = match kind {
            ChannelKind::Transcription => &self.transcription,
            ChannelKind::Dialogue => &self.dialogue,
        };
        let (kind, state) = (channel.kind(), channel.state());
        warn!("📪 {} channel is down ({:?})", kind, state);
        self.publish(SessionUpdate::ChannelDown { kind, state });
    }

    fn publish(&self, update: SessionUpdate) {
        // nobody listening is fine
        let _ = self.updates.send(update);
    }

    async fn teardown(mut self) {
        info!("🛑 Tearing down session");
        self.capture.stop();
        self.playback.clear();
        self.meter.stop();
        let Session {
            transcription,
            dialogue,
            ..
        } = self;
        tokio::join!(transcription.close(), dialogue.close());
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureError, InputDevice};
    use crate::history::{MemoryStore, Role, DEFAULT_STORAGE_KEY};
    use crate::playback::tests::FakePlayer;
    use crate::transcript::SegmentationPolicy;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    struct SilentDevices {
        acquired: AtomicUsize,
        acquire_delay: Duration,
    }

    struct SilentInput;

    impl InputDevice for SilentInput {
        fn read_frame(&mut self, buf: &mut [u8]) -> Result<(), CaptureError> {
            std::thread::sleep(Duration::from_millis(5));
            buf.fill(0x11);
            Ok(())
        }
    }

    impl DeviceProvider for SilentDevices {
        fn acquire(&self) -> Result<Box<dyn InputDevice>, CaptureError> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.acquire_delay);
            Ok(Box::new(SilentInput))
        }
    }

    /// One-connection WebSocket peer standing in for a remote service.
    /// A close frame from the client is reported as `<close>`.
    struct Peer {
        url: String,
        received: mpsc::UnboundedReceiver<String>,
        push: mpsc::UnboundedSender<Message>,
    }

    impl Peer {
        async fn spawn() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("ws://{}", listener.local_addr().unwrap());
            let (received_tx, received) = mpsc::unbounded_channel();
            let (push, mut push_rx) = mpsc::unbounded_channel::<Message>();

            tokio::spawn(async move {
                let (tcp, _) = listener.accept().await.unwrap();
                let ws = accept_async(tcp).await.unwrap();
                let (mut sink, mut stream) = ws.split();
                loop {
                    tokio::select! {
                        Some(message) = push_rx.recv() => {
                            let closing = matches!(message, Message::Close(_));
                            if sink.send(message).await.is_err() || closing {
                                break;
                            }
                        }
                        incoming = stream.next() => match incoming {
                            Some(Ok(Message::Text(text))) => {
                                let _ = received_tx.send(text.to_string());
                            }
                            Some(Ok(Message::Close(_))) => {
                                let _ = received_tx.send("<close>".to_string());
                                break;
                            }
                            Some(Ok(_)) => {}
                            _ => break,
                        }
                    }
                }
            });

            Self { url, received, push }
        }

        fn send(&self, json: serde_json::Value) {
            self.push_raw(&json.to_string());
        }

        fn push_raw(&self, text: &str) {
            self.push.send(Message::Text(text.into())).unwrap();
        }

        fn hang_up(&self) {
            self.push.send(Message::Close(None)).unwrap();
        }

        async fn recv(&mut self) -> String {
            timeout(Duration::from_secs(5), self.received.recv())
                .await
                .expect("timed out waiting for client message")
                .expect("peer closed")
        }
    }

    struct Harness {
        stt: Peer,
        chat: Peer,
        commands: mpsc::Sender<Command>,
        updates: mpsc::UnboundedReceiver<SessionUpdate>,
        player: Arc<FakePlayer>,
        store: Arc<MemoryStore>,
        devices: Arc<SilentDevices>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        async fn start(policy: SegmentationPolicy) -> Self {
            Self::with_acquire_delay(policy, Duration::ZERO).await
        }

        async fn with_acquire_delay(policy: SegmentationPolicy, acquire_delay: Duration) -> Self {
            let stt = Peer::spawn().await;
            let chat = Peer::spawn().await;
            let config = SessionConfig {
                transcription_url: stt.url.clone(),
                dialogue_url: chat.url.clone(),
                frame_duration: Duration::from_millis(20),
                segmentation: policy,
                meter_interval: Duration::from_millis(5),
                ..SessionConfig::default()
            };

            let player = Arc::new(FakePlayer::default());
            let store = Arc::new(MemoryStore::new());
            let devices = Arc::new(SilentDevices {
                acquired: AtomicUsize::new(0),
                acquire_delay,
            });
            let (session, updates) =
                Session::open(&config, devices.clone(), player.clone(), Box::new(store.clone()));
            let (commands, commands_rx) = mpsc::channel(8);
            let task = tokio::spawn(session.run(commands_rx));

            Self {
                stt,
                chat,
                commands,
                updates,
                player,
                store,
                devices,
                task,
            }
        }

        async fn expect(&mut self, wanted: impl Fn(&SessionUpdate) -> bool) -> SessionUpdate {
            timeout(Duration::from_secs(5), async {
                loop {
                    let update = self.updates.recv().await.expect("session ended");
                    if wanted(&update) {
                        return update;
                    }
                }
            })
            .await
            .expect("timed out waiting for session update")
        }

        fn transcript(&self, text: &str, is_final: bool) {
            self.stt.send(serde_json::json!({
                "type": "transcription",
                "text": text,
                "is_final": is_final,
            }));
        }

        fn reply(&self, kind: &str, field: Option<(&str, &str)>) {
            let mut json = serde_json::json!({"status": "success", "type": kind});
            if let Some((key, value)) = field {
                json[key] = serde_json::Value::String(value.to_string());
            }
            self.chat.send(json);
        }

        async fn shutdown(self) {
            self.commands.send(Command::Shutdown).await.unwrap();
            timeout(Duration::from_secs(5), self.task).await.unwrap().unwrap();
        }
    }

    fn context_of(request: &str) -> Vec<(String, String)> {
        let json: serde_json::Value = serde_json::from_str(request).unwrap();
        json["context"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| {
                (
                    m["role"].as_str().unwrap().to_string(),
                    m["content"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_final_transcript_sends_context_and_reply_is_committed() {
        let mut h = Harness::start(SegmentationPolicy::FinalFlag).await;

        h.transcript("what's the", false);
        let pending = h.expect(|u| matches!(u, SessionUpdate::Pending(Some(_)))).await;
        assert_eq!(pending, SessionUpdate::Pending(Some("what's the".into())));

        h.transcript("what's the weather", true);
        let request = h.chat.recv().await;
        assert_eq!(
            context_of(&request),
            vec![("user".to_string(), "what's the weather".to_string())]
        );

        h.reply("chunk", Some(("text", "Hel")));
        h.reply("chunk", Some(("text", "lo")));
        h.reply("complete", None);

        let committed = h
            .expect(|u| matches!(u, SessionUpdate::Committed(m) if m.role == Role::Assistant))
            .await;
        assert_eq!(
            committed,
            SessionUpdate::Committed(ChatMessage::new(Role::Assistant, "Hello"))
        );

        let blob = h.store.load(DEFAULT_STORAGE_KEY).unwrap().unwrap();
        let saved: Vec<ChatMessage> = serde_json::from_str(&blob).unwrap();
        assert_eq!(
            saved,
            vec![
                ChatMessage::new(Role::User, "what's the weather"),
                ChatMessage::new(Role::Assistant, "Hello"),
            ]
        );
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_utterance_clears_playback_before_context_is_sent() {
        let mut h = Harness::start(SegmentationPolicy::FinalFlag).await;

        h.transcript("read me a poem", true);
        h.chat.recv().await;

        // segment A starts playing, B waits behind it
        h.reply("audio", Some(("audio", "AQID")));
        h.reply("audio", Some(("audio", "BAUG")));
        h.reply("chunk", Some(("text", "Roses are")));
        h.expect(|u| matches!(u, SessionUpdate::ReplyChunk(_))).await;
        timeout(Duration::from_secs(5), async {
            while h.player.started().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("first segment never started");
        assert_eq!(h.player.started(), vec![vec![1, 2, 3]]);

        h.transcript("never mind", true);
        let request = h.chat.recv().await;
        assert!(h.player.halted.load(Ordering::SeqCst));
        assert_eq!(
            context_of(&request),
            vec![
                ("user".to_string(), "read me a poem".to_string()),
                ("assistant".to_string(), "Roses are".to_string()),
                ("user".to_string(), "never mind".to_string()),
            ]
        );

        // the old reply's tail is still in flight and must not resurface
        h.reply("audio", Some(("audio", "CQoL")));
        h.reply("chunk", Some(("text", " violets")));
        h.reply("complete", None);
        h.reply("chunk", Some(("text", "Okay")));
        h.reply("complete", None);

        let committed = h
            .expect(|u| {
                matches!(u, SessionUpdate::Committed(m) if m.role == Role::Assistant && m.content != "Roses are")
            })
            .await;
        assert_eq!(
            committed,
            SessionUpdate::Committed(ChatMessage::new(Role::Assistant, "Okay"))
        );
        let blob = h.store.load(DEFAULT_STORAGE_KEY).unwrap().unwrap();
        let saved: Vec<ChatMessage> = serde_json::from_str(&blob).unwrap();
        assert_eq!(
            saved,
            vec![
                ChatMessage::new(Role::User, "read me a poem"),
                ChatMessage::new(Role::Assistant, "Roses are"),
                ChatMessage::new(Role::User, "never mind"),
                ChatMessage::new(Role::Assistant, "Okay"),
            ]
        );

        // B was discarded with the rest of the old reply
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.player.started(), vec![vec![1, 2, 3]]);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_transcription_channel_down_stops_capture() {
        let mut h = Harness::start(SegmentationPolicy::FinalFlag).await;

        h.commands.send(Command::StartCapture).await.unwrap();
        h.expect(|u| *u == SessionUpdate::Capture(CaptureState::Recording)).await;
        h.stt.recv().await;

        h.stt.hang_up();
        h.expect(|u| *u == SessionUpdate::Capture(CaptureState::Idle)).await;
        let down = h.expect(|u| matches!(u, SessionUpdate::ChannelDown { .. })).await;
        assert_eq!(
            down,
            SessionUpdate::ChannelDown {
                kind: ChannelKind::Transcription,
                state: ChannelState::Closed,
            }
        );

        // a dead transcription channel refuses new capture
        h.commands.send(Command::StartCapture).await.unwrap();
        let next = h
            .expect(|u| {
                matches!(
                    u,
                    SessionUpdate::ChannelDown { .. }
                        | SessionUpdate::Capture(CaptureState::Starting)
                        | SessionUpdate::Capture(CaptureState::Recording)
                )
            })
            .await;
        assert_eq!(next, down);
        assert_eq!(h.devices.acquired.load(Ordering::SeqCst), 1);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_microphone_does_not_stall_turns() {
        let mut h =
            Harness::with_acquire_delay(SegmentationPolicy::FinalFlag, Duration::from_secs(1)).await;

        h.commands.send(Command::StartCapture).await.unwrap();
        h.expect(|u| *u == SessionUpdate::Capture(CaptureState::Starting)).await;

        // the device is still being opened while this turn goes out
        h.transcript("are you there", true);
        let request = h.chat.recv().await;
        assert_eq!(
            context_of(&request),
            vec![("user".to_string(), "are you there".to_string())]
        );
        let first = h
            .expect(|u| {
                matches!(
                    u,
                    SessionUpdate::Utterance(_) | SessionUpdate::Capture(CaptureState::Recording)
                )
            })
            .await;
        assert_eq!(first, SessionUpdate::Utterance("are you there".into()));

        h.expect(|u| *u == SessionUpdate::Capture(CaptureState::Recording)).await;
        assert_eq!(h.devices.acquired.load(Ordering::SeqCst), 1);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_request_before_closing() {
        let mut h = Harness::start(SegmentationPolicy::FinalFlag).await;

        h.transcript("last words", true);
        h.expect(|u| matches!(u, SessionUpdate::Utterance(_))).await;
        h.commands.send(Command::Shutdown).await.unwrap();
        timeout(Duration::from_secs(5), &mut h.task).await.unwrap().unwrap();

        let request = h.chat.recv().await;
        assert_eq!(
            context_of(&request),
            vec![("user".to_string(), "last words".to_string())]
        );
        assert_eq!(h.chat.recv().await, "<close>");
        assert_eq!(h.stt.recv().await, "<close>");
    }

    #[tokio::test]
    async fn test_capture_frames_flow_to_transcription_channel() {
        let mut h = Harness::start(SegmentationPolicy::FinalFlag).await;

        h.commands.send(Command::StartCapture).await.unwrap();
        h.expect(|u| *u == SessionUpdate::Capture(CaptureState::Recording)).await;

        let frame = h.stt.recv().await;
        assert_eq!(frame, encode_frame(&[0x11; 640]));

        h.commands.send(Command::PauseCapture).await.unwrap();
        h.expect(|u| *u == SessionUpdate::Capture(CaptureState::Paused)).await;
        h.commands.send(Command::ToggleCapture).await.unwrap();
        h.expect(|u| *u == SessionUpdate::Capture(CaptureState::Recording)).await;
        assert_eq!(h.devices.acquired.load(Ordering::SeqCst), 1);

        h.commands.send(Command::ToggleCapture).await.unwrap();
        h.expect(|u| *u == SessionUpdate::Capture(CaptureState::Idle)).await;
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_silence_timeout_fallback_ends_utterance() {
        let mut h = Harness::start(SegmentationPolicy::SilenceTimeout(Duration::from_millis(100))).await;

        h.transcript("no final flag here", false);
        let request = h.chat.recv().await;
        assert_eq!(
            context_of(&request),
            vec![("user".to_string(), "no final flag here".to_string())]
        );
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_clears_history_and_store() {
        let mut h = Harness::start(SegmentationPolicy::FinalFlag).await;

        h.transcript("remember this", true);
        h.chat.recv().await;
        assert!(h.store.load(DEFAULT_STORAGE_KEY).unwrap().is_some());

        h.commands.send(Command::Reset).await.unwrap();
        h.expect(|u| *u == SessionUpdate::HistoryCleared).await;
        assert_eq!(h.store.load(DEFAULT_STORAGE_KEY).unwrap(), None);

        h.transcript("fresh start", true);
        let request = h.chat.recv().await;
        assert_eq!(
            context_of(&request),
            vec![("user".to_string(), "fresh start".to_string())]
        );
        h.shutdown().await;
    }

    #[test]
    fn test_errors_convert_into_session_error() {
        let err: SessionError = crate::connection::ConnectionError::NotOpen {
            kind: ChannelKind::Dialogue,
            state: ChannelState::Closed,
        }
        .into();
        assert!(matches!(err, SessionError::Connection(_)));
        assert_eq!(
            err.to_string(),
            "Connection error: dialogue channel is not open (Closed)"
        );

        let err: SessionError = CaptureError::DeviceDenied("no".into()).into();
        assert_eq!(err.to_string(), "Capture error: Microphone access denied: no");
    }

    #[tokio::test]
    async fn test_malformed_and_failed_messages_are_dropped() {
        let mut h = Harness::start(SegmentationPolicy::FinalFlag).await;

        h.transcript("hello", true);
        h.chat.recv().await;

        h.chat.push_raw("not json");
        h.chat.send(serde_json::json!({"status": "error", "type": "chunk", "text": "bad"}));
        h.reply("chunk", Some(("text", "good")));
        h.reply("complete", None);

        let committed = h
            .expect(|u| matches!(u, SessionUpdate::Committed(m) if m.role == Role::Assistant))
            .await;
        assert_eq!(
            committed,
            SessionUpdate::Committed(ChatMessage::new(Role::Assistant, "good"))
        );
        h.shutdown().await;
    }
}
