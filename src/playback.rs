//! Ordered playback of synthesized segments
//!
//! The queue is owned by the session coordinator. At most one segment is
//! active; it plays on a spawned task and reports back through a
//! [`PlaybackDone`] message, after which the next pending segment starts.
//! Clearing the queue aborts the active task and halts the player.

use async_trait::async_trait;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Samples per metering window published by [`RodioPlayer`].
pub const TAP_WINDOW: usize = 1024;

/// One unit of synthesized assistant audio, still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSegment {
    pub bytes: Vec<u8>,
}

impl AudioSegment {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Playing,
}

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Output device error: {0}")]
    Output(String),
}

/// Latest window of decoded samples from the active segment.
pub type SampleTap = watch::Receiver<Arc<[f32]>>;

/// Something that can play one segment to completion.
#[async_trait]
pub trait SegmentPlayer: Send + Sync + 'static {
    /// Play the segment, resolving when it ends or fails.
    async fn play(&self, segment: AudioSegment) -> Result<(), PlaybackError>;

    /// Silence whatever is playing right now.
    fn halt(&self);

    /// Sample windows of the active segment, for metering.
    fn sample_tap(&self) -> Option<SampleTap> {
        None
    }
}

/// Completion report for one started segment.
#[derive(Debug)]
pub struct PlaybackDone {
    ticket: u64,
    result: Result<(), PlaybackError>,
}

struct Active {
    ticket: u64,
    task: JoinHandle<()>,
}

pub struct PlaybackQueue {
    player: Arc<dyn SegmentPlayer>,
    pending: VecDeque<AudioSegment>,
    active: Option<Active>,
    next_ticket: u64,
    done_tx: mpsc::UnboundedSender<PlaybackDone>,
    status: watch::Sender<PlaybackStatus>,
}

impl PlaybackQueue {
    /// Create an idle queue. Completion reports arrive on the returned
    /// receiver and must be fed back through [`PlaybackQueue::on_finished`].
    pub fn new(player: Arc<dyn SegmentPlayer>) -> (Self, mpsc::UnboundedReceiver<PlaybackDone>) {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(PlaybackStatus::Idle);
        let queue = Self {
            player,
            pending: VecDeque::new(),
            active: None,
            next_ticket: 0,
            done_tx,
            status,
        };
        (queue, done_rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.subscribe()
    }

    pub fn is_playing(&self) -> bool {
        self.active.is_some()
    }

    /// Segments waiting behind the active one.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Append a segment; it starts at once if nothing is playing.
    pub fn enqueue(&mut self, segment: AudioSegment) {
        debug!("🔊 Queued segment ({} bytes), {} waiting", segment.bytes.len(), self.pending.len());
        self.pending.push_back(segment);
        if self.active.is_none() {
            self.start_next();
        }
    }

    /// Handle a completion report. Reports for segments that were cleared
    /// are ignored.
    pub fn on_finished(&mut self, done: PlaybackDone) {
        let is_current = self.active.as_ref().is_some_and(|a| a.ticket == done.ticket);
        if !is_current {
            debug!("Ignoring stale completion for segment {}", done.ticket);
            return;
        }

        if let Err(e) = done.result {
            warn!("⚠️ Segment {} failed, skipping: {}", done.ticket, e);
        } else {
            debug!("Segment {} finished", done.ticket);
        }
        self.active = None;
        self.start_next();
    }

    /// Drop every pending segment and cut off the active one.
    pub fn clear(&mut self) {
        let dropped = self.pending.len();
        self.pending.clear();
        if let Some(active) = self.active.take() {
            active.task.abort();
            self.player.halt();
            info!("🔇 Playback interrupted ({} queued segments dropped)", dropped);
        } else if dropped > 0 {
            info!("🔇 Dropped {} queued segments", dropped);
        }
        self.status.send_replace(PlaybackStatus::Idle);
    }

    fn start_next(&mut self) {
        let Some(segment) = self.pending.pop_front() else {
            self.status.send_replace(PlaybackStatus::Idle);
            return;
        };

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let player = self.player.clone();
        let done_tx = self.done_tx.clone();
        let task = tokio::spawn(async move {
            let result = player.play(segment).await;
            let _ = done_tx.send(PlaybackDone { ticket, result });
        });

        debug!("▶️ Playing segment {}", ticket);
        self.active = Some(Active { ticket, task });
        self.status.send_replace(PlaybackStatus::Playing);
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
            self.player.halt();
        }
    }
}

/// Plays segments on the default output device through rodio.
///
/// The output stream is not `Send`, so it lives on its own thread for the
/// lifetime of the player. Each segment gets a fresh [`Sink`].
pub struct RodioPlayer {
    handle: OutputStreamHandle,
    current: SinkSlot,
    tap: watch::Sender<Arc<[f32]>>,
    _keepalive: std::sync::mpsc::Sender<()>,
}

impl RodioPlayer {
    pub fn open() -> Result<Self, PlaybackError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (keepalive, shutdown_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("talkback-output".into())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    // blocks until the player is dropped
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                }
            })
            .map_err(|e| PlaybackError::Output(e.to_string()))?;

        let handle = ready_rx
            .recv()
            .map_err(|e| PlaybackError::Output(e.to_string()))?
            .map_err(PlaybackError::Output)?;
        info!("🔈 Output device ready");

        let empty: Arc<[f32]> = Arc::from(Vec::new());
        let (tap, _) = watch::channel(empty);
        Ok(Self {
            handle,
            current: SinkSlot::default(),
            tap,
            _keepalive: keepalive,
        })
    }
}

/// The sink that is currently playing, if any.
#[derive(Default)]
struct SinkSlot(Mutex<Option<Arc<Sink>>>);

impl SinkSlot {
    /// Make `sink` the current one. Any sink it replaces is stopped.
    fn register(&self, sink: Arc<Sink>) -> SlotGuard<'_> {
        if let Some(previous) = self.replace(Some(sink.clone())) {
            previous.stop();
        }
        SlotGuard { slot: self, sink }
    }

    fn halt(&self) {
        if let Some(sink) = self.replace(None) {
            sink.stop();
        }
    }

    fn replace(&self, sink: Option<Arc<Sink>>) -> Option<Arc<Sink>> {
        let mut current = self.0.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, sink)
    }

    #[cfg(test)]
    fn is_current(&self, sink: &Arc<Sink>) -> bool {
        let current = self.0.lock().unwrap_or_else(|e| e.into_inner());
        current.as_ref().is_some_and(|c| Arc::ptr_eq(c, sink))
    }
}

/// Stops its sink when dropped, including when the playing task is aborted,
/// and vacates the slot unless a newer sink took it.
struct SlotGuard<'a> {
    slot: &'a SinkSlot,
    sink: Arc<Sink>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.sink.stop();
        let mut current = self.slot.0.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &self.sink)) {
            *current = None;
        }
    }
}

#[async_trait]
impl SegmentPlayer for RodioPlayer {
    async fn play(&self, segment: AudioSegment) -> Result<(), PlaybackError> {
        let source = Decoder::new(Cursor::new(segment.bytes))
            .map_err(|e| PlaybackError::Decode(e.to_string()))?;
        let sink = Sink::try_new(&self.handle).map_err(|e| PlaybackError::Output(e.to_string()))?;
        let guard = self.current.register(Arc::new(sink));

        guard
            .sink
            .append(Metered::new(source.convert_samples::<f32>(), self.tap.clone()));

        let mut tick = tokio::time::interval(Duration::from_millis(20));
        while !guard.sink.empty() {
            tick.tick().await;
        }
        Ok(())
    }

    fn halt(&self) {
        self.current.halt();
    }

    fn sample_tap(&self) -> Option<SampleTap> {
        Some(self.tap.subscribe())
    }
}

/// Pass-through source that publishes fixed-size sample windows.
struct Metered<S> {
    inner: S,
    window: Vec<f32>,
    tap: watch::Sender<Arc<[f32]>>,
}

impl<S> Metered<S> {
    fn new(inner: S, tap: watch::Sender<Arc<[f32]>>) -> Self {
        Self {
            inner,
            window: Vec::with_capacity(TAP_WINDOW),
            tap,
        }
    }
}

impl<S: Source<Item = f32>> Iterator for Metered<S> {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let sample = self.inner.next()?;
        self.window.push(sample);
        if self.window.len() >= TAP_WINDOW {
            let window: Arc<[f32]> = Arc::from(std::mem::take(&mut self.window));
            self.tap.send_replace(window);
            self.window.reserve(TAP_WINDOW);
        }
        Some(sample)
    }
}

impl<S: Source<Item = f32>> Source for Metered<S> {
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}
