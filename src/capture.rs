//! Microphone capture engine
//!
//! The input device is owned by a dedicated OS thread that acquires it and
//! performs the blocking reads. `start` only spawns that thread; the
//! outcome of acquisition arrives later as [`CaptureEvent::Started`] or
//! [`CaptureEvent::Failed`], so the caller never waits on a device or an
//! access prompt. The engine publishes [`CaptureState`] on a watch channel;
//! the thread forwards frames only while recording, drops them while
//! paused, and releases the device once it is retired.
//!
//! Frames are headerless 16-bit little-endian mono PCM at [`SAMPLE_RATE`].
//! The transcription service has to be configured for raw linear PCM at
//! that rate; it is not sent a container format.

use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Capture sample rate (mono, S16LE).
pub const SAMPLE_RATE: u32 = 16_000;

/// Consecutive read failures after which the device is considered lost.
const MAX_READ_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    /// Waiting for the device to be acquired
    Starting,
    Recording,
    Paused,
}

/// One fixed-duration slice of captured audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Position in capture order
    pub seq: u64,
    /// 16-bit little-endian PCM
    pub pcm: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// The device was acquired and recording began
    Started,
    Frame(AudioFrame),
    /// The device could not be acquired or stopped delivering audio;
    /// capture is idle again
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Microphone access denied: {0}")]
    DeviceDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Read error: {0}")]
    Read(String),

    #[error("Capture thread error: {0}")]
    Thread(String),
}

/// An acquired input device.
pub trait InputDevice {
    /// Block until `buf` is filled with the next frame.
    fn read_frame(&mut self, buf: &mut [u8]) -> Result<(), CaptureError>;
}

/// Source of input devices. `acquire` runs on the capture thread and is
/// where access prompts and device errors happen.
pub trait DeviceProvider: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn InputDevice>, CaptureError>;
}

/// PulseAudio record streams via the simple API.
#[derive(Debug, Clone)]
pub struct PulseDevices {
    app_name: String,
    device: Option<String>,
}

impl PulseDevices {
    pub fn new(app_name: &str, device: Option<String>) -> Self {
        Self {
            app_name: app_name.to_string(),
            device,
        }
    }
}

struct PulseInput {
    simple: Simple,
}

impl InputDevice for PulseInput {
    fn read_frame(&mut self, buf: &mut [u8]) -> Result<(), CaptureError> {
        self.simple
            .read(buf)
            .map_err(|e| CaptureError::Read(ToString::to_string(&e)))
    }
}

impl DeviceProvider for PulseDevices {
    fn acquire(&self) -> Result<Box<dyn InputDevice>, CaptureError> {
        let spec = Spec {
            format: Format::S16le,
            channels: 1,
            rate: SAMPLE_RATE,
        };
        if !spec.is_valid() {
            return Err(CaptureError::DeviceUnavailable("invalid sample spec".into()));
        }

        info!("🎤 Opening PulseAudio source {:?}", self.device.as_deref().unwrap_or("<default>"));
        let simple = Simple::new(
            None,                   // default server
            &self.app_name,         // application name
            Direction::Record,
            self.device.as_deref(), // None = default source
            "microphone",           // stream description
            &spec,
            None, // default channel map
            None, // default buffering
        )
        .map_err(|e| {
            let msg = ToString::to_string(&e);
            // PulseAudio reports a refused client as an access error
            if msg.to_lowercase().contains("access") {
                CaptureError::DeviceDenied(msg)
            } else {
                CaptureError::DeviceUnavailable(msg)
            }
        })?;

        Ok(Box::new(PulseInput { simple }))
    }
}

/// Number of bytes in one S16LE mono frame of `duration`.
pub fn frame_bytes(sample_rate: u32, duration: Duration) -> usize {
    let samples = (sample_rate as u128 * duration.as_millis() / 1000) as usize;
    samples.max(1) * 2
}

pub struct CaptureEngine {
    provider: Arc<dyn DeviceProvider>,
    frame_bytes: usize,
    control: Arc<watch::Sender<CaptureState>>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    /// Retirement flag of the current capture thread
    worker: Option<Arc<AtomicBool>>,
}

impl CaptureEngine {
    /// Create an idle engine. Frames and lifecycle events arrive on the
    /// returned receiver.
    pub fn new(
        provider: Arc<dyn DeviceProvider>,
        frame_duration: Duration,
        sample_rate: u32,
    ) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (control, _) = watch::channel(CaptureState::Idle);
        let (events, events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            provider,
            frame_bytes: frame_bytes(sample_rate, frame_duration),
            control: Arc::new(control),
            events,
            worker: None,
        };
        (engine, events_rx)
    }

    pub fn state(&self) -> CaptureState {
        *self.control.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.control.subscribe()
    }

    /// Start or resume capture. A paused engine resumes on the same device
    /// handle at once; an idle one moves to `Starting` and acquires the
    /// device on a fresh thread. Only a failure to spawn that thread is
    /// returned here.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        match self.state() {
            CaptureState::Recording | CaptureState::Starting => return Ok(()),
            CaptureState::Paused => {
                info!("🎤 Resuming capture");
                self.control.send_replace(CaptureState::Recording);
                return Ok(());
            }
            CaptureState::Idle => {}
        }

        self.retire_worker();
        let retired = Arc::new(AtomicBool::new(false));
        self.control.send_replace(CaptureState::Starting);

        let provider = self.provider.clone();
        let control = self.control.clone();
        let events = self.events.clone();
        let frame_bytes = self.frame_bytes;
        let flag = retired.clone();

        let spawned = std::thread::Builder::new()
            .name("talkback-capture".into())
            .spawn(move || capture_thread(provider, control, events, frame_bytes, flag));
        if let Err(e) = spawned {
            self.control.send_replace(CaptureState::Idle);
            return Err(CaptureError::Thread(e.to_string()));
        }

        debug!("🎤 Acquiring input device");
        self.worker = Some(retired);
        Ok(())
    }

    /// Halt frame emission but keep the device.
    pub fn pause(&mut self) {
        let paused = self.control.send_if_modified(|state| {
            if *state != CaptureState::Recording {
                return false;
            }
            *state = CaptureState::Paused;
            true
        });
        if paused {
            info!("⏸️ Pausing capture");
        }
    }

    /// Halt frame emission and release the device. Also cancels an
    /// acquisition still in progress.
    pub fn stop(&mut self) {
        if self.state() != CaptureState::Idle {
            info!("⏹️ Stopping capture");
        }
        // the thread exits after its current read; the in-flight frame is dropped
        self.retire_worker();
    }

    fn retire_worker(&mut self) {
        let worker = self.worker.take();
        self.control.send_modify(|state| {
            if let Some(retired) = &worker {
                retired.store(true, Ordering::SeqCst);
            }
            *state = CaptureState::Idle;
        });
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.retire_worker();
    }
}

/// Set `next` unless this thread has been retired. Runs under the watch
/// lock, so it cannot interleave with a retirement.
fn set_if_current(
    control: &watch::Sender<CaptureState>,
    retired: &AtomicBool,
    next: CaptureState,
) -> bool {
    control.send_if_modified(|state| {
        if retired.load(Ordering::SeqCst) {
            return false;
        }
        *state = next;
        true
    })
}

fn capture_thread(
    provider: Arc<dyn DeviceProvider>,
    control: Arc<watch::Sender<CaptureState>>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    frame_bytes: usize,
    retired: Arc<AtomicBool>,
) {
    let mut device = match provider.acquire() {
        Ok(device) => device,
        Err(e) => {
            warn!("Capture could not start: {}", e);
            if set_if_current(&control, &retired, CaptureState::Idle) {
                let _ = events.send(CaptureEvent::Failed(e.to_string()));
            }
            return;
        }
    };

    if !set_if_current(&control, &retired, CaptureState::Recording) {
        debug!("Capture stopped while the device was being acquired");
        return;
    }
    info!("🎤 Capture started ({} byte frames)", frame_bytes);
    if events.send(CaptureEvent::Started).is_err() {
        set_if_current(&control, &retired, CaptureState::Idle);
        return;
    }

    let mut seq = 0u64;
    let mut failures = 0u32;
    while !retired.load(Ordering::SeqCst) {
        let mut pcm = vec![0u8; frame_bytes];
        if let Err(e) = device.read_frame(&mut pcm) {
            failures += 1;
            warn!("Audio read error ({}/{}): {}", failures, MAX_READ_FAILURES, e);
            if failures >= MAX_READ_FAILURES {
                error!("❌ Input device lost");
                if set_if_current(&control, &retired, CaptureState::Idle) {
                    let _ = events.send(CaptureEvent::Failed(e.to_string()));
                }
                break;
            }
            continue;
        }
        failures = 0;

        // re-check after the blocking read; stopping never flushes
        if retired.load(Ordering::SeqCst) {
            break;
        }
        if *control.borrow() != CaptureState::Recording {
            continue;
        }

        let frame = AudioFrame { seq, pcm };
        seq += 1;
        if events.send(CaptureEvent::Frame(frame)).is_err() {
            set_if_current(&control, &retired, CaptureState::Idle);
            break;
        }
    }

    drop(device);
    debug!("Capture thread released the device");
}
