//! Amplitude metering of the active segment
//!
//! Derives a smoothed 0..1 level from the spectral energy of the samples
//! currently being played. The meter only reads watch channels published
//! by the playback side and never touches the queue itself.

use crate::playback::{PlaybackStatus, SampleTap};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Weight kept from the previous level on each update.
pub const SMOOTHING: f32 = 0.8;

pub const DEFAULT_FFT_SIZE: usize = 512;

pub struct VolumeAnalyzer {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    level: f32,
}

impl VolumeAnalyzer {
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let window = (0..fft_size)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (fft_size - 1) as f32).cos())
            })
            .collect();

        Self {
            fft_size,
            fft,
            window,
            level: 0.0,
        }
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    /// Fold one window of samples into the smoothed level.
    pub fn observe(&mut self, samples: &[f32]) -> f32 {
        let energy = self.spectral_energy(samples);
        self.level = SMOOTHING * self.level + (1.0 - SMOOTHING) * energy;
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }

    /// Mean normalized magnitude over the positive-frequency bins.
    fn spectral_energy(&self, samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }

        let start = samples.len().saturating_sub(self.fft_size);
        let mut buffer: Vec<Complex<f32>> = samples[start..]
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();
        buffer.resize(self.fft_size, Complex::new(0.0, 0.0));
        self.fft.process(&mut buffer);

        let bins = self.fft_size / 2;
        let scale = 2.0 / self.fft_size as f32;
        let total: f32 = buffer[..bins].iter().map(|c| c.norm() * scale).sum();
        (total / bins as f32).clamp(0.0, 1.0)
    }
}

/// Handle to a running meter task.
pub struct Meter {
    level: watch::Receiver<f32>,
    task: JoinHandle<()>,
}

impl Meter {
    pub fn level(&self) -> watch::Receiver<f32> {
        self.level.clone()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Meter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sample the active segment every `period` and publish the smoothed level.
/// Without a sample tap the level stays at zero.
pub fn spawn_meter(
    status: watch::Receiver<PlaybackStatus>,
    samples: Option<SampleTap>,
    period: Duration,
) -> Meter {
    let (level_tx, level) = watch::channel(0.0f32);
    let task = tokio::spawn(async move {
        let mut analyzer = VolumeAnalyzer::new(DEFAULT_FFT_SIZE);
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            let playing = *status.borrow() == PlaybackStatus::Playing;
            let value = match (&samples, playing) {
                (Some(tap), true) => {
                    let window = tap.borrow().clone();
                    analyzer.observe(&window)
                }
                _ => {
                    analyzer.reset();
                    0.0
                }
            };
            level_tx.send_replace(value);
            if level_tx.is_closed() {
                break;
            }
        }
    });

    Meter { level, task }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, amplitude: f32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / 16_000.0).sin())
            .collect()
    }

    #[test]
    fn test_silence_has_no_energy() {
        let mut analyzer = VolumeAnalyzer::new(DEFAULT_FFT_SIZE);
        assert_eq!(analyzer.observe(&vec![0.0; DEFAULT_FFT_SIZE]), 0.0);
        assert_eq!(analyzer.observe(&[]), 0.0);
    }

    #[test]
    fn test_louder_signal_reads_higher() {
        let mut quiet = VolumeAnalyzer::new(DEFAULT_FFT_SIZE);
        let mut loud = VolumeAnalyzer::new(DEFAULT_FFT_SIZE);
        let q = quiet.observe(&sine(440.0, 0.1, DEFAULT_FFT_SIZE));
        let l = loud.observe(&sine(440.0, 0.9, DEFAULT_FFT_SIZE));
        assert!(q > 0.0);
        assert!(l > q);
        assert!(l <= 1.0);
    }

    #[test]
    fn test_exponential_smoothing() {
        let mut analyzer = VolumeAnalyzer::new(DEFAULT_FFT_SIZE);
        let signal = sine(1000.0, 0.8, DEFAULT_FFT_SIZE);
        let energy = analyzer.spectral_energy(&signal);

        let first = analyzer.observe(&signal);
        assert!((first - 0.2 * energy).abs() < 1e-6);
        let second = analyzer.observe(&signal);
        assert!((second - (0.8 * first + 0.2 * energy)).abs() < 1e-6);

        // converges towards the steady energy without overshooting
        for _ in 0..100 {
            analyzer.observe(&signal);
        }
        assert!(analyzer.level() <= energy + 1e-6);
        assert!(analyzer.level() > 0.99 * energy);

        analyzer.reset();
        assert_eq!(analyzer.level(), 0.0);
    }

    #[tokio::test]
    async fn test_meter_follows_playback_status() {
        let (status_tx, status_rx) = watch::channel(PlaybackStatus::Playing);
        let window: Arc<[f32]> = Arc::from(sine(440.0, 0.9, DEFAULT_FFT_SIZE));
        let (_tap_tx, tap_rx) = watch::channel(window);

        let meter = spawn_meter(status_rx, Some(tap_rx), Duration::from_millis(1));
        let mut level = meter.level();
        level.wait_for(|v| *v > 0.0).await.unwrap();

        status_tx.send_replace(PlaybackStatus::Idle);
        level.wait_for(|v| *v == 0.0).await.unwrap();
        meter.stop();
    }
}
