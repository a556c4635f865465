/// Microphone sanity check
/// Records a few seconds through the capture engine and reports what arrived
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use talkback::capture::{CaptureEngine, CaptureEvent, PulseDevices};
use talkback::SessionConfig;

const RECORD_FOR: Duration = Duration::from_secs(3);

fn rms(pcm: &[u8]) -> f64 {
    let samples: Vec<f64> = pcm
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f64 / i16::MAX as f64)
        .collect();
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f64>() / samples.len() as f64).sqrt()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = SessionConfig::from_env()?;
    println!("🎤 Capture check");
    println!(
        "Source: {}",
        config.input_device.as_deref().unwrap_or("<default>")
    );
    println!(
        "Recording {} s in {} ms frames...\n",
        RECORD_FOR.as_secs(),
        config.frame_duration.as_millis()
    );

    let devices = Arc::new(PulseDevices::new(&config.app_name, config.input_device.clone()));
    let (mut engine, mut events) = CaptureEngine::new(devices, config.frame_duration, config.sample_rate);
    engine.start()?;

    let mut frames = 0u64;
    let mut peak = 0.0f64;
    let deadline = tokio::time::sleep(RECORD_FOR);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(CaptureEvent::Started) => println!("Microphone open, recording"),
                Some(CaptureEvent::Frame(frame)) => {
                    let level = rms(&frame.pcm);
                    peak = peak.max(level);
                    frames += 1;
                    println!("frame {:>3}: {:>6} bytes, rms {:.4}", frame.seq, frame.pcm.len(), level);
                }
                Some(CaptureEvent::Failed(reason)) => {
                    println!("❌ Capture failed: {}", reason);
                    break;
                }
                None => break,
            }
        }
    }
    engine.stop();

    println!("\n{} frames captured, peak rms {:.4}", frames, peak);
    if frames == 0 {
        println!("⚠️ No audio arrived; check the source name and permissions");
    } else if peak < 0.001 {
        println!("⚠️ Only silence recorded; is the microphone muted?");
    } else {
        println!("✅ Microphone works");
    }
    Ok(())
}
