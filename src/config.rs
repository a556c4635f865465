//! Session configuration
//!
//! Everything has a working default for a local backend; `from_env`
//! overrides individual fields from `TALKBACK_*` variables.

use crate::capture::SAMPLE_RATE;
use crate::history::{DEFAULT_CAPACITY, DEFAULT_STORAGE_KEY};
use crate::transcript::SegmentationPolicy;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_STT_URL: &str = "TALKBACK_STT_URL";
pub const ENV_CHAT_URL: &str = "TALKBACK_CHAT_URL";
pub const ENV_HISTORY_CAPACITY: &str = "TALKBACK_HISTORY_CAPACITY";
pub const ENV_HISTORY_DIR: &str = "TALKBACK_HISTORY_DIR";
pub const ENV_FRAME_MS: &str = "TALKBACK_FRAME_MS";
pub const ENV_INPUT_DEVICE: &str = "TALKBACK_INPUT_DEVICE";
pub const ENV_SILENCE_MS: &str = "TALKBACK_SILENCE_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub transcription_url: String,
    pub dialogue_url: String,
    pub history_capacity: usize,
    pub history_dir: PathBuf,
    pub storage_key: String,
    pub frame_duration: Duration,
    pub sample_rate: u32,
    pub input_device: Option<String>,
    pub segmentation: SegmentationPolicy,
    /// How often the volume meter samples the active segment
    pub meter_interval: Duration,
    pub app_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transcription_url: "ws://localhost:8000/ws/stt".to_string(),
            dialogue_url: "ws://localhost:8000/ws/chat".to_string(),
            history_capacity: DEFAULT_CAPACITY,
            history_dir: default_history_dir(),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            frame_duration: Duration::from_millis(200),
            sample_rate: SAMPLE_RATE,
            input_device: None,
            segmentation: SegmentationPolicy::FinalFlag,
            meter_interval: Duration::from_millis(16),
            app_name: "talkback".to_string(),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns per variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_STT_URL) {
            config.transcription_url = parse_url(ENV_STT_URL, url)?;
        }
        if let Some(url) = lookup(ENV_CHAT_URL) {
            config.dialogue_url = parse_url(ENV_CHAT_URL, url)?;
        }
        if let Some(value) = lookup(ENV_HISTORY_CAPACITY) {
            config.history_capacity = match value.trim().parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => return Err(invalid(ENV_HISTORY_CAPACITY, value)),
            };
        }
        if let Some(dir) = lookup(ENV_HISTORY_DIR) {
            if dir.trim().is_empty() {
                return Err(invalid(ENV_HISTORY_DIR, dir));
            }
            config.history_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_FRAME_MS) {
            config.frame_duration = Duration::from_millis(parse_millis(ENV_FRAME_MS, value)?);
        }
        if let Some(device) = lookup(ENV_INPUT_DEVICE) {
            let device = device.trim().to_string();
            config.input_device = (!device.is_empty()).then_some(device);
        }
        if let Some(value) = lookup(ENV_SILENCE_MS) {
            let ms = parse_millis(ENV_SILENCE_MS, value)?;
            config.segmentation = SegmentationPolicy::SilenceTimeout(Duration::from_millis(ms));
        }

        Ok(config)
    }
}

fn default_history_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("talkback")
}

fn invalid(var: &'static str, value: String) -> ConfigError {
    ConfigError::Invalid { var, value }
}

fn parse_url(var: &'static str, value: String) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        Ok(trimmed.to_string())
    } else {
        Err(invalid(var, value))
    }
}

fn parse_millis(var: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err(invalid(var, value)),
    }
}
