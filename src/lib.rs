pub mod capture;
pub mod error;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use capture::pool::MIN_BUFFERS;
use capture::retry::{DEFAULT_MAX_ATTEMPTS, DEFAULT_WAIT};
use capture::session::Backend;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use error::{CaptureError, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub retry: RetryConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device path for V4L2, camera id for libcamera. Empty means pick one.
    pub device: String,
    pub backend: Backend,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
}

/// Bounds for the retry guard around device calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub wait_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames buffered between the capture thread and the consumer.
    pub frame_queue: usize,
    pub stats_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            backend: Backend::V4l2,
            width: 1280,
            height: 720,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            wait_ms: DEFAULT_WAIT.as_millis() as u64,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_queue: 8,
            stats_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Layer the defaults, an optional TOML file and `CAMLOOP_*` environment
    /// variables (`CAMLOOP_CAPTURE__WIDTH=640`).
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let loaded: Config = builder
            .add_source(
                config::Environment::with_prefix("CAMLOOP")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame size {}x{}",
                capture.width, capture.height
            )));
        }
        if capture.buffer_count < MIN_BUFFERS {
            return Err(ConfigError::Invalid(format!(
                "buffer_count {} is below {}",
                capture.buffer_count, MIN_BUFFERS
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}
