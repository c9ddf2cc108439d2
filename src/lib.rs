pub mod capture;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod overlay;
pub mod pipeline;
pub mod recorder;
pub mod snapshot;
pub mod stream;
pub mod utils;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameProducer};
pub use error::{Error, Result};
pub use events::{Component, PipelineEvent};
pub use orchestrator::CameraOrchestrator;
pub use recorder::RecordMode;

/// Environment variable prefix for configuration overrides,
/// e.g. `CHERSONESOS__STREAMING__BASE_PORT=9000`.
pub const ENV_PREFIX: &str = "CHERSONESOS";

/// System configuration
///
/// Constructed once by the host and handed to the orchestrator, which passes
/// each component the section it needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cameras: CamerasConfig,
    pub capture: CaptureConfig,
    pub recording: RecordingConfig,
    pub streaming: StreamingConfig,
    pub overlay: OverlayConfig,
    pub telemetry: TelemetryConfig,
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CamerasConfig {
    /// Logical names matched against the user-defined device names
    pub names: Vec<String>,
    pub stereo_left: String,
    pub stereo_right: String,
    /// Re-probe interval while no configured camera is present
    pub retry_interval_ms: u64,
    /// Delay between restarting the pipelines and reporting the reconnect
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub pixel_format: PixelFormat,
    pub fetch_timeout_ms: u64,
    pub max_fetch_retries: u32,
    pub fetch_retry_backoff_ms: u64,
    pub open_attempts: u32,
    pub open_backoff_ms: u64,
    pub permission_cooldown_ms: u64,
    /// Bounded wait when joining worker threads
    pub join_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub root: PathBuf,
    pub mode: recorder::RecordMode,
    /// Frame rate written into the segment headers
    pub real_fps: f64,
    pub interval_secs: u64,
    pub stored_files_limit: usize,
    pub jpeg_quality: u8,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub bind_address: String,
    /// Camera `n` in the configured list streams on `base_port + n`
    pub base_port: u16,
    pub auto_start: bool,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
    pub push_interval_ms: u64,
    /// A viewer that takes longer than this for one part is dropped
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub refresh_hz: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
    pub vehicle: SocketAddr,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub root: PathBuf,
}

impl Default for CamerasConfig {
    fn default() -> Self {
        Self {
            names: vec!["LCamera".into(), "RCamera".into()],
            stereo_left: "LCamera".into(),
            stereo_right: "RCamera".into(),
            retry_interval_ms: 10_000,
            settle_delay_ms: 1_000,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::BayerRg8,
            fetch_timeout_ms: 500,
            max_fetch_retries: 5,
            fetch_retry_backoff_ms: 33,
            open_attempts: 5,
            open_backoff_ms: 200,
            permission_cooldown_ms: 2_000,
            join_timeout_ms: 2_000,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("video"),
            mode: recorder::RecordMode::Raw,
            real_fps: 20.0,
            interval_secs: 300,
            stored_files_limit: 50,
            jpeg_quality: 90,
            queue_depth: 3,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            base_port: 8081,
            auto_start: false,
            width: 640,
            height: 480,
            jpeg_quality: 70,
            push_interval_ms: 50,
            write_timeout_ms: 1_000,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self { refresh_hz: 20 }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([0, 0, 0, 0], 5005)),
            vehicle: SocketAddr::from(([192, 168, 1, 10], 5006)),
            read_timeout_ms: 100,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("stereo"),
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `CHERSONESOS__*` environment overrides.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, error::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let loaded = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize::<Config>()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> std::result::Result<(), error::ConfigError> {
        if self.cameras.names.is_empty() {
            return Err(error::ConfigError::Invalid("no camera names configured".into()));
        }
        if self.cameras.stereo_left == self.cameras.stereo_right {
            return Err(error::ConfigError::Invalid(
                "cameras.stereo_left and cameras.stereo_right must differ".into(),
            ));
        }
        if self.recording.real_fps <= 0.0 {
            return Err(error::ConfigError::Invalid("recording.real_fps must be positive".into()));
        }
        if self.recording.queue_depth == 0 {
            return Err(error::ConfigError::Invalid("recording.queue_depth must be at least 1".into()));
        }
        if !(1..=100).contains(&self.streaming.jpeg_quality)
            || !(1..=100).contains(&self.recording.jpeg_quality)
        {
            return Err(error::ConfigError::Invalid("jpeg quality must be within 1..=100".into()));
        }
        Ok(())
    }

    /// Streaming port for the camera at `index` in the configured list
    pub fn stream_port(&self, index: usize) -> u16 {
        self.streaming.base_port.saturating_add(index as u16)
    }
}

impl CaptureConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}
