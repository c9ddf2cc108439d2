use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Camera enumeration, handle management and frame acquisition errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No camera devices found")]
    NoDevicesFound,

    #[error("Failed to create handle for {device}: {reason}")]
    HandleCreation { device: String, reason: String },

    #[error("Failed to open {device} after {attempts} attempts: {reason}")]
    OpenFailed {
        device: String,
        attempts: u32,
        reason: String,
    },

    #[error("Access denied: {0}")]
    PermissionDenied(String),

    #[error("Packet size negotiation failed for {device}: {reason}")]
    PacketSize { device: String, reason: String },

    #[error("Pixel format negotiation failed for {device}: {reason}")]
    PixelFormat { device: String, reason: String },

    #[error("Timed out waiting for image buffer")]
    Timeout,

    #[error("Incomplete image buffer: {0}")]
    IncompleteBuffer(String),

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Frame conversion failed: {0}")]
    Conversion(String),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CaptureError {
    /// Errors worth retrying inside the acquire loop
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Timeout | CaptureError::IncompleteBuffer(_))
    }

    /// Whether the failure means the device went away (unplug, cable loss)
    pub fn is_unplug(&self) -> bool {
        match self {
            CaptureError::Disconnected(_) => true,
            CaptureError::Io(e) => {
                matches!(e.raw_os_error(), Some(19)) // ENODEV
            }
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Recording already in progress for {0}")]
    AlreadyRecording(String),

    #[error("Not recording: {0}")]
    NotRecording(String),

    #[error("Overlay recording requested but no overlay source is running for {0}")]
    OverlayUnavailable(String),

    #[error("Cannot create session directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("No write permission in {0:?}")]
    PermissionDenied(PathBuf),

    #[error("Failed to open video writer {path:?}: {source}")]
    WriterOpen { path: PathBuf, source: io::Error },

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream already running on port {0}")]
    AlreadyStreaming(u16),

    #[error("Cannot bind stream port {port}: {source}")]
    PortBindFailed { port: u16, source: io::Error },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Stereo pair incomplete, missing camera {0}")]
    MissingCameraPair(String),

    #[error("Camera {0} has not produced a frame yet")]
    EmptyFrame(String),

    #[error("Cannot create snapshot directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to write image: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Telemetry packet has {actual} bytes, expected {expected}")]
    BadLength { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown camera: {0}")]
    UnknownCamera(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
