//! Device enumeration and hardware handle management

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::frame::{PixelFormat, RawImage};
use crate::error::CaptureError;
use crate::events::{Component, EventSender};
use crate::CaptureConfig;

/// How a device is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Network { address: Ipv4Addr },
    Usb,
}

/// Enumerated physical device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Backend-specific identifier used to create a handle
    pub id: String,
    /// User-defined name stored on the device, matched against the config
    pub user_name: String,
    pub model: String,
    pub serial: String,
    pub transport: Transport,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.user_name, self.model, self.serial)
    }
}

/// An opened (or openable) camera. Owned by exactly one producer at a time.
pub trait CameraHandle: Send {
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Negotiate the largest packet size the network path allows.
    /// Only called for network-attached devices.
    fn optimize_packet_size(&mut self) -> Result<u32, CaptureError>;

    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<(), CaptureError>;

    fn start_grabbing(&mut self) -> Result<(), CaptureError>;

    /// Wait at most `timeout` for the next image buffer
    fn next_image(&mut self, timeout: Duration) -> Result<RawImage, CaptureError>;

    fn stop_grabbing(&mut self);

    /// Release the device. Must be safe to call more than once.
    fn close(&mut self);
}

/// Vendor/driver access point
pub trait CameraBackend: Send + Sync {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError>;

    fn create_handle(&self, device: &DeviceDescriptor) -> Result<Box<dyn CameraHandle>, CaptureError>;
}

/// Configured camera matched to a physical device
pub struct CameraDescriptor {
    pub name: String,
    /// Position in the configured camera list
    pub index: usize,
    pub device: DeviceDescriptor,
    pub display_target: Option<String>,
    handle: Option<Box<dyn CameraHandle>>,
}

impl CameraDescriptor {
    pub fn new(name: impl Into<String>, index: usize, device: DeviceDescriptor) -> Self {
        Self {
            name: name.into(),
            index,
            device,
            display_target: None,
            handle: None,
        }
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Install a freshly opened handle. A previous handle is closed first so
    /// at most one is ever live.
    pub fn install_handle(&mut self, handle: Box<dyn CameraHandle>) {
        if let Some(mut old) = self.handle.replace(handle) {
            warn!(camera = %self.name, "Replacing live handle, closing the old one");
            old.close();
        }
    }

    /// Hand the handle over to a producer
    pub fn take_handle(&mut self) -> Option<Box<dyn CameraHandle>> {
        self.handle.take()
    }

    pub fn clear(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
    }
}

impl Drop for CameraDescriptor {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for CameraDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraDescriptor")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("device", &self.device)
            .field("has_handle", &self.has_handle())
            .finish()
    }
}

/// Enumerates devices, matches them to configured names and opens handles
/// with retry/backoff.
pub struct DeviceManager {
    backend: Arc<dyn CameraBackend>,
    config: CaptureConfig,
    events: EventSender,
    /// Network address -> camera that claimed it
    claimed: Mutex<HashMap<Ipv4Addr, String>>,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn CameraBackend>, config: CaptureConfig, events: EventSender) -> Self {
        Self {
            backend,
            config,
            events,
            claimed: Mutex::new(HashMap::new()),
        }
    }

    pub fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        let devices = self.backend.enumerate()?;
        if devices.is_empty() {
            return Err(CaptureError::NoDevicesFound);
        }
        debug!(count = devices.len(), "Enumerated devices");
        Ok(devices)
    }

    /// Pair each configured name with the first device carrying that user
    /// name. Unmatched names are skipped.
    pub fn match_configured(&self, devices: &[DeviceDescriptor], names: &[String]) -> Vec<CameraDescriptor> {
        let mut matched = Vec::new();
        for (index, name) in names.iter().enumerate() {
            match devices.iter().find(|d| &d.user_name == name) {
                Some(device) => {
                    info!(camera = %name, %device, "Matched camera");
                    if let Transport::Network { address } = device.transport {
                        self.claim_address(address, name);
                    }
                    matched.push(CameraDescriptor::new(name.clone(), index, device.clone()));
                }
                None => debug!(camera = %name, "Configured camera not present"),
            }
        }
        matched
    }

    /// Record a network address as in use. Returns `false` and emits a
    /// warning when another camera already holds it.
    pub fn claim_address(&self, address: Ipv4Addr, camera: &str) -> bool {
        let mut claimed = self.claimed.lock();
        match claimed.get(&address) {
            Some(owner) if owner != camera => {
                self.events.warning(
                    Component::DeviceManager,
                    format!("IP conflict: {camera} and {owner} both use {address}"),
                );
                false
            }
            _ => {
                claimed.insert(address, camera.to_string());
                true
            }
        }
    }

    pub fn release_addresses(&self) {
        self.claimed.lock().clear();
    }

    /// Create and open a handle, negotiate transport and pixel format.
    /// A failing step closes the partial handle before the error is returned.
    #[instrument(skip(self), fields(device = %device))]
    pub fn open_handle(&self, device: &DeviceDescriptor) -> Result<Box<dyn CameraHandle>, CaptureError> {
        let mut handle = self.backend.create_handle(device)?;
        let attempts = self.config.open_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match handle.open() {
                Ok(()) => break,
                Err(e) if attempt >= attempts => {
                    Self::close_handle(handle);
                    return Err(CaptureError::OpenFailed {
                        device: device.user_name.clone(),
                        attempts,
                        reason: e.to_string(),
                    });
                }
                Err(CaptureError::PermissionDenied(reason)) => {
                    warn!(attempt, %reason, "Access denied, recreating handle after cooldown");
                    Self::close_handle(handle);
                    thread::sleep(Duration::from_millis(self.config.permission_cooldown_ms));
                    handle = self.backend.create_handle(device)?;
                }
                Err(e) => {
                    let backoff = Duration::from_millis(self.config.open_backoff_ms * attempt as u64);
                    debug!(attempt, error = %e, ?backoff, "Open failed, retrying");
                    thread::sleep(backoff);
                }
            }
        }

        if let Transport::Network { .. } = device.transport {
            match handle.optimize_packet_size() {
                Ok(size) => debug!(packet_size = size, "Packet size negotiated"),
                Err(e) => {
                    Self::close_handle(handle);
                    return Err(CaptureError::PacketSize {
                        device: device.user_name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if let Err(e) = handle.set_pixel_format(self.config.pixel_format) {
            Self::close_handle(handle);
            return Err(CaptureError::PixelFormat {
                device: device.user_name.clone(),
                reason: e.to_string(),
            });
        }

        info!(attempts = attempt, "Handle opened");
        Ok(handle)
    }

    pub fn close_handle(mut handle: Box<dyn CameraHandle>) {
        handle.stop_grabbing();
        handle.close();
    }
}
