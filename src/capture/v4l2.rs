//! V4L2 backend for USB cameras

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::device::{CameraBackend, CameraHandle, DeviceDescriptor, Transport};
use super::frame::{PixelFormat, RawImage};
use crate::error::CaptureError;

/// Kernel buffers queued per stream
const BUFFER_COUNT: u32 = 4;

const ENODEV: i32 = 19;

/// Enumerates `/dev/video*` nodes that can capture. The device card name is
/// used as the user-defined name matched against the configured cameras.
#[derive(Debug, Default)]
pub struct V4l2Backend;

impl V4l2Backend {
    pub fn new() -> Self {
        Self
    }
}

impl CameraBackend for V4l2Backend {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        let mut devices = Vec::new();
        for node in v4l::context::enum_devices() {
            let path = node.path().to_path_buf();
            let device = match Device::with_path(&path) {
                Ok(device) => device,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping node");
                    continue;
                }
            };
            let caps = match device.query_caps() {
                Ok(caps) => caps,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Capability query failed");
                    continue;
                }
            };
            if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                continue;
            }
            info!(path = %path.display(), card = %caps.card, driver = %caps.driver, "Found capture device");
            devices.push(DeviceDescriptor {
                id: path.display().to_string(),
                user_name: caps.card.clone(),
                model: caps.driver.clone(),
                serial: caps.bus.clone(),
                transport: Transport::Usb,
            });
        }
        Ok(devices)
    }

    fn create_handle(&self, device: &DeviceDescriptor) -> Result<Box<dyn CameraHandle>, CaptureError> {
        let path = PathBuf::from(&device.id);
        if !path.exists() {
            return Err(CaptureError::HandleCreation {
                device: device.user_name.clone(),
                reason: format!("{} does not exist", path.display()),
            });
        }
        Ok(Box::new(V4l2Handle {
            name: device.user_name.clone(),
            path,
            device: None,
            stream: None,
            format: PixelFormat::BayerRg8,
            width: 0,
            height: 0,
        }))
    }
}

struct V4l2Handle {
    name: String,
    path: PathBuf,
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    format: PixelFormat,
    width: u32,
    height: u32,
}

impl V4l2Handle {
    fn device(&self) -> Result<&Device, CaptureError> {
        self.device
            .as_ref()
            .ok_or_else(|| CaptureError::Hardware(format!("{} is not open", self.name)))
    }

    fn map_io(&self, e: io::Error) -> CaptureError {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => CaptureError::Timeout,
            io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied(self.name.clone()),
            _ if e.raw_os_error() == Some(ENODEV) => CaptureError::Disconnected(self.name.clone()),
            _ => CaptureError::Io(e),
        }
    }
}

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::BayerRg8 => FourCC::new(b"RGGB"),
        PixelFormat::Mono8 => FourCC::new(b"GREY"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
    }
}

impl CameraHandle for V4l2Handle {
    fn open(&mut self) -> Result<(), CaptureError> {
        if self.device.is_some() {
            return Ok(());
        }
        let device = Device::with_path(&self.path).map_err(|e| self.map_io(e))?;
        self.device = Some(device);
        Ok(())
    }

    fn optimize_packet_size(&mut self) -> Result<u32, CaptureError> {
        // USB transport has no packet size to negotiate
        Ok(0)
    }

    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<(), CaptureError> {
        let device = self.device()?;
        let mut fmt = device.format().map_err(|e| self.map_io(e))?;
        fmt.fourcc = fourcc(format);
        let applied = device.set_format(&fmt).map_err(|e| self.map_io(e))?;
        if applied.fourcc != fmt.fourcc {
            return Err(CaptureError::Hardware(format!(
                "driver selected {} instead of {}",
                applied.fourcc, fmt.fourcc
            )));
        }
        self.format = format;
        self.width = applied.width;
        self.height = applied.height;
        debug!(width = applied.width, height = applied.height, "Format applied");
        Ok(())
    }

    #[instrument(skip(self), fields(camera = %self.name))]
    fn start_grabbing(&mut self) -> Result<(), CaptureError> {
        let device = self.device()?;
        let stream = MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| self.map_io(e))?;
        self.stream = Some(stream);
        info!(buffers = BUFFER_COUNT, "Capture stream started");
        Ok(())
    }

    fn next_image(&mut self, timeout: Duration) -> Result<RawImage, CaptureError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(CaptureError::Hardware("not grabbing".into()));
        };
        stream.set_timeout(timeout);
        let result = stream.next().map(|(buf, meta)| {
            let device_timestamp = Duration::from_secs(meta.timestamp.sec.max(0) as u64)
                + Duration::from_micros(meta.timestamp.usec.max(0) as u64);
            let used = (meta.bytesused as usize).min(buf.len());
            (buf[..used].to_vec(), device_timestamp)
        });
        let (data, device_timestamp) = result.map_err(|e| self.map_io(e))?;
        Ok(RawImage {
            data,
            width: self.width,
            height: self.height,
            format: self.format,
            device_timestamp: Some(device_timestamp),
        })
    }

    fn stop_grabbing(&mut self) {
        // Dropping the stream issues VIDIOC_STREAMOFF and unmaps the buffers
        if self.stream.take().is_some() {
            debug!(camera = %self.name, "Capture stream stopped");
        }
    }

    fn close(&mut self) {
        self.stop_grabbing();
        if self.device.take().is_some() {
            debug!(camera = %self.name, "Device closed");
        }
    }
}

impl Drop for V4l2Handle {
    fn drop(&mut self) {
        if self.device.is_some() {
            warn!(camera = %self.name, "Handle dropped while open");
            self.close();
        }
    }
}
