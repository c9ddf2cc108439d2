//! Simulated camera backend
//!
//! Produces synthetic RGGB frames at a fixed rate and can inject the failure
//! modes the pipeline has to survive: access denied on open, failed opens,
//! pixel-format rejection, fetch stalls, sensor faults and unplugs. Used by the
//! tests and by the binary when no hardware backend is compiled in.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::device::{CameraBackend, CameraHandle, DeviceDescriptor, Transport};
use super::frame::{PixelFormat, RawImage};
use crate::error::CaptureError;

/// Failure injection for one simulated device
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Number of opens answered with access denied
    pub deny_opens: u32,
    /// Number of opens answered with a generic failure
    pub fail_opens: u32,
    pub reject_pixel_format: bool,
    pub reject_packet_size: bool,
    /// Device disappears after this many frames
    pub unplug_after: Option<u64>,
    /// Unrecoverable sensor fault after this many frames
    pub fail_after: Option<u64>,
    /// After this many frames, time out `stall_fetches` times in a row
    pub stall_after: Option<u64>,
    pub stall_fetches: u32,
}

#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub name: String,
    pub transport: Transport,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub faults: FaultPlan,
}

impl SimulatedDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: Transport::Usb,
            width: 64,
            height: 48,
            fps: 20.0,
            faults: FaultPlan::default(),
        }
    }

    pub fn networked(name: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            transport: Transport::Network { address },
            ..Self::new(name)
        }
    }
}

/// Counters shared by every handle of one device
#[derive(Default)]
struct DeviceState {
    unplugged: AtomicBool,
    deny_remaining: AtomicU32,
    fail_remaining: AtomicU32,
    handles_created: AtomicU32,
    open_handles: AtomicI32,
    frames_served: AtomicU64,
}

struct Entry {
    device: SimulatedDevice,
    state: Arc<DeviceState>,
}

pub struct SimulatedBackend {
    entries: Mutex<Vec<Entry>>,
}

impl SimulatedBackend {
    pub fn new(devices: Vec<SimulatedDevice>) -> Self {
        let backend = Self {
            entries: Mutex::new(Vec::new()),
        };
        for device in devices {
            backend.plug(device);
        }
        backend
    }

    pub fn with_cameras(names: &[&str]) -> Self {
        Self::new(names.iter().map(|n| SimulatedDevice::new(*n)).collect())
    }

    /// Attach a device (replacing one with the same name)
    pub fn plug(&self, device: SimulatedDevice) {
        let state = DeviceState {
            deny_remaining: AtomicU32::new(device.faults.deny_opens),
            fail_remaining: AtomicU32::new(device.faults.fail_opens),
            ..DeviceState::default()
        };
        let mut entries = self.entries.lock();
        entries.retain(|e| e.device.name != device.name);
        entries.push(Entry {
            device,
            state: Arc::new(state),
        });
    }

    /// Detach a device; live handles start failing with `Disconnected`
    pub fn unplug(&self, name: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter().find(|e| e.device.name == name) {
            entry.state.unplugged.store(true, Ordering::SeqCst);
        }
        entries.retain(|e| e.device.name != name);
    }

    fn state(&self, name: &str) -> Option<Arc<DeviceState>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.device.name == name)
            .map(|e| e.state.clone())
    }

    pub fn handles_created(&self, name: &str) -> u32 {
        self.state(name)
            .map_or(0, |s| s.handles_created.load(Ordering::SeqCst))
    }

    pub fn open_handles(&self, name: &str) -> i32 {
        self.state(name).map_or(0, |s| s.open_handles.load(Ordering::SeqCst))
    }

    pub fn frames_served(&self, name: &str) -> u64 {
        self.state(name)
            .map_or(0, |s| s.frames_served.load(Ordering::SeqCst))
    }
}

impl CameraBackend for SimulatedBackend {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .enumerate()
            .map(|(i, e)| descriptor(&e.device, i))
            .collect())
    }

    fn create_handle(&self, device: &DeviceDescriptor) -> Result<Box<dyn CameraHandle>, CaptureError> {
        let entries = self.entries.lock();
        let entry = entries
            .iter()
            .find(|e| e.device.name == device.user_name)
            .ok_or_else(|| CaptureError::HandleCreation {
                device: device.user_name.clone(),
                reason: "device not attached".into(),
            })?;
        entry.state.handles_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedHandle::new(entry.device.clone(), entry.state.clone())))
    }
}

fn descriptor(device: &SimulatedDevice, index: usize) -> DeviceDescriptor {
    DeviceDescriptor {
        id: format!("sim:{}", device.name),
        user_name: device.name.clone(),
        model: "Simulated".into(),
        serial: format!("SIM{index:04}"),
        transport: device.transport,
    }
}

struct SimulatedHandle {
    device: SimulatedDevice,
    state: Arc<DeviceState>,
    opened: bool,
    grabbing: bool,
    format: PixelFormat,
    served: u64,
    stall_left: u32,
    next_due: Option<Instant>,
    started: Instant,
}

impl SimulatedHandle {
    fn new(device: SimulatedDevice, state: Arc<DeviceState>) -> Self {
        let stall_left = device.faults.stall_fetches;
        Self {
            device,
            state,
            opened: false,
            grabbing: false,
            format: PixelFormat::BayerRg8,
            served: 0,
            stall_left,
            next_due: None,
            started: Instant::now(),
        }
    }

    fn synthesize(&self) -> Vec<u8> {
        let (w, h) = (self.device.width, self.device.height);
        let shift = (self.served * 3) as u32;
        let mut data = Vec::with_capacity((w * h) as usize * self.format.bytes_per_pixel());
        for y in 0..h {
            for x in 0..w {
                let v = (x * 4 + y * 2).wrapping_add(shift) as u8;
                match self.format {
                    PixelFormat::Rgb24 => data.extend_from_slice(&[v, v / 2, 255 - v]),
                    _ => data.push(v),
                }
            }
        }
        data
    }

    /// Sleep until the next frame is due. Returns `false` when that is
    /// further away than `timeout`.
    fn pace(&mut self, timeout: Duration) -> bool {
        let period = Duration::from_secs_f64(1.0 / self.device.fps.max(0.001));
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return false;
            }
            thread::sleep(wait);
        }
        self.next_due = Some(due.max(now) + period);
        true
    }
}

impl CameraHandle for SimulatedHandle {
    fn open(&mut self) -> Result<(), CaptureError> {
        if self.opened {
            return Ok(());
        }
        if self.state.unplugged.load(Ordering::SeqCst) {
            return Err(CaptureError::Disconnected(self.device.name.clone()));
        }
        let take = |counter: &AtomicU32| {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        };
        if take(&self.state.deny_remaining) {
            return Err(CaptureError::PermissionDenied(self.device.name.clone()));
        }
        if take(&self.state.fail_remaining) {
            return Err(CaptureError::Hardware("device busy".into()));
        }
        self.opened = true;
        self.state.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn optimize_packet_size(&mut self) -> Result<u32, CaptureError> {
        if self.device.faults.reject_packet_size {
            return Err(CaptureError::Hardware("jumbo frames unsupported".into()));
        }
        Ok(8192)
    }

    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<(), CaptureError> {
        if self.device.faults.reject_pixel_format {
            return Err(CaptureError::Hardware(format!("{format:?} not supported")));
        }
        self.format = format;
        Ok(())
    }

    fn start_grabbing(&mut self) -> Result<(), CaptureError> {
        if !self.opened {
            return Err(CaptureError::Hardware("device not open".into()));
        }
        self.grabbing = true;
        self.next_due = None;
        Ok(())
    }

    fn next_image(&mut self, timeout: Duration) -> Result<RawImage, CaptureError> {
        if self.state.unplugged.load(Ordering::SeqCst) {
            return Err(CaptureError::Disconnected(self.device.name.clone()));
        }
        if !self.grabbing {
            return Err(CaptureError::Hardware("not grabbing".into()));
        }
        let faults = &self.device.faults;
        if faults.unplug_after.is_some_and(|n| self.served >= n) {
            self.state.unplugged.store(true, Ordering::SeqCst);
            return Err(CaptureError::Disconnected(self.device.name.clone()));
        }
        if faults.fail_after.is_some_and(|n| self.served >= n) {
            return Err(CaptureError::Hardware("sensor fault".into()));
        }
        if faults.stall_after.is_some_and(|n| self.served >= n) && self.stall_left > 0 {
            self.stall_left -= 1;
            thread::sleep(timeout.min(Duration::from_millis(2)));
            return Err(CaptureError::Timeout);
        }
        if !self.pace(timeout) {
            return Err(CaptureError::Timeout);
        }

        let data = self.synthesize();
        self.served += 1;
        self.state.frames_served.fetch_add(1, Ordering::SeqCst);
        Ok(RawImage {
            data,
            width: self.device.width,
            height: self.device.height,
            format: self.format,
            device_timestamp: Some(self.started.elapsed()),
        })
    }

    fn stop_grabbing(&mut self) {
        self.grabbing = false;
    }

    fn close(&mut self) {
        self.grabbing = false;
        if self.opened {
            self.opened = false;
            self.state.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SimulatedHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Per-name fault plans, e.g. from a test table
pub fn with_faults(names: &[&str], faults: HashMap<&str, FaultPlan>) -> SimulatedBackend {
    SimulatedBackend::new(
        names
            .iter()
            .map(|name| SimulatedDevice {
                faults: faults.get(name).cloned().unwrap_or_default(),
                ..SimulatedDevice::new(*name)
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(backend: &SimulatedBackend, name: &str) -> Box<dyn CameraHandle> {
        let desc = backend
            .enumerate()
            .unwrap()
            .into_iter()
            .find(|d| d.user_name == name)
            .unwrap();
        let mut handle = backend.create_handle(&desc).unwrap();
        handle.open().unwrap();
        handle.start_grabbing().unwrap();
        handle
    }

    #[test]
    fn test_frames_have_requested_size() {
        let backend = SimulatedBackend::with_cameras(&["LCamera"]);
        let mut handle = open(&backend, "LCamera");
        let raw = handle.next_image(Duration::from_millis(500)).unwrap();
        assert_eq!(raw.data.len(), 64 * 48);
        assert_eq!(backend.frames_served("LCamera"), 1);
    }

    #[test]
    fn test_unplug_disconnects_live_handle() {
        let backend = SimulatedBackend::with_cameras(&["LCamera"]);
        let mut handle = open(&backend, "LCamera");
        backend.unplug("LCamera");
        let err = handle.next_image(Duration::from_millis(100)).unwrap_err();
        assert!(err.is_unplug());
        assert!(backend.enumerate().unwrap().is_empty());
    }

    #[test]
    fn test_stall_times_out() {
        let mut faults = HashMap::new();
        faults.insert(
            "LCamera",
            FaultPlan {
                stall_after: Some(0),
                stall_fetches: 2,
                ..FaultPlan::default()
            },
        );
        let backend = with_faults(&["LCamera"], faults);
        let mut handle = open(&backend, "LCamera");
        assert!(handle.next_image(Duration::from_millis(50)).unwrap_err().is_transient());
        assert!(handle.next_image(Duration::from_millis(50)).unwrap_err().is_transient());
        assert!(handle.next_image(Duration::from_millis(500)).is_ok());
    }

    #[test]
    fn test_slow_device_times_out() {
        let mut device = SimulatedDevice::new("Slow");
        device.fps = 1.0;
        let backend = SimulatedBackend::new(vec![device]);
        let mut handle = open(&backend, "Slow");
        assert!(handle.next_image(Duration::from_millis(10)).is_ok());
        assert!(matches!(
            handle.next_image(Duration::from_millis(10)),
            Err(CaptureError::Timeout)
        ));
    }
}
