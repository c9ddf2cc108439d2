//! Per-camera acquire loop

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::debayer;
use super::device::CameraHandle;
use super::frame::Frame;
use crate::error::CaptureError;
use crate::events::{EventSender, PipelineEvent};
use crate::pipeline::CameraSlots;
use crate::utils::{StopFlag, Worker};
use crate::CaptureConfig;

/// Minimum spacing of `FrameReady` heartbeats
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProducerState {
    Idle = 0,
    Grabbing = 1,
    Failed = 2,
}

impl ProducerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ProducerState::Grabbing,
            2 => ProducerState::Failed,
            _ => ProducerState::Idle,
        }
    }
}

/// Owns one camera's hardware handle while grabbing and is the only writer of
/// that camera's frame slots.
pub struct FrameProducer {
    camera: String,
    slots: Arc<CameraSlots>,
    config: CaptureConfig,
    events: EventSender,
    state: Arc<AtomicU8>,
    frames: Arc<AtomicU64>,
    worker: Option<Worker>,
}

impl FrameProducer {
    pub fn new(camera: impl Into<String>, slots: Arc<CameraSlots>, config: CaptureConfig, events: EventSender) -> Self {
        Self {
            camera: camera.into(),
            slots,
            config,
            events,
            state: Arc::new(AtomicU8::new(ProducerState::Idle as u8)),
            frames: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    /// Start grabbing on an opened handle and spawn the capture worker.
    /// The handle is owned by the worker from here on.
    pub fn start(&mut self, mut handle: Box<dyn CameraHandle>) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            self.stop();
        }
        if let Err(e) = handle.start_grabbing() {
            handle.close();
            return Err(e);
        }

        self.state.store(ProducerState::Grabbing as u8, Ordering::Release);
        let capture = CaptureLoop {
            camera: self.camera.clone(),
            handle: Some(handle),
            slots: self.slots.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            frames: self.frames.clone(),
        };
        let worker = Worker::spawn(format!("capture-{}", self.camera), move |stop| capture.run(stop));
        match worker {
            Ok(worker) => {
                info!(camera = %self.camera, "Capture started");
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                // `capture` (and with it the handle) was dropped and torn down
                self.state.store(ProducerState::Failed as u8, Ordering::Release);
                Err(CaptureError::Io(e))
            }
        }
    }

    /// Cooperative stop. The loop notices within one fetch timeout and tears
    /// the handle down itself. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            let timeout = self.config.fetch_timeout() + self.config.join_timeout();
            worker.stop(timeout);
            info!(camera = %self.camera, "Capture stopped");
        }
        if self.state() == ProducerState::Grabbing {
            self.state.store(ProducerState::Idle as u8, Ordering::Release);
        }
    }

    pub fn state(&self) -> ProducerState {
        ProducerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureLoop {
    camera: String,
    handle: Option<Box<dyn CameraHandle>>,
    slots: Arc<CameraSlots>,
    config: CaptureConfig,
    events: EventSender,
    state: Arc<AtomicU8>,
    frames: Arc<AtomicU64>,
}

impl CaptureLoop {
    #[instrument(skip_all, fields(camera = %self.camera))]
    fn run(mut self, stop: StopFlag) {
        let timeout = self.config.fetch_timeout();
        let backoff = Duration::from_millis(self.config.fetch_retry_backoff_ms);
        let mut failures = 0u32;
        let mut sequence = 0u64;
        let mut last_heartbeat: Option<Instant> = None;

        while !stop.is_set() {
            let Some(handle) = self.handle.as_mut() else {
                break;
            };
            match handle.next_image(timeout) {
                Ok(raw) => {
                    failures = 0;
                    match debayer::to_rgb(&raw) {
                        Ok(image) => {
                            sequence += 1;
                            self.slots.publish(Frame::new(image, sequence, raw.device_timestamp));
                            self.frames.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!("chersonesos_frames_captured", "camera" => self.camera.clone())
                                .increment(1);

                            if last_heartbeat.map_or(true, |t| t.elapsed() >= HEARTBEAT_INTERVAL) {
                                last_heartbeat = Some(Instant::now());
                                self.events.publish(PipelineEvent::FrameReady {
                                    camera: self.camera.clone(),
                                    sequence,
                                });
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping unconvertible frame"),
                    }
                }
                Err(e) if e.is_transient() && failures < self.config.max_fetch_retries => {
                    failures += 1;
                    debug!(error = %e, failures, "Transient fetch error, retrying");
                    stop.sleep(backoff);
                }
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }

        self.teardown();
        self.state.store(ProducerState::Idle as u8, Ordering::Release);
    }

    fn fail(&mut self, e: CaptureError) {
        let unplugged = e.is_unplug();
        error!(error = %e, unplugged, "Capture failed");
        self.teardown();
        self.state.store(ProducerState::Failed as u8, Ordering::Release);
        self.events.publish(PipelineEvent::CaptureFailed {
            camera: self.camera.clone(),
            unplugged,
            message: e.to_string(),
        });
    }

    /// Stop grabbing and close the handle. Runs at most once.
    fn teardown(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.stop_grabbing();
            handle.close();
            debug!("Handle closed");
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::device::{CameraBackend, DeviceManager};
    use crate::capture::mock::{FaultPlan, SimulatedBackend, SimulatedDevice};
    use crate::events;
    use std::thread;

    fn fast_config() -> CaptureConfig {
        CaptureConfig {
            fetch_timeout_ms: 100,
            fetch_retry_backoff_ms: 1,
            open_backoff_ms: 1,
            ..CaptureConfig::default()
        }
    }

    fn start(device: SimulatedDevice) -> (FrameProducer, Arc<SimulatedBackend>, flume::Receiver<PipelineEvent>) {
        let name = device.name.clone();
        let backend = Arc::new(SimulatedBackend::new(vec![device]));
        let (tx, rx) = events::channel(64);
        let dm = DeviceManager::new(backend.clone(), fast_config(), tx.clone());
        let desc = backend.enumerate().unwrap().remove(0);
        let handle = dm.open_handle(&desc).unwrap();
        let mut producer = FrameProducer::new(name, Arc::new(CameraSlots::new(3)), fast_config(), tx);
        producer.start(handle).unwrap();
        (producer, backend, rx)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_publishes_frames_and_stops_cleanly() {
        let mut device = SimulatedDevice::new("LCamera");
        device.fps = 100.0;
        let (mut producer, backend, rx) = start(device);

        assert!(wait_for(|| producer.frames_captured() >= 3));
        assert_eq!(producer.state(), ProducerState::Grabbing);
        let slots = producer.slots.clone();
        let frame = slots.display.read().unwrap();
        assert_eq!(frame.dimensions(), (64, 48));
        assert!(matches!(rx.try_recv(), Ok(PipelineEvent::FrameReady { .. })));

        let started = Instant::now();
        producer.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(producer.state(), ProducerState::Idle);
        assert_eq!(backend.open_handles("LCamera"), 0);
        // idempotent
        producer.stop();
    }

    #[test]
    fn test_unplug_reports_failure() {
        let mut device = SimulatedDevice::new("LCamera");
        device.fps = 100.0;
        device.faults = FaultPlan {
            unplug_after: Some(2),
            ..FaultPlan::default()
        };
        let (producer, _backend, rx) = start(device);

        assert!(wait_for(|| producer.state() == ProducerState::Failed));
        let failure = rx
            .iter()
            .find(|e| matches!(e, PipelineEvent::CaptureFailed { .. }))
            .unwrap();
        assert!(matches!(failure, PipelineEvent::CaptureFailed { unplugged: true, .. }));
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let mut device = SimulatedDevice::new("LCamera");
        device.fps = 100.0;
        device.faults = FaultPlan {
            stall_after: Some(1),
            stall_fetches: 5,
            ..FaultPlan::default()
        };
        let (producer, _backend, _rx) = start(device);
        assert!(wait_for(|| producer.frames_captured() >= 3));
        assert_eq!(producer.state(), ProducerState::Grabbing);
    }

    #[test]
    fn test_too_many_timeouts_is_fatal() {
        let mut device = SimulatedDevice::new("LCamera");
        device.fps = 100.0;
        device.faults = FaultPlan {
            stall_after: Some(1),
            stall_fetches: 6,
            ..FaultPlan::default()
        };
        let (producer, backend, rx) = start(device);
        assert!(wait_for(|| producer.state() == ProducerState::Failed));
        assert_eq!(producer.frames_captured(), 1);
        assert_eq!(backend.open_handles("LCamera"), 0);
        let failure = rx
            .iter()
            .find(|e| matches!(e, PipelineEvent::CaptureFailed { .. }))
            .unwrap();
        assert!(matches!(failure, PipelineEvent::CaptureFailed { unplugged: false, .. }));
    }
}
