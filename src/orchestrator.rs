//! Camera orchestrator
//!
//! Owns every per-camera component and their threads. The host drives it from
//! a single thread: it issues commands and calls [`CameraOrchestrator::poll`]
//! in a loop, which applies the failure policy to worker events and fires the
//! reconnect timers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use flume::Receiver;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{CameraBackend, CameraDescriptor, DeviceManager, FrameProducer, ProducerState};
use crate::error::{CaptureError, Error, Result};
use crate::events::{self, Component, EventSender, PipelineEvent, EVENT_CHANNEL_CAPACITY};
use crate::overlay::worker::OverlayWorker;
use crate::overlay::HudInputs;
use crate::pipeline::CameraSlots;
use crate::recorder::{RecordOptions, VideoRecorder};
use crate::snapshot::{self, StereoPaths};
use crate::stream::StreamServer;
use crate::utils::BackgroundPool;
use crate::Config;

/// Point-in-time view of one camera
#[derive(Debug, Clone, PartialEq)]
pub struct CameraStatus {
    pub name: String,
    pub producer: ProducerState,
    pub frames_captured: u64,
    pub recording: bool,
    pub session: Option<PathBuf>,
    pub stream_addr: Option<SocketAddr>,
    pub stream_clients: usize,
    pub dropped_frames: u64,
}

struct CameraUnit {
    descriptor: CameraDescriptor,
    slots: Arc<CameraSlots>,
    producer: FrameProducer,
    recorder: VideoRecorder,
    streamer: StreamServer,
    overlay: Option<OverlayWorker>,
}

impl CameraUnit {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Producer first, so consumers see no new frames while they wind down
    fn shutdown(&mut self, join_timeout: Duration) {
        self.producer.stop();
        if let Err(e) = self.recorder.stop_recording() {
            debug!(camera = %self.descriptor.name, error = %e, "Recorder already idle");
        }
        self.streamer.stop_streaming();
        if let Some(mut overlay) = self.overlay.take() {
            overlay.stop(join_timeout);
        }
        self.descriptor.clear();
    }

    fn status(&self) -> CameraStatus {
        CameraStatus {
            name: self.descriptor.name.clone(),
            producer: self.producer.state(),
            frames_captured: self.producer.frames_captured(),
            recording: self.recorder.is_recording(),
            session: self.recorder.session_dir().cloned(),
            stream_addr: self.streamer.local_addr(),
            stream_clients: self.streamer.client_count(),
            dropped_frames: self.slots.dropped_frames(),
        }
    }
}

pub struct CameraOrchestrator {
    config: Arc<Config>,
    devices: DeviceManager,
    units: Vec<CameraUnit>,
    events: EventSender,
    rx: Receiver<PipelineEvent>,
    pool: BackgroundPool,
    hud: Arc<HudInputs>,
    retry_at: Option<Instant>,
    settle_at: Option<Instant>,
    shut_down: bool,
}

impl CameraOrchestrator {
    pub fn new(config: Arc<Config>, backend: Arc<dyn CameraBackend>, pool: BackgroundPool) -> Self {
        let (events, rx) = events::channel(EVENT_CHANNEL_CAPACITY);
        let devices = DeviceManager::new(backend, config.capture.clone(), events.clone());
        Self {
            config,
            devices,
            units: Vec::new(),
            events,
            rx,
            pool,
            hud: Arc::new(HudInputs::new()),
            retry_at: None,
            settle_at: None,
            shut_down: false,
        }
    }

    /// Publishing side of the event channel, for host-side components
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Telemetry and control state shown by the HUD
    pub fn hud_inputs(&self) -> Arc<HudInputs> {
        self.hud.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether a system-fatal failure has stopped the pipeline
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Whether the periodic re-probe is armed
    pub fn retry_pending(&self) -> bool {
        self.retry_at.is_some()
    }

    /// Enumerate devices and rebuild the camera units. Returns the number of
    /// cameras now capturing.
    #[instrument(skip(self))]
    pub fn check_cameras(&mut self) -> usize {
        self.devices.release_addresses();
        let devices = match self.devices.enumerate() {
            Ok(devices) => devices,
            Err(CaptureError::NoDevicesFound) => Vec::new(),
            Err(e) => {
                self.events.warning(Component::DeviceManager, format!("Enumeration failed: {e}"));
                Vec::new()
            }
        };
        let matched = self.devices.match_configured(&devices, &self.config.cameras.names);
        if matched.is_empty() {
            self.teardown();
            self.arm_retry();
            return 0;
        }

        self.retry_at = None;
        self.teardown();
        for descriptor in matched {
            match self.build_unit(descriptor) {
                Ok(unit) => self.units.push(unit),
                Err((camera, e)) => {
                    self.events
                        .error(Component::DeviceManager, format!("{camera} disabled: {e}"));
                }
            }
        }

        if self.units.is_empty() {
            self.arm_retry();
            return 0;
        }
        let names = self.camera_names();
        info!(cameras = ?names, "Cameras started");
        self.events.publish(PipelineEvent::CamerasFound { names });
        self.settle_at = Some(Instant::now() + Duration::from_millis(self.config.cameras.settle_delay_ms));
        self.units.len()
    }

    /// Open the device and start its producer. A failure here disables this
    /// camera only.
    fn build_unit(&self, descriptor: CameraDescriptor) -> std::result::Result<CameraUnit, (String, Error)> {
        let camera = descriptor.name.clone();
        let fail = |e: Error| (camera.clone(), e);

        let handle = self.devices.open_handle(&descriptor.device).map_err(|e| fail(e.into()))?;
        let slots = Arc::new(CameraSlots::new(self.config.recording.queue_depth));
        let mut producer = FrameProducer::new(&camera, slots.clone(), self.config.capture.clone(), self.events.clone());
        producer.start(handle).map_err(|e| fail(e.into()))?;

        let recorder = VideoRecorder::new(
            &camera,
            slots.clone(),
            self.config.recording.clone(),
            self.events.clone(),
            self.pool.clone(),
        );
        let mut streamer = StreamServer::new(
            &camera,
            self.config.stream_port(descriptor.index),
            slots.clone(),
            self.config.streaming.clone(),
            self.events.clone(),
        );
        if self.config.streaming.auto_start {
            if let Err(e) = streamer.start_streaming() {
                self.events
                    .warning(Component::Streamer, format!("{camera}: auto start failed: {e}"));
            }
        }

        Ok(CameraUnit {
            descriptor,
            slots,
            producer,
            recorder,
            streamer,
            overlay: None,
        })
    }

    fn arm_retry(&mut self) {
        let interval = Duration::from_millis(self.config.cameras.retry_interval_ms);
        self.retry_at = Some(Instant::now() + interval);
        self.settle_at = None;
        warn!(retry_in = ?interval, "No configured cameras found");
        self.events.publish(PipelineEvent::NoCamerasFound);
    }

    fn teardown(&mut self) {
        self.stop_all();
        self.units.clear();
    }

    /// Stop everything and probe again
    pub fn reconnect(&mut self) -> usize {
        info!("Reconnecting cameras");
        self.check_cameras()
    }

    /// Stop every camera subsystem. Units stay around for status queries until
    /// the next `check_cameras`.
    pub fn stop_all(&mut self) {
        let join = self.config.capture.join_timeout();
        for unit in &mut self.units {
            unit.shutdown(join);
        }
        self.settle_at = None;
    }

    pub fn camera_names(&self) -> Vec<String> {
        self.units.iter().map(|u| u.name().to_string()).collect()
    }

    pub fn status(&self) -> Vec<CameraStatus> {
        self.units.iter().map(CameraUnit::status).collect()
    }

    /// Frame slots of a running camera
    pub fn slots(&self, camera: &str) -> Option<Arc<CameraSlots>> {
        self.units.iter().find(|u| u.name() == camera).map(|u| u.slots.clone())
    }

    fn unit_mut(&mut self, camera: &str) -> Result<&mut CameraUnit> {
        self.units
            .iter_mut()
            .find(|u| u.descriptor.name == camera)
            .ok_or_else(|| Error::UnknownCamera(camera.to_string()))
    }

    /// Start recording with the configured mode. Overlay modes bring up the
    /// compositor for this camera first.
    #[instrument(skip(self))]
    pub fn start_recording(&mut self, camera: &str, interval_secs: u64, files_limit: usize) -> Result<PathBuf> {
        let options = RecordOptions {
            interval_secs,
            files_limit,
            mode: self.config.recording.mode,
        };
        let hud = self.hud.clone();
        let refresh_hz = self.config.overlay.refresh_hz;
        let events = self.events.clone();
        let unit = self.unit_mut(camera)?;

        let started_overlay = options.mode.needs_overlay() && unit.overlay.is_none();
        if started_overlay {
            let worker = OverlayWorker::start(camera, unit.slots.clone(), hud, refresh_hz).map_err(|e| {
                events.error(Component::Overlay, format!("{camera}: {e}"));
                Error::Io(e)
            })?;
            unit.overlay = Some(worker);
        }

        match unit.recorder.start_recording(options) {
            Ok(dir) => Ok(dir),
            Err(e) => {
                if started_overlay {
                    if let Some(mut overlay) = unit.overlay.take() {
                        overlay.stop(crate::utils::DEFAULT_JOIN_TIMEOUT);
                    }
                }
                events.error(Component::Recorder, format!("{camera}: {e}"));
                Err(e.into())
            }
        }
    }

    pub fn stop_recording(&mut self, camera: &str) -> Result<()> {
        let join = self.config.capture.join_timeout();
        let unit = self.unit_mut(camera)?;
        let stopped = unit.recorder.stop_recording();
        if let Some(mut overlay) = unit.overlay.take() {
            overlay.stop(join);
        }
        Ok(stopped?)
    }

    pub fn start_streaming(&mut self, camera: &str) -> Result<SocketAddr> {
        let events = self.events.clone();
        let unit = self.unit_mut(camera)?;
        unit.streamer.start_streaming().map_err(|e| {
            events.error(Component::Streamer, format!("{camera}: {e}"));
            e.into()
        })
    }

    pub fn stop_streaming(&mut self, camera: &str) -> Result<()> {
        self.unit_mut(camera)?.streamer.stop_streaming();
        Ok(())
    }

    /// Grab the configured left/right pair and write it on the background
    /// pool. The outcome arrives as `SnapshotSaved` or an error event.
    #[instrument(skip(self))]
    pub fn stereo_shot(&self) -> Result<StereoPaths> {
        let left = self.config.cameras.stereo_left.as_str();
        let right = self.config.cameras.stereo_right.as_str();
        let slots_of = |name: &str| self.units.iter().find(|u| u.name() == name).map(|u| u.slots.as_ref());

        let (left_frame, right_frame) = snapshot::grab_pair((left, slots_of(left)), (right, slots_of(right)))
            .map_err(|e| {
                self.events.error(Component::Snapshot, e.to_string());
                e
            })?;

        let paths = snapshot::stereo_paths(&self.config.snapshot.root, Local::now(), left, right);
        let job = paths.clone();
        let events = self.events.clone();
        self.pool.spawn(move || match snapshot::write_stereo_pair(&job, &left_frame, &right_frame) {
            Ok(()) => events.publish(PipelineEvent::SnapshotSaved {
                left: job.left,
                right: job.right,
            }),
            Err(e) => events.error(Component::Snapshot, e.to_string()),
        });
        Ok(paths)
    }

    /// Apply the failure policy to one worker event
    pub fn handle_event(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::CaptureFailed {
                camera,
                unplugged: true,
                ..
            } => {
                warn!(%camera, "Camera unplugged, stopping all cameras");
                self.stop_all();
                if self.retry_at.is_none() {
                    self.retry_at = Some(Instant::now() + Duration::from_millis(self.config.cameras.retry_interval_ms));
                }
            }
            PipelineEvent::CaptureFailed { camera, message, .. }
            | PipelineEvent::RecordingFailed { camera, message }
            | PipelineEvent::StreamingFailed { camera, message } => {
                self.fatal(format!("{camera}: {message}"));
            }
            _ => {}
        }
    }

    fn fatal(&mut self, reason: String) {
        if self.shut_down {
            return;
        }
        error!(%reason, "System fatal failure, stopping all cameras");
        self.stop_all();
        self.retry_at = None;
        self.shut_down = true;
        self.events.publish(PipelineEvent::Shutdown { reason });
    }

    /// Wait up to `timeout` for events, fire due timers and apply the failure
    /// policy. Returns every event seen, in order, for the host to present.
    pub fn poll(&mut self, timeout: Duration) -> Vec<PipelineEvent> {
        let now = Instant::now();
        let wait = [self.retry_at, self.settle_at]
            .into_iter()
            .flatten()
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(timeout, Duration::min);

        let mut seen = self.events.take_overflow();
        if seen.is_empty() {
            if let Ok(event) = self.rx.recv_timeout(wait) {
                seen.push(event);
            }
        }
        self.fire_timers();
        seen.extend(self.rx.try_iter());
        seen.extend(self.events.take_overflow());

        let mut handled = 0;
        while handled < seen.len() {
            let event = seen[handled].clone();
            self.handle_event(&event);
            handled += 1;
            seen.extend(self.rx.try_iter());
            seen.extend(self.events.take_overflow());
        }
        seen
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        if self.retry_at.is_some_and(|at| at <= now) && !self.shut_down {
            self.retry_at = None;
            debug!("Retry timer fired");
            self.check_cameras();
        }
        if self.settle_at.is_some_and(|at| at <= now) {
            self.settle_at = None;
            info!("Reconnect complete");
            self.events.publish(PipelineEvent::ReconnectComplete);
        }
    }
}

impl Drop for CameraOrchestrator {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::{FaultPlan, SimulatedBackend, SimulatedDevice};
    use crate::error::{RecordError, SnapshotError};
    use crate::recorder::RecordMode;

    fn config(root: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.cameras.retry_interval_ms = 50;
        config.cameras.settle_delay_ms = 20;
        config.capture.fetch_timeout_ms = 100;
        config.capture.open_backoff_ms = 1;
        config.recording.root = root.join("video");
        config.snapshot.root = root.join("stereo");
        config.streaming.bind_address = "127.0.0.1".into();
        config.streaming.base_port = 0;
        config.telemetry.enabled = false;
        config
    }

    fn orchestrator(config: Config, backend: Arc<SimulatedBackend>) -> CameraOrchestrator {
        CameraOrchestrator::new(Arc::new(config), backend, BackgroundPool::inline())
    }

    fn poll_until(
        orch: &mut CameraOrchestrator,
        deadline: Duration,
        mut pred: impl FnMut(&PipelineEvent) -> bool,
    ) -> Vec<PipelineEvent> {
        let end = Instant::now() + deadline;
        let mut all = Vec::new();
        while Instant::now() < end {
            let events = orch.poll(Duration::from_millis(20));
            let hit = events.iter().any(&mut pred);
            all.extend(events);
            if hit {
                return all;
            }
        }
        panic!("condition not reached, saw {all:?}");
    }

    fn wait_for_frames(orch: &CameraOrchestrator, camera: &str) {
        let slots = orch.slots(camera).unwrap();
        let end = Instant::now() + Duration::from_secs(3);
        while slots.display.is_empty() {
            assert!(Instant::now() < end, "no frames from {camera}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_no_cameras_arms_retry() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(SimulatedBackend::new(Vec::new()));
        let mut orch = orchestrator(config(dir.path()), backend.clone());

        assert_eq!(orch.check_cameras(), 0);
        assert!(orch.retry_pending());
        poll_until(&mut orch, Duration::from_secs(1), |e| *e == PipelineEvent::NoCamerasFound);

        backend.plug(SimulatedDevice::new("LCamera"));
        let events = poll_until(&mut orch, Duration::from_secs(2), |e| *e == PipelineEvent::ReconnectComplete);
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::CamerasFound { names } if names == &["LCamera"])));
        assert!(!orch.retry_pending());
    }

    #[test]
    fn test_failed_open_disables_only_that_camera() {
        let dir = tempfile::tempdir().unwrap();
        let mut broken = SimulatedDevice::new("RCamera");
        broken.faults = FaultPlan {
            reject_pixel_format: true,
            ..FaultPlan::default()
        };
        let backend = Arc::new(SimulatedBackend::new(vec![SimulatedDevice::new("LCamera"), broken]));
        let mut orch = orchestrator(config(dir.path()), backend);

        assert_eq!(orch.check_cameras(), 1);
        assert_eq!(orch.camera_names(), vec!["LCamera"]);
        let events = orch.poll(Duration::from_millis(10));
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::Error { component: Component::DeviceManager, message } if message.contains("RCamera")
        )));
    }

    #[test]
    fn test_unknown_camera_commands() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(SimulatedBackend::with_cameras(&["LCamera"]));
        let mut orch = orchestrator(config(dir.path()), backend);
        orch.check_cameras();
        assert!(matches!(orch.start_recording("Nope", 5, 2), Err(Error::UnknownCamera(_))));
        assert!(matches!(orch.stop_streaming("Nope"), Err(Error::UnknownCamera(_))));
        assert!(matches!(
            orch.stop_recording("LCamera"),
            Err(Error::Record(RecordError::NotRecording(_)))
        ));
    }

    #[test]
    fn test_stereo_shot_missing_camera() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(SimulatedBackend::with_cameras(&["LCamera"]));
        let mut orch = orchestrator(config(dir.path()), backend);
        orch.check_cameras();
        wait_for_frames(&orch, "LCamera");

        assert!(matches!(
            orch.stereo_shot(),
            Err(Error::Snapshot(SnapshotError::MissingCameraPair(name))) if name == "RCamera"
        ));
        assert!(!dir.path().join("stereo").exists());
    }

    #[test]
    fn test_stereo_shot_same_camera_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.cameras.stereo_right = "LCamera".into();
        let backend = Arc::new(SimulatedBackend::with_cameras(&["LCamera", "RCamera"]));
        let mut orch = orchestrator(config, backend);
        orch.check_cameras();
        wait_for_frames(&orch, "LCamera");

        assert!(matches!(
            orch.stereo_shot(),
            Err(Error::Snapshot(SnapshotError::MissingCameraPair(name))) if name == "LCamera"
        ));
        // the producer still gets at its slots
        let before = orch.status()[0].frames_captured;
        let end = Instant::now() + Duration::from_secs(3);
        while orch.status()[0].frames_captured == before {
            assert!(Instant::now() < end, "capture stalled");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_stereo_shot_writes_pair() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(SimulatedBackend::with_cameras(&["LCamera", "RCamera"]));
        let mut orch = orchestrator(config(dir.path()), backend);
        orch.check_cameras();
        wait_for_frames(&orch, "LCamera");
        wait_for_frames(&orch, "RCamera");

        let paths = orch.stereo_shot().unwrap();
        // the inline pool has written both files already
        assert!(paths.left.exists() && paths.right.exists());
        assert!(paths.left.to_string_lossy().contains("/L/LCamera_"));
        let events = orch.poll(Duration::from_millis(10));
        assert!(events.iter().any(|e| matches!(e, PipelineEvent::SnapshotSaved { .. })));
    }

    #[test]
    fn test_overlay_recording_starts_compositor() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.recording.mode = RecordMode::Both;
        let backend = Arc::new(SimulatedBackend::with_cameras(&["LCamera"]));
        let mut orch = orchestrator(config, backend);
        orch.check_cameras();

        orch.start_recording("LCamera", 5, 0).unwrap();
        assert!(orch.slots("LCamera").unwrap().overlay_active());
        orch.stop_recording("LCamera").unwrap();
        assert!(!orch.slots("LCamera").unwrap().overlay_active());
    }

    #[test]
    fn test_unplug_stops_all_and_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(SimulatedBackend::with_cameras(&["LCamera", "RCamera"]));
        let mut orch = orchestrator(config(dir.path()), backend.clone());
        orch.check_cameras();
        wait_for_frames(&orch, "LCamera");

        backend.unplug("RCamera");
        poll_until(&mut orch, Duration::from_secs(3), |e| {
            matches!(e, PipelineEvent::CaptureFailed { unplugged: true, .. })
        });
        assert!(!orch.is_shut_down());

        backend.plug(SimulatedDevice::new("RCamera"));
        poll_until(&mut orch, Duration::from_secs(3), |e| *e == PipelineEvent::ReconnectComplete);
        assert_eq!(orch.camera_names(), vec!["LCamera", "RCamera"]);
        assert!(orch
            .status()
            .iter()
            .all(|s| s.producer == ProducerState::Grabbing));
    }

    #[test]
    fn test_unplug_handled_with_full_event_channel() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(SimulatedBackend::with_cameras(&["LCamera", "RCamera"]));
        let mut orch = orchestrator(config(dir.path()), backend);
        orch.check_cameras();

        let events = orch.events();
        for i in 0..EVENT_CHANNEL_CAPACITY {
            events.publish(PipelineEvent::Warning {
                component: Component::Telemetry,
                message: format!("noise {i}"),
            });
        }
        events.publish(PipelineEvent::CaptureFailed {
            camera: "RCamera".into(),
            unplugged: true,
            message: "device removed".into(),
        });

        let seen = orch.poll(Duration::from_millis(10));
        assert!(seen
            .iter()
            .any(|e| matches!(e, PipelineEvent::CaptureFailed { unplugged: true, .. })));
        assert!(orch.retry_pending());
        assert!(!orch.is_shut_down());
        assert!(orch
            .status()
            .iter()
            .all(|s| s.producer != ProducerState::Grabbing));
    }

    #[test]
    fn test_sensor_fault_is_system_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut faulty = SimulatedDevice::new("LCamera");
        faulty.faults.fail_after = Some(3);
        let backend = Arc::new(SimulatedBackend::new(vec![faulty, SimulatedDevice::new("RCamera")]));
        let mut orch = orchestrator(config(dir.path()), backend);
        orch.check_cameras();

        poll_until(&mut orch, Duration::from_secs(3), |e| matches!(e, PipelineEvent::Shutdown { .. }));
        assert!(orch.is_shut_down());
        assert!(orch
            .status()
            .iter()
            .all(|s| s.producer != ProducerState::Grabbing));
    }
}
