//! Segmented MJPEG/AVI recording with retention

pub mod avi;
pub mod naming;
pub mod retention;
pub mod session;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

pub use naming::sanitize_file_name;
pub use retention::RetentionManager;
pub use session::{ClosedSegment, RecordingSession, SegmentPolicy};

use crate::error::RecordError;
use crate::events::{Component, EventSender, PipelineEvent};
use crate::pipeline::CameraSlots;
use crate::utils::{BackgroundPool, StopFlag, Worker, DEFAULT_JOIN_TIMEOUT};
use crate::RecordingConfig;

/// Poll interval while the record queue is empty
const QUEUE_POLL: Duration = Duration::from_millis(5);

/// What goes into the segment files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordMode {
    /// Camera frames as captured
    #[default]
    Raw,
    /// Frames with the HUD composited
    Overlay,
    /// Raw and composited segments side by side
    Both,
}

impl RecordMode {
    pub fn needs_overlay(self) -> bool {
        matches!(self, RecordMode::Overlay | RecordMode::Both)
    }
}

/// Per-call recording parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordOptions {
    pub interval_secs: u64,
    /// Segments kept per camera, 0 keeps everything
    pub files_limit: usize,
    pub mode: RecordMode,
}

impl RecordOptions {
    pub fn from_config(config: &RecordingConfig) -> Self {
        Self {
            interval_secs: config.interval_secs,
            files_limit: config.stored_files_limit,
            mode: config.mode,
        }
    }
}

/// Records one camera's frames into rotating segments
pub struct VideoRecorder {
    camera: String,
    slots: Arc<CameraSlots>,
    config: RecordingConfig,
    events: EventSender,
    pool: BackgroundPool,
    retention: Arc<Mutex<RetentionManager>>,
    worker: Option<Worker>,
    session_dir: Option<PathBuf>,
}

impl VideoRecorder {
    pub fn new(
        camera: &str,
        slots: Arc<CameraSlots>,
        config: RecordingConfig,
        events: EventSender,
        pool: BackgroundPool,
    ) -> Self {
        let retention = RetentionManager::new(&config.root, camera, config.stored_files_limit);
        Self {
            camera: camera.to_string(),
            slots,
            config,
            events,
            pool,
            retention: Arc::new(Mutex::new(retention)),
            worker: None,
            session_dir: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Directory of the current (or last) session
    pub fn session_dir(&self) -> Option<&PathBuf> {
        self.session_dir.as_ref()
    }

    /// Create the session directory and start the record worker. Overlay
    /// modes need the overlay compositor to be running already.
    #[instrument(skip(self), fields(camera = %self.camera))]
    pub fn start_recording(&mut self, options: RecordOptions) -> Result<PathBuf, RecordError> {
        if self.is_recording() {
            return Err(RecordError::AlreadyRecording(self.camera.clone()));
        }
        // A worker that died on an error is reaped here
        if let Some(mut stale) = self.worker.take() {
            stale.stop(DEFAULT_JOIN_TIMEOUT);
        }
        if options.mode.needs_overlay() && !self.slots.overlay_active() {
            return Err(RecordError::OverlayUnavailable(self.camera.clone()));
        }

        let dir = naming::session_dir(&self.config.root, &self.camera, Local::now());
        let created = NewDirs::before_create(&dir);
        fs::create_dir_all(&dir).map_err(|source| RecordError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        let probe = dir.join(".write_probe");
        if fs::write(&probe, b"").and_then(|_| fs::remove_file(&probe)).is_err() {
            created.remove();
            return Err(RecordError::PermissionDenied(dir));
        }

        {
            let mut retention = self.retention.lock();
            retention.set_limit(options.files_limit);
            if retention.is_disabled() {
                self.events.warning(
                    Component::Recorder,
                    format!("{}: stored files limit is 0, old segments are never deleted", self.camera),
                );
            }
        }

        let policy = SegmentPolicy::new(options.interval_secs, self.config.real_fps);
        let mut session = RecordingSession::new(
            &self.camera,
            dir.clone(),
            options.mode,
            policy,
            self.config.real_fps,
            self.config.jpeg_quality,
        );
        if let Some(latest) = self.slots.record.read() {
            if let Err(e) = session.begin(latest.dimensions(), Instant::now()) {
                created.remove();
                return Err(e);
            }
        }
        let record = RecordLoop {
            camera: self.camera.clone(),
            session,
            mode: options.mode,
            slots: self.slots.clone(),
            events: self.events.clone(),
            pool: self.pool.clone(),
            retention: self.retention.clone(),
        };

        self.slots.set_recording(true);
        let worker = Worker::spawn(format!("record-{}", self.camera), move |stop| record.run(stop))
            .map_err(|e| {
                self.slots.set_recording(false);
                created.remove();
                RecordError::Io(e)
            })?;
        self.worker = Some(worker);
        self.session_dir = Some(dir.clone());

        info!(
            session = %dir.display(),
            frame_limit = policy.frame_limit,
            time_limit = ?policy.time_limit,
            mode = ?options.mode,
            "Recording started"
        );
        self.events.publish(PipelineEvent::RecordingStarted {
            camera: self.camera.clone(),
            session: dir.clone(),
        });
        Ok(dir)
    }

    /// Stop the worker (closing open segments) and apply retention before
    /// returning.
    #[instrument(skip(self), fields(camera = %self.camera))]
    pub fn stop_recording(&mut self) -> Result<(), RecordError> {
        let Some(mut worker) = self.worker.take() else {
            return Err(RecordError::NotRecording(self.camera.clone()));
        };
        worker.stop(DEFAULT_JOIN_TIMEOUT);
        self.slots.set_recording(false);

        let deleted = self.retention.lock().enforce();
        debug!(deleted = deleted.len(), "Retention flushed");

        info!("Recording stopped");
        self.events.publish(PipelineEvent::RecordingStopped {
            camera: self.camera.clone(),
        });
        Ok(())
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop_recording() {
                warn!(camera = %self.camera, error = %e, "Stopping recorder on drop failed");
            }
        }
    }
}

/// Session and day directories that did not exist before `start_recording`,
/// removed again when the start fails
struct NewDirs {
    session: Option<PathBuf>,
    day: Option<PathBuf>,
}

impl NewDirs {
    fn before_create(session: &Path) -> Self {
        let day = session.parent().filter(|d| !d.exists()).map(Path::to_path_buf);
        let session = (!session.exists()).then(|| session.to_path_buf());
        Self { session, day }
    }

    fn remove(&self) {
        if let Some(session) = &self.session {
            if let Err(e) = fs::remove_dir_all(session) {
                warn!(dir = %session.display(), error = %e, "Failed to remove abandoned session directory");
            }
        }
        if let Some(day) = &self.day {
            // only if nothing else landed there meanwhile
            let _ = fs::remove_dir(day);
        }
    }
}

struct RecordLoop {
    camera: String,
    session: RecordingSession,
    mode: RecordMode,
    slots: Arc<CameraSlots>,
    events: EventSender,
    pool: BackgroundPool,
    retention: Arc<Mutex<RetentionManager>>,
}

impl RecordLoop {
    #[instrument(skip_all, fields(camera = %self.camera))]
    fn run(mut self, stop: StopFlag) {
        while !stop.is_set() {
            let result = match self.slots.record_queue.pop() {
                Some(frame) => {
                    // Pairing with the composited frame is best effort
                    let overlay = if self.mode.needs_overlay() {
                        self.slots.overlay.overlay.pop()
                    } else {
                        None
                    };
                    self.session.write(&frame, overlay.as_ref(), Instant::now())
                }
                None => {
                    let closed = self.session.tick(Instant::now());
                    stop.sleep(QUEUE_POLL);
                    closed
                }
            };
            match result {
                Ok(closed) => self.on_closed(closed),
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }

        match self.session.finish() {
            Ok(closed) => self.on_closed(closed),
            Err(e) => self.fail(e),
        }
        debug!(frames = self.session.frames(), segments = self.session.segments(), "Record loop finished");
    }

    fn on_closed(&self, closed: Vec<ClosedSegment>) {
        if closed.is_empty() {
            return;
        }
        {
            let mut retention = self.retention.lock();
            for segment in &closed {
                retention.register(&segment.path);
            }
        }
        for segment in closed {
            self.events.publish(PipelineEvent::SegmentClosed {
                camera: self.camera.clone(),
                path: segment.path,
                frames: segment.frames,
            });
        }
        let retention = self.retention.clone();
        self.pool.spawn(move || {
            retention.lock().enforce();
        });
    }

    fn fail(&mut self, e: RecordError) {
        error!(error = %e, "Recording failed");
        // Keep what was written so far
        if let Ok(closed) = self.session.finish() {
            self.on_closed(closed);
        }
        self.slots.set_recording(false);
        self.events.publish(PipelineEvent::RecordingFailed {
            camera: self.camera.clone(),
            message: e.to_string(),
        });
        self.events.error(Component::Recorder, format!("{}: {e}", self.camera));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::test_frame;
    use crate::events;
    use std::thread;

    fn recorder(root: &std::path::Path) -> (VideoRecorder, Arc<CameraSlots>, flume::Receiver<PipelineEvent>) {
        let slots = Arc::new(CameraSlots::new(3));
        let (tx, rx) = events::channel(256);
        let config = RecordingConfig {
            root: root.to_path_buf(),
            ..RecordingConfig::default()
        };
        let recorder = VideoRecorder::new("LCamera", slots.clone(), config, tx, BackgroundPool::inline());
        (recorder, slots, rx)
    }

    fn feed(slots: &CameraSlots, frames: u64) {
        for seq in 1..=frames {
            slots.publish(test_frame(seq, 32, 24));
            let deadline = Instant::now() + Duration::from_secs(2);
            while !slots.record_queue.is_empty() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn segments(root: &std::path::Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for day in fs::read_dir(root).unwrap().flatten() {
            for session in fs::read_dir(day.path()).unwrap().flatten() {
                for file in fs::read_dir(session.path()).unwrap().flatten() {
                    found.push(file.path());
                }
            }
        }
        found
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, _slots, _rx) = recorder(dir.path());
        let options = RecordOptions {
            interval_secs: 5,
            files_limit: 2,
            mode: RecordMode::Raw,
        };
        recorder.start_recording(options).unwrap();
        assert!(matches!(
            recorder.start_recording(options),
            Err(RecordError::AlreadyRecording(_))
        ));
        recorder.stop_recording().unwrap();
        assert!(matches!(recorder.stop_recording(), Err(RecordError::NotRecording(_))));
    }

    #[test]
    fn test_overlay_mode_needs_compositor() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, slots, _rx) = recorder(dir.path());
        let options = RecordOptions {
            interval_secs: 5,
            files_limit: 2,
            mode: RecordMode::Overlay,
        };
        assert!(matches!(
            recorder.start_recording(options),
            Err(RecordError::OverlayUnavailable(_))
        ));
        // no session directory was created
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        slots.set_overlay_active(true);
        recorder.start_recording(options).unwrap();
        recorder.stop_recording().unwrap();
    }

    #[test]
    fn test_records_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, slots, rx) = recorder(dir.path());
        let session = recorder
            .start_recording(RecordOptions {
                interval_secs: 1,
                files_limit: 0,
                mode: RecordMode::Raw,
            })
            .unwrap();
        assert!(session.starts_with(dir.path()));

        feed(&slots, 50);
        recorder.stop_recording().unwrap();

        let files = segments(dir.path());
        assert_eq!(files.len(), 3);
        let events: Vec<_> = rx.try_iter().collect();
        let frames: u64 = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::SegmentClosed { frames, .. } => Some(*frames),
                _ => None,
            })
            .sum();
        assert_eq!(frames, 50);
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Warning { component: Component::Recorder, .. })));
        assert!(matches!(events.last(), Some(PipelineEvent::RecordingStopped { .. })));
    }

    #[test]
    fn test_failed_first_segment_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut recorder, slots, _rx) = recorder(dir.path());
        // a zero-sized frame cannot open an AVI stream
        slots.publish(test_frame(1, 0, 0));
        let err = recorder
            .start_recording(RecordOptions {
                interval_secs: 5,
                files_limit: 2,
                mode: RecordMode::Raw,
            })
            .unwrap_err();
        assert!(matches!(err, RecordError::WriterOpen { .. }));
        assert!(!recorder.is_recording());
        assert!(!slots.is_recording());
        assert!(recorder.session_dir().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unwritable_root_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"").unwrap();
        let (mut recorder, slots, _rx) = recorder(&blocker);
        let err = recorder
            .start_recording(RecordOptions {
                interval_secs: 5,
                files_limit: 2,
                mode: RecordMode::Raw,
            })
            .unwrap_err();
        assert!(matches!(err, RecordError::CreateDir { .. }));
        assert!(!recorder.is_recording());
        assert!(!slots.is_recording());
    }
}
