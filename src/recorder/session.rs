//! One recording session: segment rotation over a sequence of frames

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, info};

use super::avi::AviWriter;
use super::naming::{segment_file_name, unique_path};
use super::RecordMode;
use crate::capture::frame::encode_jpeg;
use crate::capture::Frame;
use crate::error::RecordError;

/// When to close the current segment: after `frame_limit` frames or once
/// `time_limit` has passed, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPolicy {
    pub frame_limit: u64,
    pub time_limit: Duration,
}

impl SegmentPolicy {
    pub fn new(interval_secs: u64, real_fps: f64) -> Self {
        let frame_limit = (interval_secs as f64 * real_fps).round().max(1.0) as u64;
        Self {
            frame_limit,
            time_limit: Duration::from_millis(interval_secs.max(1) * 1500),
        }
    }

    pub fn should_rotate(&self, frames: u64, elapsed: Duration) -> bool {
        frames >= self.frame_limit || elapsed >= self.time_limit
    }
}

/// A segment that has been finalized on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSegment {
    pub path: PathBuf,
    pub frames: u64,
}

struct OpenSegment {
    primary: AviWriter,
    /// Overlay variant in `Both` mode
    secondary: Option<AviWriter>,
    started: Instant,
    frames: u64,
}

/// Writes frames into rotating segment files under one session directory.
///
/// Segments are opened lazily on the first frame after a rotation, so an idle
/// session leaves no empty files behind. Time is passed in by the caller.
pub struct RecordingSession {
    camera: String,
    dir: PathBuf,
    mode: RecordMode,
    policy: SegmentPolicy,
    fps: f64,
    quality: u8,
    current: Option<OpenSegment>,
    segments: u64,
    frames: u64,
}

impl RecordingSession {
    pub fn new(camera: &str, dir: PathBuf, mode: RecordMode, policy: SegmentPolicy, fps: f64, quality: u8) -> Self {
        Self {
            camera: camera.to_string(),
            dir,
            mode,
            policy,
            fps,
            quality,
            current: None,
            segments: 0,
            frames: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> SegmentPolicy {
        self.policy
    }

    /// Frames written over the whole session
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Segments opened so far
    pub fn segments(&self) -> u64 {
        self.segments
    }

    /// Write one frame. `overlay` is the composited counterpart, if one was
    /// available; overlay modes fall back to the raw frame without it.
    pub fn write(&mut self, frame: &Frame, overlay: Option<&Frame>, now: Instant) -> Result<Vec<ClosedSegment>, RecordError> {
        let mut closed = self.tick(now)?;

        if self.current.is_none() {
            self.current = Some(self.open(frame.dimensions(), now)?);
        }
        let composited = overlay.unwrap_or(frame);
        let (primary, secondary) = match self.mode {
            RecordMode::Raw => (frame, None),
            RecordMode::Overlay => (composited, None),
            RecordMode::Both => (frame, Some(composited)),
        };

        let started = Instant::now();
        let jpeg = encode_jpeg(&primary.image, self.quality)?;
        let extra = secondary
            .map(|f| encode_jpeg(&f.image, self.quality))
            .transpose()?;
        metrics::histogram!("chersonesos_record_encode_seconds").record(started.elapsed().as_secs_f64());

        if let Some(segment) = self.current.as_mut() {
            segment.primary.write_frame(&jpeg)?;
            if let (Some(writer), Some(jpeg)) = (segment.secondary.as_mut(), extra.as_ref()) {
                writer.write_frame(jpeg)?;
            }
            segment.frames += 1;
            self.frames += 1;
            metrics::counter!("chersonesos_frames_recorded", "camera" => self.camera.clone()).increment(1);
        }

        if self
            .current
            .as_ref()
            .is_some_and(|s| self.policy.should_rotate(s.frames, now.saturating_duration_since(s.started)))
        {
            closed.extend(self.close()?);
        }
        Ok(closed)
    }

    /// Open the first segment before any frame arrives, so a writer that
    /// cannot be created fails the start of the recording.
    pub fn begin(&mut self, dimensions: (u32, u32), now: Instant) -> Result<(), RecordError> {
        if self.current.is_none() {
            self.current = Some(self.open(dimensions, now)?);
        }
        Ok(())
    }

    /// Close the open segment if its time limit has passed
    pub fn tick(&mut self, now: Instant) -> Result<Vec<ClosedSegment>, RecordError> {
        let expired = self
            .current
            .as_ref()
            .is_some_and(|s| now.saturating_duration_since(s.started) >= self.policy.time_limit);
        if expired {
            self.close()
        } else {
            Ok(Vec::new())
        }
    }

    /// Close whatever is open
    pub fn finish(&mut self) -> Result<Vec<ClosedSegment>, RecordError> {
        self.close()
    }

    fn open(&mut self, (width, height): (u32, u32), now: Instant) -> Result<OpenSegment, RecordError> {
        let stamp = Local::now();
        let create = |overlay: bool| {
            let path = unique_path(&self.dir, &segment_file_name(&self.camera, stamp, overlay));
            AviWriter::create(&path, width, height, self.fps)
                .map_err(|source| RecordError::WriterOpen { path, source })
        };

        let primary = create(self.mode == RecordMode::Overlay)?;
        let secondary = match self.mode {
            RecordMode::Both => Some(create(true)?),
            _ => None,
        };
        self.segments += 1;
        info!(camera = %self.camera, path = %primary.path().display(), "Segment started");
        Ok(OpenSegment {
            primary,
            secondary,
            started: now,
            frames: 0,
        })
    }

    fn close(&mut self) -> Result<Vec<ClosedSegment>, RecordError> {
        let Some(mut segment) = self.current.take() else {
            return Ok(Vec::new());
        };
        let mut closed = Vec::with_capacity(2);
        for writer in std::iter::once(&mut segment.primary).chain(segment.secondary.as_mut()) {
            let frames = writer.finish()?;
            closed.push(ClosedSegment {
                path: writer.path().to_path_buf(),
                frames,
            });
        }
        debug!(camera = %self.camera, frames = segment.frames, "Segment rotated");
        Ok(closed)
    }
}
