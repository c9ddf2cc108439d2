//! Stereo still pairs
//!
//! A shot takes the current front frame of the left and right cameras while
//! holding both slot locks, then writes the pair as PNG files:
//! `<root>/DDMMYYYY/{L,R}/<camera>_YYYYMMDD_HHMMSS.png`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use image::ImageFormat;
use tracing::{debug, info, instrument, warn};

use crate::capture::Frame;
use crate::error::SnapshotError;
use crate::pipeline::CameraSlots;
use crate::recorder::naming::sanitize_file_name;

/// Destination of one stereo pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StereoPaths {
    pub left: PathBuf,
    pub right: PathBuf,
}

pub fn stereo_paths(root: &Path, now: DateTime<Local>, left: &str, right: &str) -> StereoPaths {
    let day = root.join(now.format("%d%m%Y").to_string());
    let stamp = now.format("%Y%m%d_%H%M%S");
    StereoPaths {
        left: day.join("L").join(format!("{}_{stamp}.png", sanitize_file_name(left))),
        right: day.join("R").join(format!("{}_{stamp}.png", sanitize_file_name(right))),
    }
}

/// Take the front frames of both cameras at once.
///
/// Locks are always taken in name order, whichever side asks first, so two
/// concurrent shots cannot deadlock. Both sides must name distinct cameras.
pub fn grab_pair(
    left: (&str, Option<&CameraSlots>),
    right: (&str, Option<&CameraSlots>),
) -> Result<(Frame, Frame), SnapshotError> {
    let (left_name, left_slots) = left;
    let (right_name, right_slots) = right;
    // the slot locks are not reentrant
    if left_name == right_name {
        return Err(SnapshotError::MissingCameraPair(right_name.to_string()));
    }
    let left_slots = left_slots.ok_or_else(|| SnapshotError::MissingCameraPair(left_name.to_string()))?;
    let right_slots = right_slots.ok_or_else(|| SnapshotError::MissingCameraPair(right_name.to_string()))?;

    let (left_frame, right_frame) = if left_name <= right_name {
        let l = left_slots.display.lock_front();
        let r = right_slots.display.lock_front();
        (l.clone(), r.clone())
    } else {
        let r = right_slots.display.lock_front();
        let l = left_slots.display.lock_front();
        (l.clone(), r.clone())
    };

    let left_frame = left_frame.ok_or_else(|| SnapshotError::EmptyFrame(left_name.to_string()))?;
    let right_frame = right_frame.ok_or_else(|| SnapshotError::EmptyFrame(right_name.to_string()))?;
    Ok((left_frame, right_frame))
}

/// Write both images. A failure on the right side removes the left file so
/// no half pair is left behind.
#[instrument(skip_all, fields(left = %paths.left.display()))]
pub fn write_stereo_pair(paths: &StereoPaths, left: &Frame, right: &Frame) -> Result<(), SnapshotError> {
    for path in [&paths.left, &paths.right] {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| SnapshotError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }
    }

    left.image.save_with_format(&paths.left, ImageFormat::Png)?;
    if let Err(e) = right.image.save_with_format(&paths.right, ImageFormat::Png) {
        if let Err(cleanup) = fs::remove_file(&paths.left) {
            warn!(error = %cleanup, "Failed to remove orphaned left image");
        }
        return Err(e.into());
    }

    debug!(right = %paths.right.display(), "Stereo pair written");
    info!(
        left_seq = left.meta.sequence,
        right_seq = right.meta.sequence,
        "Stereo snapshot saved"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::test_frame;
    use chrono::TimeZone;

    #[test]
    fn test_paths_layout() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 14, 30, 9).unwrap();
        let paths = stereo_paths(Path::new("stereo"), now, "LCamera", "RCamera");
        assert_eq!(paths.left, Path::new("stereo/07032024/L/LCamera_20240307_143009.png"));
        assert_eq!(paths.right, Path::new("stereo/07032024/R/RCamera_20240307_143009.png"));
    }

    #[test]
    fn test_missing_and_empty() {
        let left = CameraSlots::new(3);
        let right = CameraSlots::new(3);
        assert!(matches!(
            grab_pair(("LCamera", Some(&left)), ("RCamera", None)),
            Err(SnapshotError::MissingCameraPair(name)) if name == "RCamera"
        ));

        left.publish(test_frame(1, 8, 8));
        assert!(matches!(
            grab_pair(("LCamera", Some(&left)), ("RCamera", Some(&right))),
            Err(SnapshotError::EmptyFrame(name)) if name == "RCamera"
        ));

        right.publish(test_frame(7, 8, 8));
        let (l, r) = grab_pair(("LCamera", Some(&left)), ("RCamera", Some(&right))).unwrap();
        assert_eq!((l.meta.sequence, r.meta.sequence), (1, 7));
    }

    #[test]
    fn test_same_camera_on_both_sides() {
        let slots = CameraSlots::new(3);
        slots.publish(test_frame(1, 8, 8));
        assert!(matches!(
            grab_pair(("LCamera", Some(&slots)), ("LCamera", Some(&slots))),
            Err(SnapshotError::MissingCameraPair(name)) if name == "LCamera"
        ));
        // the display slot is still usable afterwards
        assert_eq!(slots.display.read().map(|f| f.meta.sequence), Some(1));
    }

    #[test]
    fn test_write_pair() {
        let dir = tempfile::tempdir().unwrap();
        let now = Local::now();
        let paths = stereo_paths(dir.path(), now, "LCamera", "RCamera");
        write_stereo_pair(&paths, &test_frame(1, 12, 10), &test_frame(2, 12, 10)).unwrap();

        let left = image::open(&paths.left).unwrap();
        assert_eq!((left.width(), left.height()), (12, 10));
        assert!(paths.right.exists());
    }
}
