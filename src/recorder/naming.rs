//! Session directory and segment file naming

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// Every segment file name starts with this
pub const SEGMENT_PREFIX: &str = "chersonesos_";
pub const SEGMENT_EXTENSION: &str = "avi";

const MAX_NAME_LEN: usize = 64;
const FALLBACK_NAME: &str = "camera";

/// Make `name` safe to use as a single path component
pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed: String = replaced
        .trim_matches(|c| c == '_' || c == '.')
        .chars()
        .take(MAX_NAME_LEN)
        .collect();

    if trimmed.chars().any(char::is_alphanumeric) {
        trimmed
    } else {
        FALLBACK_NAME.to_string()
    }
}

/// `<root>/DDMMYYYY/<camera>_HHMMSS`
pub fn session_dir(root: &Path, camera: &str, now: DateTime<Local>) -> PathBuf {
    root.join(now.format("%d%m%Y").to_string()).join(format!(
        "{}_{}",
        sanitize_file_name(camera),
        now.format("%H%M%S")
    ))
}

/// Prefix shared by all segments of one camera, used by retention
pub fn segment_prefix(camera: &str) -> String {
    format!("{SEGMENT_PREFIX}{}_", sanitize_file_name(camera))
}

/// `chersonesos_<camera>_<YYYYMMDD_HHMMSS>[_overlay].avi`
pub fn segment_file_name(camera: &str, now: DateTime<Local>, overlay: bool) -> String {
    format!(
        "{}{}{}.{SEGMENT_EXTENSION}",
        segment_prefix(camera),
        now.format("%Y%m%d_%H%M%S"),
        if overlay { "_overlay" } else { "" }
    )
}

/// `dir/name`, or `dir/<stem>_<n>.<ext>` with the first free `n` if taken
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{ext}")),
        None => (name, String::new()),
    };
    (1u32..)
        .map(|n| dir.join(format!("{stem}_{n}{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Whether `path` names a segment of the camera with `prefix`: the prefix
/// followed by exactly `YYYYMMDD_HHMMSS[_overlay][_n].avi`
pub fn is_segment_of(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix(prefix))
        .and_then(|n| n.strip_suffix(&format!(".{SEGMENT_EXTENSION}")))
        .is_some_and(is_segment_stamp)
}

fn is_segment_stamp(rest: &str) -> bool {
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let (Some(date), Some(time), Some(tail)) = (rest.get(..8), rest.get(9..15), rest.get(15..)) else {
        return false;
    };
    if !digits(date) || rest.as_bytes()[8] != b'_' || !digits(time) {
        return false;
    }
    let tail = tail.strip_prefix("_overlay").unwrap_or(tail);
    tail.is_empty() || tail.strip_prefix('_').is_some_and(digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sanitize_replaces_illegal() {
        let name = sanitize_file_name("LCamera Left:Test");
        assert!(!name.is_empty());
        assert!(!name.contains(['/', '\\', ':', '*', '?', '"', '<', '>', '|', ' ']));
        assert_eq!(name, "LCamera_Left_Test");
    }

    #[test]
    fn test_sanitize_fallback_and_cap() {
        assert_eq!(sanitize_file_name("/:*?<>|"), "camera");
        assert_eq!(sanitize_file_name("  ..  "), "camera");
        assert_eq!(sanitize_file_name(""), "camera");
        assert_eq!(sanitize_file_name(&"x".repeat(100)).len(), 64);
        assert_eq!(sanitize_file_name("_.cam._"), "cam");
    }

    #[test]
    fn test_paths() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        let dir = session_dir(Path::new("video"), "LCamera", now);
        assert_eq!(dir, Path::new("video/07032024/LCamera_090502"));
        assert_eq!(
            segment_file_name("LCamera", now, false),
            "chersonesos_LCamera_20240307_090502.avi"
        );
        assert_eq!(
            segment_file_name("LCamera", now, true),
            "chersonesos_LCamera_20240307_090502_overlay.avi"
        );
    }

    #[test]
    fn test_segment_ownership() {
        let prefix = segment_prefix("LCamera");
        for owned in [
            "chersonesos_LCamera_20240307_090502.avi",
            "chersonesos_LCamera_20240307_090502_overlay.avi",
            "chersonesos_LCamera_20240307_090502_3.avi",
            "chersonesos_LCamera_20240307_090502_overlay_12.avi",
        ] {
            assert!(is_segment_of(&Path::new("a").join(owned), &prefix), "{owned}");
        }
        for foreign in [
            "chersonesos_RCamera_20240307_090502.avi",
            "chersonesos_LCamera_Aux_20240307_090502.avi",
            "chersonesos_LCamera_20240307_090502.png",
            "chersonesos_LCamera_2024030_0905021.avi",
            "chersonesos_LCamera_20240307_090502_.avi",
            "chersonesos_LCamera_x.avi",
        ] {
            assert!(!is_segment_of(&Path::new("a").join(foreign), &prefix), "{foreign}");
        }
    }

    #[test]
    fn test_unique_path_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_path(dir.path(), "seg.avi");
        std::fs::write(&first, b"").unwrap();
        let second = unique_path(dir.path(), "seg.avi");
        assert_eq!(second, dir.path().join("seg_1.avi"));
    }
}
