//! Segment retention: keep at most N segments per camera on disk

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use super::naming::{is_segment_of, segment_prefix};

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    modified: SystemTime,
    /// Registration order, breaks mtime ties
    seq: u64,
}

/// Age-ordered cache of one camera's segment files.
///
/// The recording root is scanned once, on first use; afterwards the cache is
/// only updated through `register` and the deletions done by `enforce`.
pub struct RetentionManager {
    root: PathBuf,
    prefix: String,
    limit: usize,
    cache: Option<Vec<Entry>>,
    next_seq: u64,
}

impl RetentionManager {
    pub fn new(root: impl Into<PathBuf>, camera: &str, limit: usize) -> Self {
        Self {
            root: root.into(),
            prefix: segment_prefix(camera),
            limit,
            cache: None,
            next_seq: 0,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// Deletion is disabled with a limit of 0
    pub fn is_disabled(&self) -> bool {
        self.limit == 0
    }

    /// Number of segments currently tracked
    pub fn len(&mut self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Track a freshly closed segment
    pub fn register(&mut self, path: &Path) {
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());
        if self.entries().iter().any(|e| e.path == path) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries().push(Entry {
            path: path.to_path_buf(),
            modified,
            seq,
        });
        self.sort();
    }

    /// Delete the oldest segments until at most `limit` remain. Returns the
    /// deleted paths.
    pub fn enforce(&mut self) -> Vec<PathBuf> {
        if self.is_disabled() {
            return Vec::new();
        }
        let limit = self.limit;
        let entries = self.entries();
        let excess = entries.len().saturating_sub(limit);
        let mut deleted = Vec::with_capacity(excess);

        for entry in entries.drain(..excess) {
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    info!(path = %entry.path.display(), "Deleted old segment");
                    deleted.push(entry.path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %entry.path.display(), "Segment already gone");
                }
                Err(e) => warn!(path = %entry.path.display(), error = %e, "Failed to delete segment"),
            }
        }
        if !deleted.is_empty() {
            metrics::counter!("chersonesos_segments_deleted").increment(deleted.len() as u64);
        }
        deleted
    }

    fn entries(&mut self) -> &mut Vec<Entry> {
        if self.cache.is_none() {
            let mut found = Vec::new();
            scan(&self.root, &self.prefix, &mut found);
            found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            let entries: Vec<Entry> = found
                .into_iter()
                .enumerate()
                .map(|(i, (path, modified))| Entry {
                    path,
                    modified,
                    seq: i as u64,
                })
                .collect();
            debug!(root = %self.root.display(), count = entries.len(), "Retention cache built");
            self.next_seq = entries.len() as u64;
            self.cache = Some(entries);
        }
        self.cache.get_or_insert_with(Vec::new)
    }

    fn sort(&mut self) {
        if let Some(entries) = self.cache.as_mut() {
            entries.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.seq.cmp(&b.seq)));
        }
    }
}

fn scan(dir: &Path, prefix: &str, out: &mut Vec<(PathBuf, SystemTime)>) {
    let Ok(read) = fs::read_dir(dir) else {
        return;
    };
    for entry in read.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            scan(&path, prefix, out);
        } else if is_segment_of(&path, prefix) {
            out.push((path, meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"segment").unwrap();
        path
    }

    /// Segment file name for `camera` stamped `i` seconds past midnight
    fn segment(camera: &str, i: u32) -> String {
        format!("chersonesos_{camera}_20240101_0000{i:02}.avi")
    }

    #[test]
    fn test_keeps_newest_k() {
        let dir = tempfile::tempdir().unwrap();
        let mut retention = RetentionManager::new(dir.path(), "LCamera", 2);
        let paths: Vec<_> = (0..5)
            .map(|i| touch(dir.path(), &segment("LCamera", i)))
            .collect();

        // the first register triggers the scan, which already finds all five
        retention.register(&paths[4]);
        assert_eq!(retention.len(), 5);
        let deleted = retention.enforce();
        assert_eq!(deleted.len(), 3);
        assert_eq!(retention.len(), 2);

        let remaining: Vec<_> = paths.iter().filter(|p| p.exists()).collect();
        assert_eq!(remaining.len(), 2);
        assert!(paths[4].exists());
    }

    #[test]
    fn test_incremental_registration_order() {
        let dir = tempfile::tempdir().unwrap();
        let session = dir.path().join("07032024").join("LCamera_090000");
        fs::create_dir_all(&session).unwrap();
        let mut retention = RetentionManager::new(dir.path(), "LCamera", 2);
        assert!(retention.is_empty());

        let mut written = Vec::new();
        for i in 0..4 {
            let path = touch(&session, &segment("LCamera", i));
            retention.register(&path);
            retention.enforce();
            written.push(path);
        }
        assert!(!written[0].exists());
        assert!(!written[1].exists());
        assert!(written[2].exists() && written[3].exists());
    }

    #[test]
    fn test_other_cameras_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let other = touch(dir.path(), &segment("RCamera", 0));
        let unrelated = touch(dir.path(), "notes.txt");
        let mut retention = RetentionManager::new(dir.path(), "LCamera", 1);
        let a = touch(dir.path(), &segment("LCamera", 0));
        let b = touch(dir.path(), &segment("LCamera", 1));
        retention.register(&a);
        retention.register(&b);
        retention.enforce();
        assert!(other.exists() && unrelated.exists());
        assert_eq!(retention.len(), 1);
    }

    #[test]
    fn test_prefix_sharing_camera_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let aux = touch(dir.path(), &segment("L_x", 0));
        let own = touch(dir.path(), &segment("L", 1));

        let mut retention = RetentionManager::new(dir.path(), "L", 1);
        retention.register(&own);
        assert_eq!(retention.len(), 1);
        assert!(retention.enforce().is_empty());
        assert!(aux.exists() && own.exists());

        let mut aux_retention = RetentionManager::new(dir.path(), "L_x", 1);
        assert_eq!(aux_retention.len(), 1);
    }

    #[test]
    fn test_zero_limit_disables_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let mut retention = RetentionManager::new(dir.path(), "LCamera", 0);
        for i in 0..3 {
            let path = touch(dir.path(), &segment("LCamera", i));
            retention.register(&path);
        }
        assert!(retention.is_disabled());
        assert!(retention.enforce().is_empty());
        assert_eq!(retention.len(), 3);
    }
}
