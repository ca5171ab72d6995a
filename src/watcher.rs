//! Filesystem event source
//!
//! Reports files that were closed after writing, moved into the watched
//! directory, or linked there. Plain creations are skipped so a file is
//! never announced before it is complete.

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use crate::error::{MoveError, Result};
use crate::logging::log_with_tag;

/// Keeps the underlying watch alive; dropping it ends the events
pub struct DirWatcher {
    directory: PathBuf,
    _inner: RecommendedWatcher,
}

fn is_complete(event: &Event) -> bool {
    match event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => true,
        EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
            event.paths.iter().any(|p| is_link(p))
        }
        _ => false,
    }
}

/// Symlinks and hard links are complete as soon as they appear
fn is_link(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(meta) => meta.file_type().is_symlink() || (meta.is_file() && meta.nlink() > 1),
        Err(_) => false,
    }
}

impl DirWatcher {
    /// Starts watching `directory`; complete files are sent to `out`
    pub fn start(directory: &Path, out: Sender<PathBuf>, tag: &str) -> Result<Self> {
        let tag = tag.to_string();
        let mut inner = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_complete(&event) => {
                for path in event.paths {
                    let _ = out.send(path);
                }
            }
            Ok(_) => {}
            Err(e) => {
                let _ = log_with_tag(&format!("Watch error: {}", e), Some(&tag));
            }
        })
        .map_err(|e| MoveError::Config(format!("cannot create watcher: {}", e)))?;

        inner
            .watch(directory, RecursiveMode::NonRecursive)
            .map_err(|e| MoveError::Config(format!("cannot watch {}: {}", directory.display(), e)))?;

        Ok(DirWatcher {
            directory: directory.to_path_buf(),
            _inner: inner,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Regular files already present in `directory`, oldest first
pub fn backlog(directory: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(directory) else {
        return Vec::new();
    };
    let mut files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some((meta.modified().ok(), e.path()))
        })
        .collect();
    files.sort();
    files.into_iter().map(|(_, p)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_reports_written_file() {
        let dir = tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let _watcher = DirWatcher::start(dir.path(), tx, "test").unwrap();

        let path = dir.path().join("test1.txt");
        fs::write(&path, b"content").unwrap();

        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got.file_name(), path.file_name());
    }

    #[test]
    fn test_reports_moved_in_file() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let staged = outside.path().join("moved.txt");
        fs::write(&staged, b"x").unwrap();

        let (tx, rx) = mpsc::channel();
        let _watcher = DirWatcher::start(dir.path(), tx, "test").unwrap();
        fs::rename(&staged, dir.path().join("moved.txt")).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got.file_name().unwrap(), "moved.txt");
    }

    #[test]
    fn test_hard_link_counts_as_complete() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("a");
        fs::write(&original, b"1").unwrap();
        assert!(!is_link(&original));
        fs::hard_link(&original, dir.path().join("b")).unwrap();
        assert!(is_link(&dir.path().join("b")));
    }

    #[test]
    fn test_backlog_lists_files_only() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), b"1").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let files = backlog(dir.path());
        assert_eq!(files, vec![dir.path().join("a")]);
        assert!(backlog(Path::new("/nonexistent/dir")).is_empty());
    }
}
