//! Per-session working directories.
//!
//! Every session runs inside `<results_root>/<YYYYMMDD>_<session_id>`. The
//! directory is wiped at the start of each run, then re-linked to the
//! shared data store as `data` and `save_folder`. All paths are handed
//! around absolute; neither setup nor the agent ever changes the process
//! working directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use workbench_error::WorkbenchError;

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    results_root: PathBuf,
    data_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(results_root: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_root: results_root.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Creates the shared data store scaffold (`<data_dir>/save_folder`)
    /// if it is not there yet.
    pub fn ensure_shared_store(&self) -> io::Result<()> {
        fs::create_dir_all(self.data_dir.join("save_folder"))
    }

    /// Directory a session's runs execute in. Deterministic for a given
    /// session within one day.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        let date = chrono::Local::now().format("%Y%m%d");
        self.results_root.join(format!("{date}_{session_id}"))
    }

    /// Prepares a clean working directory for a run and returns the guard
    /// that marks the claim released once the run is over.
    ///
    /// A pre-existing directory is emptied entry by entry, never following
    /// symlinks, so shared data behind a link is never deleted through it.
    /// Missing link targets or failing links only degrade the workspace:
    /// the run proceeds without them.
    pub fn setup(&self, session_id: &str) -> Result<WorkspaceGuard, WorkbenchError> {
        let dir = self.session_dir(session_id);
        if dir.is_dir() {
            clear_dir(&dir).map_err(|err| WorkbenchError::Workspace {
                message: format!("wipe {}: {err}", dir.display()),
            })?;
        } else {
            fs::create_dir_all(&dir).map_err(|err| WorkbenchError::Workspace {
                message: format!("create {}: {err}", dir.display()),
            })?;
        }

        match fs::canonicalize(&self.data_dir) {
            Ok(shared) => {
                link_into(&dir, "data", &shared);
                link_into(&dir, "save_folder", &shared.join("save_folder"));
            }
            Err(err) => {
                tracing::warn!(
                    data_dir = %self.data_dir.display(),
                    error = %err,
                    "shared data store unavailable, workspace links skipped"
                );
            }
        }

        Ok(WorkspaceGuard {
            session_dir: dir,
            released: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Removes everything inside `dir` without following symlinks.
fn clear_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_symlink() {
            remove_symlink(&path)?;
        } else if file_type.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn remove_symlink(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

#[cfg(windows)]
fn remove_symlink(path: &Path) -> io::Result<()> {
    fs::remove_dir(path).or_else(|_| fs::remove_file(path))
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Links `dir/name` at `target`. An existing entry of that name wins, and
/// a failed link is logged and skipped.
fn link_into(dir: &Path, name: &str, target: &Path) {
    let link = dir.join(name);
    if link.symlink_metadata().is_ok() {
        tracing::debug!(link = %link.display(), "workspace entry already present, leaving it");
        return;
    }
    if !target.exists() {
        tracing::warn!(target = %target.display(), "link target missing, skipping");
        return;
    }
    if let Err(err) = make_symlink(target, &link) {
        tracing::warn!(
            link = %link.display(),
            error = %err,
            "workspace link failed, continuing without it"
        );
    }
}

/// A run's claim on its working directory.
///
/// Released explicitly at the end of a normal run, or by `Drop` when the
/// driving task unwinds first; the swap makes it happen exactly once on
/// every exit path.
#[derive(Debug)]
pub struct WorkspaceGuard {
    session_dir: PathBuf,
    released: Arc<AtomicBool>,
}

impl WorkspaceGuard {
    pub fn dir(&self) -> &Path {
        &self.session_dir
    }

    /// Shared flag observers can poll to tell whether teardown happened.
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }

    pub fn release(self) {
        self.finish();
    }

    fn finish(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            tracing::debug!(dir = %self.session_dir.display(), "workspace released");
        }
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &Path) -> WorkspaceManager {
        WorkspaceManager::new(root.join("results"), root.join("data"))
    }

    #[test]
    fn setup_creates_directory_and_links() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manager = manager(tmp.path());
        manager.ensure_shared_store().expect("shared store");
        fs::write(tmp.path().join("data/catalog.csv"), "a,b\n").expect("seed data");

        let cwd_before = std::env::current_dir().expect("cwd");
        let guard = manager.setup("alpha").expect("setup");
        assert!(guard.dir().is_dir());
        assert_eq!(std::env::current_dir().expect("cwd"), cwd_before);

        let data_link = guard.dir().join("data");
        assert!(data_link.symlink_metadata().expect("link meta").file_type().is_symlink());
        assert!(data_link.join("catalog.csv").exists());
        assert!(guard.dir().join("save_folder").symlink_metadata().is_ok());
    }

    #[test]
    fn reuse_wipes_stale_entries_but_not_linked_data() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manager = manager(tmp.path());
        manager.ensure_shared_store().expect("shared store");
        fs::write(tmp.path().join("data/keep.csv"), "x").expect("seed data");

        let first = manager.setup("alpha").expect("first setup");
        fs::write(first.dir().join("stale.txt"), "old").expect("stale file");
        fs::create_dir_all(first.dir().join("old_dir")).expect("stale dir");
        let dir = first.dir().to_path_buf();
        first.release();

        let second = manager.setup("alpha").expect("second setup");
        assert_eq!(second.dir(), dir.as_path());
        assert!(!dir.join("stale.txt").exists());
        assert!(!dir.join("old_dir").exists());
        // The wipe removed the link itself, not what it pointed at.
        assert!(tmp.path().join("data/keep.csv").exists());
        assert!(dir.join("data").join("keep.csv").exists());
    }

    #[test]
    fn missing_shared_store_degrades_to_no_links() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manager = manager(tmp.path());

        let guard = manager.setup("alpha").expect("setup");
        assert!(guard.dir().is_dir());
        assert!(guard.dir().join("data").symlink_metadata().is_err());
    }

    #[test]
    fn guard_releases_exactly_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manager = manager(tmp.path());
        manager.ensure_shared_store().expect("shared store");

        let guard = manager.setup("alpha").expect("setup");
        let flag = guard.released_flag();
        assert!(!flag.load(Ordering::SeqCst));
        guard.release();
        assert!(flag.load(Ordering::SeqCst));

        let dropped = manager.setup("beta").expect("setup");
        let flag = dropped.released_flag();
        drop(dropped);
        assert!(flag.load(Ordering::SeqCst));
    }
}
