//! Leader election via an exclusive lock file.
//!
//! When several processes run behind a load balancer, exactly one may run the
//! background workers; all of them serve API traffic. The winner of an
//! atomic create-new on a well-known path is the leader for its lifetime and
//! removes the file on clean shutdown. A file left behind by a crashed
//! leader is cleared at the next startup (its owner is presumed dead), after
//! which background work resumes with the next election.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Holds leadership while alive. Dropping releases the lock file.
pub struct LeaderLock {
    path: PathBuf,
}

impl LeaderLock {
    /// Remove a stale lock file from a previous run. Must be called once at
    /// startup, before any election attempt.
    pub fn clear_stale(path: &str) {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::info!("Removed stale leader lock file at {}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => tracing::warn!("Could not remove stale leader lock {}: {}", path, e),
        }
    }

    /// Try to become the leader. Returns None if another process already
    /// holds the lock.
    pub fn try_acquire(path: &str) -> Option<Self> {
        if let Some(parent) = Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        // create_new = O_CREAT | O_EXCL: exactly one process wins.
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let pid = std::process::id();
                if let Err(e) = write!(file, "{}", pid) {
                    tracing::warn!("Could not write pid to leader lock: {}", e);
                }
                tracing::info!("Process {} elected as leader ({})", pid, path);
                Some(Self { path: PathBuf::from(path) })
            },
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => None,
            Err(e) => {
                tracing::error!("Leader election failed at {}: {}", path, e);
                None
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicit release for graceful shutdown paths.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!("Released leader lock at {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted under a live leader: fatal for this leadership, but
                // nothing left to clean up.
                tracing::warn!("Leader lock at {} was already gone", self.path.display());
            },
            Err(e) => {
                tracing::warn!("Could not release leader lock {}: {}", self.path.display(), e)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_lock_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("newsroom-leader-test-{}-{}", name, std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_exactly_one_winner() {
        let path = temp_lock_path("single");
        LeaderLock::clear_stale(&path);

        let first = LeaderLock::try_acquire(&path);
        assert!(first.is_some());

        // Second contender loses while the first holds the lock.
        assert!(LeaderLock::try_acquire(&path).is_none());

        drop(first);

        // After release the lock can be won again.
        let second = LeaderLock::try_acquire(&path);
        assert!(second.is_some());
    }

    #[test]
    fn test_stale_file_cleared_before_election() {
        let path = temp_lock_path("stale");
        std::fs::write(&path, "99999").unwrap();

        LeaderLock::clear_stale(&path);
        let lock = LeaderLock::try_acquire(&path);
        assert!(lock.is_some());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }
}
