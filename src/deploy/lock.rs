// src/deploy/lock.rs

//! Per-component exclusive lock at a deployment target
//!
//! Repointing `current/<type>` and appending to the registry log must look
//! like one step to other processes working on the same component. The lock
//! is a `flock` on `.depot/locks/<type>.lock`, held until the guard drops.
//! Different components never contend.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Attempts before giving up (waits of 100, 200, 400, 800 ms in between)
const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY_MS: u64 = 100;

/// Held lock, released on drop
#[derive(Debug)]
pub struct ComponentLock {
    file: File,
    path: PathBuf,
}

impl ComponentLock {
    /// Acquire the lock at `path`, retrying with exponential backoff
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Acquired lock {}", path.display());
                    return Ok(Self { file, path });
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt + 1 < MAX_ATTEMPTS {
                        std::thread::sleep(Duration::from_millis(BASE_DELAY_MS << attempt));
                    }
                }
            }
        }

        Err(Error::Lock(format!(
            "could not lock {} after {} attempts, another switch of this component may be running: {}",
            path.display(),
            MAX_ATTEMPTS,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ComponentLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Released lock {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("locks/model.lock");

        let held = ComponentLock::acquire(&path).unwrap();
        assert_eq!(held.path(), path);

        let other = File::open(&path).unwrap();
        assert!(other.try_lock_exclusive().is_err());

        drop(held);
        other.try_lock_exclusive().unwrap();
        FileExt::unlock(&other).unwrap();

        ComponentLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_contended_lock_times_out() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.lock");
        let _held = ComponentLock::acquire(&path).unwrap();

        let err = ComponentLock::acquire(&path).unwrap_err();
        assert!(matches!(err, Error::Lock(_)));
    }

    #[test]
    fn test_components_do_not_contend() {
        let temp = TempDir::new().unwrap();
        let _model = ComponentLock::acquire(temp.path().join("model.lock")).unwrap();
        ComponentLock::acquire(temp.path().join("config.lock")).unwrap();
    }
}
