//! Durable record storage: atomic JSON writes, fail-safe loads, and the
//! advisory lock that serialises read-modify-write sequences across processes.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    thread::{self, ThreadId},
};

use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::error::{GovernanceError, GovernanceResult};

/// Writes `value` as pretty JSON via temp file, flush, fsync, rename.
///
/// Readers observe either the previous record or the complete new one.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> GovernanceResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| GovernanceError::io(parent, err))?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(parent).map_err(|err| GovernanceError::io(parent, err))?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), value).map_err(|source| {
        GovernanceError::Serialization {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let file = tmp.as_file_mut();
    file.write_all(b"\n")
        .map_err(|err| GovernanceError::io(path, err))?;
    file.flush().map_err(|err| GovernanceError::io(path, err))?;
    file.sync_all().map_err(|err| GovernanceError::io(path, err))?;
    tmp.persist(path)
        .map_err(|err| GovernanceError::io(path, err.error))?;
    Ok(())
}

/// Loads a JSON record, treating absence and corruption alike as `None`.
///
/// Unreadable files (permission denied, etc.) are also reported as `None`
/// with a warning; callers fall back to their safe default.
#[must_use]
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "record unreadable, using safe default");
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "record unparsable, using safe default");
            None
        }
    }
}

/// Removes a file if present. Returns whether anything was removed.
pub fn remove_if_exists(path: &Path) -> GovernanceResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(GovernanceError::io(path, err)),
    }
}

/// Exclusive advisory lock on the governance state directory.
///
/// Re-entrant for the owning thread: nested acquisitions bump a depth
/// counter instead of calling `flock` again on a second descriptor, which
/// would block against ourselves. Other threads sharing the handle wait
/// until the owner's last guard drops.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    held: Mutex<Option<Held>>,
    released: Condvar,
}

#[derive(Debug)]
struct Held {
    file: File,
    owner: ThreadId,
    depth: usize,
}

impl StateLock {
    /// Creates an unlocked handle for the lock file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    /// Blocks until the lock is held and returns a guard releasing it on drop.
    pub fn acquire(&self) -> GovernanceResult<StateLockGuard<'_>> {
        let me = thread::current().id();
        let mut held = self.held.lock();
        loop {
            match held.as_ref().map(|existing| existing.owner) {
                None => break,
                Some(owner) if owner == me => {
                    if let Some(existing) = held.as_mut() {
                        existing.depth += 1;
                    }
                    return Ok(StateLockGuard { lock: self });
                }
                Some(_) => self.released.wait(&mut held),
            }
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| GovernanceError::io(parent, err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| GovernanceError::Lock {
                path: self.path.clone(),
                source,
            })?;
        file.lock_exclusive()
            .map_err(|source| GovernanceError::Lock {
                path: self.path.clone(),
                source,
            })?;
        *held = Some(Held {
            file,
            owner: me,
            depth: 1,
        });
        Ok(StateLockGuard { lock: self })
    }

    /// Whether any thread currently holds the lock through this handle.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }

    fn release(&self) {
        let mut held = self.held.lock();
        let Some(existing) = held.as_mut() else {
            return;
        };
        existing.depth -= 1;
        if existing.depth == 0 {
            if let Some(done) = held.take() {
                if let Err(err) = FileExt::unlock(&done.file) {
                    warn!(path = %self.path.display(), error = %err, "state lock release failed");
                }
            }
            self.released.notify_one();
        }
    }
}

/// Guard returned by [`StateLock::acquire`].
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct StateLockGuard<'a> {
    lock: &'a StateLock,
}

impl Drop for StateLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/sample.json");
        write_json_atomic(&path, &Sample { value: 1 }).unwrap();
        write_json_atomic(&path, &Sample { value: 2 }).unwrap();
        assert_eq!(load_json::<Sample>(&path), Some(Sample { value: 2 }));
        let files: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn corrupt_and_missing_records_load_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");
        assert_eq!(load_json::<Sample>(&path), None);
        fs::write(&path, b"{\"value\": ").unwrap();
        assert_eq!(load_json::<Sample>(&path), None);
        fs::write(&path, b"{\"other\": 3}").unwrap();
        assert_eq!(load_json::<Sample>(&path), None);
    }

    #[test]
    fn remove_reports_presence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.json");
        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, b"{}").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn lock_is_reentrant_and_released_on_last_guard() {
        let dir = tempdir().unwrap();
        let lock = StateLock::new(dir.path().join("state/.state.lock"));
        {
            let _outer = lock.acquire().unwrap();
            {
                let _inner = lock.acquire().unwrap();
                assert!(lock.is_held());
            }
            assert!(lock.is_held());
        }
        assert!(!lock.is_held());

        let other = StateLock::new(dir.path().join("state/.state.lock"));
        let _guard = other.acquire().unwrap();
        assert!(other.is_held());
    }

    #[test]
    fn other_threads_wait_for_the_owner() {
        use std::sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        };
        use std::time::Duration;

        let dir = tempdir().unwrap();
        let lock = Arc::new(StateLock::new(dir.path().join(".state.lock")));
        let owner_inside = Arc::new(AtomicBool::new(true));
        let guard = lock.acquire().unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            let owner_inside = Arc::clone(&owner_inside);
            thread::spawn(move || {
                let _guard = lock.acquire().unwrap();
                owner_inside.load(Ordering::SeqCst)
            })
        };
        thread::sleep(Duration::from_millis(50));
        owner_inside.store(false, Ordering::SeqCst);
        drop(guard);

        assert!(!waiter.join().unwrap(), "second thread entered while owner held the lock");
        assert!(!lock.is_held());
    }
}
