//! Whole-file replacement and advisory locking for shared state files.
//!
//! Every state file is rewritten by building the complete new content in
//! memory and renaming a fully written temporary sibling over the target, so
//! concurrent readers only ever observe the old or the new file. Writers
//! serialize through a [`FileLocker`] keyed by the target path.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustix::fs::{FlockOperation, flock};
use tempfile::NamedTempFile;

/// Default mode for files that did not exist before the first write.
const DEFAULT_MODE: u32 = 0o644;

/// Atomically replace `path` with `contents`.
///
/// The target's existing permissions are carried over; new files get `0644`.
///
/// # Errors
///
/// Returns the underlying I/O error. Callers check for
/// [`std::io::ErrorKind::PermissionDenied`] to fall back to an elevated write.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let permissions = match std::fs::metadata(path) {
        Ok(meta) => meta.permissions(),
        Err(_) => std::fs::Permissions::from_mode(DEFAULT_MODE),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    std::fs::set_permissions(tmp.path(), permissions)?;
    tmp.persist(path).map_err(|e| e.error)?;

    tracing::trace!(path = %path.display(), bytes = contents.len(), "File replaced");
    Ok(())
}

/// Read a file, treating a missing file as empty.
///
/// # Errors
///
/// Returns any I/O error other than "not found".
pub fn read_or_empty(path: &Path) -> std::io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Provider of exclusive, per-file locks.
#[derive(Debug, Clone)]
pub enum FileLocker {
    /// `flock(2)` on a sidecar lock file inside `dir`.
    ///
    /// Serializes separate processes as well as threads.
    Flock {
        /// Directory holding the lock files.
        dir: PathBuf,
    },
    /// In-process lock table. Only serializes callers sharing this value.
    Memory(Arc<MemoryLocks>),
}

impl FileLocker {
    /// Lock files live in `dir`.
    #[must_use]
    pub fn flock(dir: impl Into<PathBuf>) -> Self {
        Self::Flock { dir: dir.into() }
    }

    /// A fresh in-process lock table.
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(Arc::new(MemoryLocks::default()))
    }

    /// Block until the exclusive lock for `target` is held.
    ///
    /// The lock is released when the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or locked.
    pub fn lock(&self, target: &Path) -> std::io::Result<FileLockGuard> {
        match self {
            Self::Flock { dir } => {
                let file = match open_lock_file(dir, target) {
                    Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                        let fallback = std::env::temp_dir().join("lxc-compose-locks");
                        tracing::debug!(
                            dir = %dir.display(),
                            fallback = %fallback.display(),
                            "Lock directory not writable"
                        );
                        open_lock_file(&fallback, target)?
                    }
                    other => other?,
                };
                flock(&file, FlockOperation::LockExclusive)?;
                tracing::trace!(target = %target.display(), "Acquired file lock");
                Ok(FileLockGuard::Flock(file))
            }
            Self::Memory(locks) => {
                let key = target.to_path_buf();
                locks.acquire(&key);
                Ok(FileLockGuard::Memory {
                    locks: Arc::clone(locks),
                    key,
                })
            }
        }
    }
}

/// Held lock; dropping it releases the lock.
#[derive(Debug)]
pub enum FileLockGuard {
    /// The open, locked sidecar file. Closing it releases the lock.
    Flock(File),
    /// An entry in an in-process lock table.
    Memory {
        /// Owning table.
        locks: Arc<MemoryLocks>,
        /// Locked target.
        key: PathBuf,
    },
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        match self {
            Self::Flock(file) => {
                if let Err(e) = flock(&*file, FlockOperation::Unlock) {
                    tracing::warn!(error = %e, "Failed to release file lock");
                }
            }
            Self::Memory { locks, key } => locks.release(key),
        }
    }
}

/// Set of currently locked paths, with a condition variable for waiters.
#[derive(Debug, Default)]
pub struct MemoryLocks {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

impl MemoryLocks {
    fn acquire(&self, key: &Path) {
        let mut held = self.held.lock();
        while held.contains(key) {
            self.released.wait(&mut held);
        }
        held.insert(key.to_path_buf());
    }

    fn release(&self, key: &Path) {
        self.held.lock().remove(key);
        self.released.notify_all();
    }

    /// Whether `key` is currently locked.
    #[must_use]
    pub fn is_locked(&self, key: &Path) -> bool {
        self.held.lock().contains(key)
    }
}

fn open_lock_file(dir: &Path, target: &Path) -> std::io::Result<File> {
    std::fs::create_dir_all(dir)?;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.join(lock_file_name(target)))
}

fn lock_file_name(target: &Path) -> String {
    let flat: String = target
        .to_string_lossy()
        .trim_start_matches('/')
        .chars()
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    format!("{flat}.lock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        // No temporary siblings left behind
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn atomic_write_keeps_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();

        atomic_write(&path, b"new").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn new_files_are_world_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        atomic_write(&path, b"127.0.0.1\tlocalhost\n").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn read_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_or_empty(&dir.path().join("nope")).unwrap(), "");
    }

    #[test]
    fn memory_lock_is_exclusive() {
        let locker = FileLocker::memory();
        let target = PathBuf::from("/tmp/target");
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locker = locker.clone();
                let target = target.clone();
                let counter = Arc::clone(&counter);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    let _guard = locker.lock(&target).unwrap();
                    let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(2));
                    counter.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn memory_lock_released_on_drop() {
        let locker = FileLocker::memory();
        let target = PathBuf::from("/tmp/target");
        let FileLocker::Memory(table) = &locker else {
            unreachable!()
        };

        let guard = locker.lock(&target).unwrap();
        assert!(table.is_locked(&target));
        drop(guard);
        assert!(!table.is_locked(&target));
    }

    #[test]
    fn flock_creates_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let locker = FileLocker::flock(dir.path().join("locks"));
        let guard = locker.lock(Path::new("/etc/hosts")).unwrap();
        assert!(dir.path().join("locks/etc_hosts.lock").exists());
        drop(guard);
        // Re-locking after release must not block
        let _again = locker.lock(Path::new("/etc/hosts")).unwrap();
    }
}
