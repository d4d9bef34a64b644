//! Shared handle over the on-disk network identity state.

use std::path::Path;
use std::sync::Arc;

use lxcompose_common::{
    ComposePaths, FileLockGuard, FileLocker, LxcResult, atomic_write, read_or_empty,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::container_info::ContainerInfoStore;
use crate::executor::Executor;
use crate::firewall::ExposedPolicy;
use crate::hosts::HostsSynchronizer;
use crate::ipam::{DEFAULT_START, IpAllocator, Subnet};
use crate::portmap::PortForwarder;
use crate::provision::Provisioner;
use crate::reconcile::Reconciler;

/// Paths, addressing parameters, locks and the executor shared by every
/// component.
///
/// Components borrow the store; they hold no state of their own, so any
/// number of them can be created cheaply.
#[derive(Clone)]
pub struct NetworkIdentityStore {
    paths: ComposePaths,
    subnet: Subnet,
    start: u8,
    locker: FileLocker,
    executor: Arc<dyn Executor>,
}

impl std::fmt::Debug for NetworkIdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkIdentityStore")
            .field("paths", &self.paths)
            .field("subnet", &self.subnet)
            .field("start", &self.start)
            .finish_non_exhaustive()
    }
}

impl NetworkIdentityStore {
    /// Create a store using `flock` locks under the state root.
    #[must_use]
    pub fn new(paths: ComposePaths, executor: Arc<dyn Executor>) -> Self {
        let locker = FileLocker::flock(paths.locks());
        Self {
            paths,
            subnet: Subnet::default(),
            start: DEFAULT_START,
            locker,
            executor,
        }
    }

    /// Set the container subnet.
    #[must_use]
    pub fn with_subnet(mut self, subnet: Subnet) -> Self {
        self.subnet = subnet;
        self
    }

    /// Set the first host number handed out.
    #[must_use]
    pub fn with_start(mut self, start: u8) -> Self {
        self.start = start.clamp(1, 254);
        self
    }

    /// Replace the lock provider.
    #[must_use]
    pub fn with_locker(mut self, locker: FileLocker) -> Self {
        self.locker = locker;
        self
    }

    /// State file locations.
    #[must_use]
    pub const fn paths(&self) -> &ComposePaths {
        &self.paths
    }

    /// Container subnet.
    #[must_use]
    pub const fn subnet(&self) -> &Subnet {
        &self.subnet
    }

    /// First host number handed out.
    #[must_use]
    pub const fn start(&self) -> u8 {
        self.start
    }

    /// Runtime and firewall executor.
    #[must_use]
    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    /// Take the exclusive lock for `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired.
    pub fn lock(&self, target: &Path) -> LxcResult<FileLockGuard> {
        Ok(self.locker.lock(target)?)
    }

    /// Read a text file, missing files read as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn read_text(&self, path: &Path) -> LxcResult<String> {
        Ok(read_or_empty(path)?)
    }

    /// Atomically replace a text file, escalating privileges if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if neither the direct nor the elevated write works.
    pub fn write_text(&self, path: &Path, contents: &str) -> LxcResult<()> {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                if e.kind() != std::io::ErrorKind::PermissionDenied {
                    return Err(e.into());
                }
            }
        }

        match atomic_write(path, contents.as_bytes()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                tracing::debug!(path = %path.display(), "Direct write denied, escalating");
                self.executor.elevated_write(path, contents.as_bytes())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a JSON state file; missing or empty files yield the default.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed.
    pub fn read_json<T: DeserializeOwned + Default>(&self, path: &Path) -> LxcResult<T> {
        let content = self.read_text(path)?;
        if content.trim().is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Atomically replace a JSON state file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> LxcResult<()> {
        let mut content = serde_json::to_string_pretty(value)?;
        content.push('\n');
        self.write_text(path, &content)
    }

    /// IP allocator.
    #[must_use]
    pub const fn allocator(&self) -> IpAllocator<'_> {
        IpAllocator::new(self)
    }

    /// Hosts file synchronizer.
    #[must_use]
    pub const fn hosts(&self) -> HostsSynchronizer<'_> {
        HostsSynchronizer::new(self)
    }

    /// Exposed-port policy manager.
    #[must_use]
    pub const fn exposed(&self) -> ExposedPolicy<'_> {
        ExposedPolicy::new(self)
    }

    /// Port forward manager.
    #[must_use]
    pub const fn forwards(&self) -> PortForwarder<'_> {
        PortForwarder::new(self)
    }

    /// Container info snapshot.
    #[must_use]
    pub const fn container_info(&self) -> ContainerInfoStore<'_> {
        ContainerInfoStore::new(self)
    }

    /// Reconciler.
    #[must_use]
    pub const fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(self)
    }

    /// Identity provisioner.
    #[must_use]
    pub const fn provisioner(&self) -> Provisioner<'_> {
        Provisioner::new(self)
    }
}
