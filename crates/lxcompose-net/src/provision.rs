//! The multi-step network identity setup for one container.

use std::net::Ipv4Addr;

use lxcompose_common::{ContainerName, LxcResult};

use crate::container_info::ContainerInfo;
use crate::firewall::{ExposedPorts, Protocol};
use crate::portmap::ForwardRequest;
use crate::store::NetworkIdentityStore;

/// Device name of the shared hosts file inside containers.
pub const HOSTS_DEVICE: &str = "hosts";

/// Mount point of the shared hosts file inside containers.
pub const CONTAINER_HOSTS_PATH: &str = "/etc/hosts";

/// What to set up for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupRequest {
    /// Container name.
    pub name: ContainerName,
    /// Ports reachable from outside the subnet.
    pub exposed_ports: Vec<u16>,
    /// Host ports forwarded to the container.
    pub forwards: Vec<ForwardRequest>,
}

impl SetupRequest {
    /// A request with no exposed ports or forwards.
    #[must_use]
    pub const fn new(name: ContainerName) -> Self {
        Self {
            name,
            exposed_ports: Vec::new(),
            forwards: Vec::new(),
        }
    }

    /// Set the exposed ports.
    #[must_use]
    pub fn with_exposed_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.exposed_ports = ports.into_iter().collect();
        self
    }

    /// Add a forward.
    #[must_use]
    pub fn with_forward(mut self, forward: ForwardRequest) -> Self {
        self.forwards.push(forward);
        self
    }
}

/// Runs allocate, hosts, mount, firewall and forwards as one unit.
pub struct Provisioner<'a> {
    store: &'a NetworkIdentityStore,
}

impl<'a> Provisioner<'a> {
    /// Create a provisioner over `store`.
    #[must_use]
    pub const fn new(store: &'a NetworkIdentityStore) -> Self {
        Self { store }
    }

    /// Set up the network identity of an existing container.
    ///
    /// Safe to repeat for a container that is already set up. If any step
    /// fails for a container that held no address yet, everything held for
    /// the name is torn down before the error is returned. A container that
    /// already held one keeps its identity: only the forwards added by this
    /// call are removed and its previous exposed ports are put back.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing step.
    pub fn setup(&self, request: &SetupRequest) -> LxcResult<Ipv4Addr> {
        let name = request.name.as_str();
        let fresh = self.store.allocator().get(name)?.is_none();
        let previous = self.store.container_info().get(name)?;

        let mut added = Vec::new();
        match self.run(request, &mut added) {
            Ok(ip) => {
                tracing::info!(name, %ip, "Network identity ready");
                Ok(ip)
            }
            Err(e) if fresh => {
                self.store.reconciler().teardown_on_failure(name);
                Err(e)
            }
            Err(e) => {
                tracing::warn!(name, error = %e, "Setup failed, restoring previous network identity");
                self.restore(name, previous, &added);
                Err(e)
            }
        }
    }

    fn run(&self, request: &SetupRequest, added: &mut Vec<(u16, Protocol)>) -> LxcResult<Ipv4Addr> {
        let name = request.name.as_str();

        let ip = self.store.allocator().allocate(name)?;
        self.store.container_info().save(
            name,
            ContainerInfo {
                ip,
                ports: request.exposed_ports.clone(),
            },
        )?;

        self.store.hosts().update(name, ip)?;
        self.store.executor().mount_file(
            name,
            HOSTS_DEVICE,
            &self.store.paths().shared_hosts(),
            CONTAINER_HOSTS_PATH,
        )?;

        self.store
            .exposed()
            .apply(&ExposedPorts::new(ip, request.exposed_ports.iter().copied()))?;

        let forwarder = self.store.forwards();
        let existing = forwarder.show(Some(name))?;
        for forward in &request.forwards {
            let forward = ForwardRequest {
                container: name.to_string(),
                ..forward.clone()
            };
            forwarder.add(&forward)?;
            if !existing
                .iter()
                .any(|f| f.host_port == forward.host_port && f.protocol == forward.protocol)
            {
                added.push((forward.host_port, forward.protocol));
            }
        }

        Ok(ip)
    }

    /// Undo a failed re-setup of a container that was already set up.
    fn restore(&self, name: &str, previous: Option<ContainerInfo>, added: &[(u16, Protocol)]) {
        let forwarder = self.store.forwards();
        for &(host_port, protocol) in added {
            if let Err(e) = forwarder.remove(host_port, protocol) {
                tracing::warn!(name, host_port, error = %e, "Failed to remove forward");
            }
        }

        let Some(info) = previous else {
            return;
        };
        let exposed = ExposedPorts::new(info.ip, info.ports.iter().copied());
        if let Err(e) = self.store.exposed().apply(&exposed) {
            tracing::warn!(name, error = %e, "Failed to restore exposed ports");
        }
        if let Err(e) = self.store.container_info().save(name, info) {
            tracing::warn!(name, error = %e, "Failed to restore container info");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ContainerStatus, MemoryExecutor};
    use lxcompose_common::{ComposePaths, FileLocker};
    use std::sync::Arc;

    #[test]
    fn test_setup_mounts_shared_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(MemoryExecutor::new());
        let store = NetworkIdentityStore::new(ComposePaths::with_root(dir.path()), exec.clone())
            .with_locker(FileLocker::memory());

        exec.add_container("web", ContainerStatus::Running, Some(Ipv4Addr::new(10, 0, 3, 11)));
        let request = SetupRequest::new("web".parse().unwrap()).with_exposed_ports([80]);
        let ip = store.provisioner().setup(&request).unwrap();

        assert_eq!(ip, Ipv4Addr::new(10, 0, 3, 11));
        let devices = exec.devices("web");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].0, HOSTS_DEVICE);
        assert_eq!(devices[0].1, store.paths().shared_hosts());
        assert_eq!(devices[0].2, CONTAINER_HOSTS_PATH);

        // Repeating the setup changes nothing
        let rules = exec.rule_count();
        store.provisioner().setup(&request).unwrap();
        assert_eq!(exec.rule_count(), rules);
        assert_eq!(store.hosts().managed_names().unwrap().len(), 1);
    }
}
