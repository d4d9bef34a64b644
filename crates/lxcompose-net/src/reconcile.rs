//! Reconciliation of persisted network state against the live runtime.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use lxcompose_common::{LxcError, LxcResult};
use serde::Serialize;

use crate::executor::RuntimeContainer;
use crate::hosts::HostsTarget;
use crate::portmap::PortForward;
use crate::store::NetworkIdentityStore;

/// Everything known about one container name, joined across all state files
/// and the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerNetworkRecord {
    /// Container name.
    pub name: String,
    /// Address in the allocation registry.
    pub allocated_ip: Option<Ipv4Addr>,
    /// Address in the shared hosts file.
    pub shared_hosts_ip: Option<Ipv4Addr>,
    /// Address in the host machine's hosts file.
    pub host_hosts_ip: Option<Ipv4Addr>,
    /// Exposed ports from the container info snapshot.
    pub exposed_ports: Vec<u16>,
    /// Port forwards targeting the container.
    pub forwards: Vec<PortForward>,
    /// Runtime view, if the runtime knows the container.
    pub runtime: Option<RuntimeContainer>,
}

impl ContainerNetworkRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            allocated_ip: None,
            shared_hosts_ip: None,
            host_hosts_ip: None,
            exposed_ports: Vec::new(),
            forwards: Vec::new(),
            runtime: None,
        }
    }

    /// State exists for a container the runtime no longer knows.
    #[must_use]
    pub const fn is_orphan(&self) -> bool {
        self.runtime.is_none()
    }

    /// The live address differs from the allocated one.
    #[must_use]
    pub fn ip_mismatch(&self) -> bool {
        match (self.allocated_ip, self.runtime.as_ref().and_then(RuntimeContainer::live_ip)) {
            (Some(allocated), Some(live)) => allocated != live,
            _ => false,
        }
    }

    /// Best known address.
    #[must_use]
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.allocated_ip
            .or(self.shared_hosts_ip)
            .or_else(|| self.runtime.as_ref().and_then(|r| r.ipv4))
    }
}

/// Detects conflicts and prunes or rolls back state.
pub struct Reconciler<'a> {
    store: &'a NetworkIdentityStore,
}

impl<'a> Reconciler<'a> {
    /// Create a reconciler over `store`.
    #[must_use]
    pub const fn new(store: &'a NetworkIdentityStore) -> Self {
        Self { store }
    }

    /// Whether `name` is already owned by a hosts entry or any runtime
    /// container, running or not.
    ///
    /// # Errors
    ///
    /// Returns an error if a hosts file or the runtime cannot be read.
    pub fn name_conflict(&self, name: &str) -> LxcResult<bool> {
        let hosts = self.store.hosts();
        for target in HostsTarget::ALL {
            if hosts.read(target)?.contains(name) {
                tracing::debug!(name, ?target, "Name present in hosts file");
                return Ok(true);
            }
        }

        Ok(self
            .store
            .executor()
            .list_containers()?
            .iter()
            .any(|c| c.name == name))
    }

    /// Fail with [`LxcError::NameConflict`] if `name` is taken.
    ///
    /// # Errors
    ///
    /// Returns the conflict, or an error if the check itself fails.
    pub fn ensure_name_available(&self, name: &str) -> LxcResult<()> {
        if self.name_conflict(name)? {
            return Err(LxcError::name_conflict(name));
        }
        Ok(())
    }

    /// Drop all state for names the runtime no longer knows.
    ///
    /// Covers names with a hosts entry or an allocation. Returns the pruned
    /// names; nothing is written when there is nothing stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be listed. A failed listing is
    /// never treated as "no containers".
    pub fn sync_with_reality(&self) -> LxcResult<Vec<String>> {
        let live: BTreeSet<String> = self
            .store
            .executor()
            .list_containers()?
            .into_iter()
            .map(|c| c.name)
            .collect();

        let mut known = self.store.hosts().managed_names()?;
        known.extend(self.store.allocator().allocations()?.into_keys());

        let stale: Vec<String> = known.difference(&live).cloned().collect();
        for name in &stale {
            tracing::info!(name = %name, "Pruning state of removed container");
            if let Err(e) = self.teardown(name) {
                tracing::warn!(name = %name, error = %e, "Failed to prune container state");
            }
        }
        Ok(stale)
    }

    /// Remove every piece of network state held for `name`.
    ///
    /// Each step runs even if an earlier one failed; the first error is
    /// returned at the end. Safe to repeat.
    ///
    /// # Errors
    ///
    /// Returns the first step that failed.
    pub fn teardown(&self, name: &str) -> LxcResult<()> {
        let mut first_error: Option<LxcError> = None;
        let mut note = |result: LxcResult<()>, step: &str| {
            if let Err(e) = result {
                tracing::warn!(name, step, error = %e, "Teardown step failed");
                first_error.get_or_insert(e);
            }
        };

        let ip = self.known_ip(name);

        note(
            self.store.forwards().remove_for_container(name).map(drop),
            "forwards",
        );
        if let Some(ip) = ip {
            note(self.store.exposed().remove(ip).map(drop), "firewall");
        }
        note(self.store.hosts().remove(name).map(drop), "hosts");
        note(self.store.allocator().release(name).map(drop), "allocation");
        note(self.store.container_info().remove(name).map(drop), "container info");

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::debug!(name, ip = ?ip, "Tore down network identity");
                Ok(())
            }
        }
    }

    /// Roll back a failed setup of `name`.
    ///
    /// Never fails; problems are logged so the caller can report the error
    /// that triggered the rollback.
    pub fn teardown_on_failure(&self, name: &str) {
        tracing::warn!(name, "Setup failed, rolling back network state");
        if let Err(e) = self.teardown(name) {
            tracing::error!(name, error = %e, "Rollback incomplete");
        }
    }

    fn known_ip(&self, name: &str) -> Option<Ipv4Addr> {
        let from_allocation = self.store.allocator().get(name).ok().flatten();
        from_allocation
            .or_else(|| {
                self.store
                    .container_info()
                    .get(name)
                    .ok()
                    .flatten()
                    .map(|info| info.ip)
            })
            .or_else(|| self.store.hosts().ip_of(name).ok().flatten())
    }

    /// Joined view of every name known to any state file or the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if any state file or the runtime cannot be read.
    pub fn records(&self) -> LxcResult<Vec<ContainerNetworkRecord>> {
        let mut records: BTreeMap<String, ContainerNetworkRecord> = BTreeMap::new();

        for (name, ip) in self.store.allocator().allocations()? {
            record(&mut records, &name).allocated_ip = Some(ip);
        }
        let hosts = self.store.hosts();
        for e in hosts.list_entries(HostsTarget::Shared)? {
            record(&mut records, &e.name).shared_hosts_ip = Some(e.ip);
        }
        for e in hosts.list_entries(HostsTarget::Host)? {
            record(&mut records, &e.name).host_hosts_ip = Some(e.ip);
        }
        for (name, info) in self.store.container_info().all()? {
            record(&mut records, &name).exposed_ports = info.ports;
        }
        for forward in self.store.forwards().list()? {
            let name = forward.container_name.clone();
            record(&mut records, &name).forwards.push(forward);
        }
        for container in self.store.executor().list_containers()? {
            let name = container.name.clone();
            record(&mut records, &name).runtime = Some(container);
        }

        Ok(records.into_values().collect())
    }
}

fn record<'r>(
    records: &'r mut BTreeMap<String, ContainerNetworkRecord>,
    name: &str,
) -> &'r mut ContainerNetworkRecord {
    records
        .entry(name.to_string())
        .or_insert_with(|| ContainerNetworkRecord::new(name))
}
