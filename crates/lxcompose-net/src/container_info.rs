//! Per-container snapshot of the address and exposed ports.
//!
//! Only used for display and to find a container's address during cleanup
//! once its allocation is gone.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use lxcompose_common::LxcResult;
use serde::{Deserialize, Serialize};

use crate::store::NetworkIdentityStore;

/// Snapshot of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "InfoRepr")]
pub struct ContainerInfo {
    /// Address at setup time.
    pub ip: Ipv4Addr,
    /// Exposed ports.
    pub ports: Vec<u16>,
}

// Older files store just the address.
#[derive(Deserialize)]
#[serde(untagged)]
enum InfoRepr {
    Full {
        ip: Ipv4Addr,
        #[serde(default)]
        ports: Vec<u16>,
    },
    Ip(Ipv4Addr),
}

impl From<InfoRepr> for ContainerInfo {
    fn from(repr: InfoRepr) -> Self {
        match repr {
            InfoRepr::Full { ip, ports } => Self { ip, ports },
            InfoRepr::Ip(ip) => Self { ip, ports: Vec::new() },
        }
    }
}

/// Reads and writes `container-info.json`.
pub struct ContainerInfoStore<'a> {
    store: &'a NetworkIdentityStore,
}

impl<'a> ContainerInfoStore<'a> {
    /// Create a snapshot store over `store`.
    #[must_use]
    pub const fn new(store: &'a NetworkIdentityStore) -> Self {
        Self { store }
    }

    /// All snapshots.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn all(&self) -> LxcResult<BTreeMap<String, ContainerInfo>> {
        self.store
            .read_json(&self.store.paths().container_info())
    }

    /// Snapshot of `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn get(&self, name: &str) -> LxcResult<Option<ContainerInfo>> {
        Ok(self.all()?.remove(name))
    }

    /// Record `name`'s snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be updated.
    pub fn save(&self, name: &str, info: ContainerInfo) -> LxcResult<()> {
        let path = self.store.paths().container_info();
        let _lock = self.store.lock(&path)?;
        let mut all = self.all()?;
        if all.get(name) == Some(&info) {
            return Ok(());
        }
        all.insert(name.to_string(), info);
        self.store.write_json(&path, &all)
    }

    /// Drop `name`'s snapshot; returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be updated.
    pub fn remove(&self, name: &str) -> LxcResult<bool> {
        let path = self.store.paths().container_info();
        let _lock = self.store.lock(&path)?;
        let mut all = self.all()?;
        if all.remove(name).is_none() {
            return Ok(false);
        }
        self.store.write_json(&path, &all)?;
        Ok(true)
    }
}
