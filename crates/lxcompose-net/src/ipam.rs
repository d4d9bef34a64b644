//! Deterministic IPv4 address allocation within the container subnet.
//!
//! Each container name owns exactly one host number. Allocations are
//! persisted in a single JSON registry, rewritten atomically under an
//! exclusive lock, so concurrent allocators never hand out the same address.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use lxcompose_common::{ContainerName, LxcError, LxcResult};
use serde::{Deserialize, Serialize};

use crate::store::NetworkIdentityStore;

/// Default container subnet.
pub const DEFAULT_SUBNET: Subnet = Subnet {
    network: Ipv4Addr::new(10, 0, 3, 0),
};

/// First host number handed out when nothing else is configured.
pub const DEFAULT_START: u8 = 11;

/// Highest assignable host number; `.255` is broadcast.
pub const LAST_HOST: u8 = 254;

/// An IPv4 `/24` network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    network: Ipv4Addr,
}

impl Subnet {
    /// Build a subnet from its network address.
    ///
    /// # Errors
    ///
    /// Returns an error if the last octet is not zero.
    pub fn new(network: Ipv4Addr) -> LxcResult<Self> {
        if network.octets()[3] != 0 {
            return Err(LxcError::InvalidSubnet {
                value: format!("{network}/24"),
            });
        }
        Ok(Self { network })
    }

    /// Network address.
    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Address of host number `host`.
    #[must_use]
    pub const fn address(&self, host: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.network.octets();
        Ipv4Addr::new(a, b, c, host)
    }

    /// Host number of `ip`, if it is inside this subnet.
    #[must_use]
    pub fn host_of(&self, ip: Ipv4Addr) -> Option<u8> {
        let [a, b, c, d] = ip.octets();
        let [na, nb, nc, _] = self.network.octets();
        ((a, b, c) == (na, nb, nc)).then_some(d)
    }
}

impl Default for Subnet {
    fn default() -> Self {
        DEFAULT_SUBNET
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/24", self.network)
    }
}

impl FromStr for Subnet {
    type Err = LxcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LxcError::InvalidSubnet {
            value: s.to_string(),
        };
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        if prefix != "24" {
            return Err(invalid());
        }
        let network: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        Self::new(network).map_err(|_| invalid())
    }
}

impl TryFrom<String> for Subnet {
    type Error = LxcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

/// The persisted allocation registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRegistry {
    /// Subnet the host numbers belong to.
    pub subnet: Subnet,
    /// Where the next scan starts.
    #[serde(rename = "next_ip", alias = "nextCandidate")]
    pub next_candidate: u16,
    /// Host numbers that are never handed out.
    #[serde(default)]
    pub reserved: BTreeSet<u8>,
    /// Container name to host number.
    #[serde(default)]
    pub allocations: BTreeMap<String, u8>,
}

impl AllocationRegistry {
    /// A fresh registry reserving every host number below `start`.
    #[must_use]
    pub fn new(subnet: Subnet, start: u8) -> Self {
        Self {
            subnet,
            next_candidate: u16::from(start),
            reserved: (1..start).collect(),
            allocations: BTreeMap::new(),
        }
    }

    /// Next free host number.
    ///
    /// Scans upward from `next_candidate`, then wraps around to the lowest
    /// unreserved numbers so released addresses are eventually reused.
    #[must_use]
    pub fn next_free(&self) -> Option<u8> {
        let taken: BTreeSet<u8> = self.allocations.values().copied().collect();
        let from = u8::try_from(self.next_candidate.clamp(1, u16::from(LAST_HOST) + 1))
            .unwrap_or(u8::MAX);

        (from..=LAST_HOST)
            .chain(1..from.min(LAST_HOST + 1))
            .find(|host| !self.reserved.contains(host) && !taken.contains(host))
    }

    /// Address allocated to `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Ipv4Addr> {
        self.allocations
            .get(name)
            .map(|&host| self.subnet.address(host))
    }
}

/// Allocates and releases container addresses.
pub struct IpAllocator<'a> {
    store: &'a NetworkIdentityStore,
}

impl<'a> IpAllocator<'a> {
    /// Create an allocator over `store`.
    #[must_use]
    pub const fn new(store: &'a NetworkIdentityStore) -> Self {
        Self { store }
    }

    fn load(&self) -> LxcResult<AllocationRegistry> {
        let path = self.store.paths().ip_allocations();
        let content = self.store.read_text(&path)?;
        if content.trim().is_empty() {
            return Ok(AllocationRegistry::new(
                *self.store.subnet(),
                self.store.start(),
            ));
        }

        let registry: AllocationRegistry = serde_json::from_str(&content)?;
        if registry.subnet != *self.store.subnet() {
            return Err(LxcError::Config {
                message: format!(
                    "{} was created for subnet {}, not {}",
                    path.display(),
                    registry.subnet,
                    self.store.subnet()
                ),
            });
        }
        Ok(registry)
    }

    /// Address for `name`, allocating one if needed.
    ///
    /// Idempotent: a name that already has an address gets the same one back
    /// and the registry is not rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`LxcError::InvalidContainerName`] for a malformed name,
    /// [`LxcError::AllocationExhausted`] when no host number is free, or an
    /// I/O error if the registry cannot be updated.
    pub fn allocate(&self, name: &str) -> LxcResult<Ipv4Addr> {
        let name = ContainerName::new(name)?;
        let path = self.store.paths().ip_allocations();
        let _lock = self.store.lock(&path)?;

        let mut registry = self.load()?;
        if let Some(ip) = registry.get(name.as_str()) {
            tracing::debug!(name = %name, %ip, "Reusing existing allocation");
            return Ok(ip);
        }

        let host = registry
            .next_free()
            .ok_or_else(|| LxcError::AllocationExhausted {
                subnet: registry.subnet.to_string(),
            })?;

        registry.allocations.insert(name.to_string(), host);
        registry.next_candidate = u16::from(host) + 1;
        self.store.write_json(&path, &registry)?;

        let ip = registry.subnet.address(host);
        tracing::info!(name = %name, %ip, "Allocated IP address");
        Ok(ip)
    }

    /// Release the address held by `name`.
    ///
    /// Returns whether anything was released. `next_candidate` is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read or written.
    pub fn release(&self, name: &str) -> LxcResult<bool> {
        let path = self.store.paths().ip_allocations();
        let _lock = self.store.lock(&path)?;

        let mut registry = self.load()?;
        let Some(host) = registry.allocations.remove(name) else {
            return Ok(false);
        };
        self.store.write_json(&path, &registry)?;

        tracing::info!(name, ip = %registry.subnet.address(host), "Released IP address");
        Ok(true)
    }

    /// Address allocated to `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub fn get(&self, name: &str) -> LxcResult<Option<Ipv4Addr>> {
        Ok(self.load()?.get(name))
    }

    /// Every allocation, by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub fn allocations(&self) -> LxcResult<BTreeMap<String, Ipv4Addr>> {
        let registry = self.load()?;
        Ok(registry
            .allocations
            .iter()
            .map(|(name, &host)| (name.clone(), registry.subnet.address(host)))
            .collect())
    }

    /// The full registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub fn registry(&self) -> LxcResult<AllocationRegistry> {
        self.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemoryExecutor;
    use lxcompose_common::{ComposePaths, FileLocker};
    use std::sync::Arc;

    fn store(dir: &tempfile::TempDir) -> NetworkIdentityStore {
        NetworkIdentityStore::new(
            ComposePaths::with_root(dir.path()),
            Arc::new(MemoryExecutor::new()),
        )
        .with_locker(FileLocker::memory())
    }

    #[test]
    fn test_subnet_parse() {
        let subnet: Subnet = "192.168.50.0/24".parse().unwrap();
        assert_eq!(subnet.address(7), Ipv4Addr::new(192, 168, 50, 7));
        assert_eq!(subnet.to_string(), "192.168.50.0/24");
        assert_eq!(subnet.host_of(Ipv4Addr::new(192, 168, 50, 9)), Some(9));
        assert_eq!(subnet.host_of(Ipv4Addr::new(192, 168, 51, 9)), None);

        assert!("10.0.3.0/16".parse::<Subnet>().is_err());
        assert!("10.0.3.5/24".parse::<Subnet>().is_err());
        assert!("10.0.3.0".parse::<Subnet>().is_err());
        assert!("nonsense/24".parse::<Subnet>().is_err());
    }

    #[test]
    fn test_first_allocation_uses_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let ip = store.allocator().allocate("web").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 3, 11));

        let registry = store.allocator().registry().unwrap();
        assert_eq!(registry.next_candidate, 12);
        assert_eq!(registry.reserved, (1..11).collect());
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let allocator = store.allocator();

        let first = allocator.allocate("web").unwrap();
        let path = store.paths().ip_allocations();
        let before = std::fs::read_to_string(&path).unwrap();

        assert_eq!(allocator.allocate("web").unwrap(), first);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_released_address_is_not_eagerly_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let allocator = store.allocator();

        allocator.allocate("a").unwrap();
        allocator.allocate("b").unwrap();
        assert!(allocator.release("a").unwrap());
        assert!(!allocator.release("a").unwrap());

        assert_eq!(allocator.allocate("c").unwrap(), Ipv4Addr::new(10, 0, 3, 13));
        assert_eq!(allocator.get("a").unwrap(), None);
    }

    #[test]
    fn test_wraps_to_released_addresses() {
        let mut registry = AllocationRegistry::new(Subnet::default(), 250);
        for host in 250..=254 {
            registry.allocations.insert(format!("c{host}"), host);
        }
        registry.next_candidate = 255;
        assert_eq!(registry.next_free(), None);

        registry.allocations.remove("c251");
        assert_eq!(registry.next_free(), Some(251));
    }

    #[test]
    fn test_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).with_start(252);
        let allocator = store.allocator();

        allocator.allocate("a").unwrap();
        allocator.allocate("b").unwrap();
        allocator.allocate("c").unwrap();
        let err = allocator.allocate("d").unwrap_err();
        assert!(matches!(err, LxcError::AllocationExhausted { .. }));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.allocator().allocate("bad name"),
            Err(LxcError::InvalidContainerName { .. })
        ));
    }

    #[test]
    fn test_subnet_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        store(&dir).allocator().allocate("web").unwrap();

        let other = store(&dir).with_subnet("192.168.7.0/24".parse().unwrap());
        assert!(matches!(
            other.allocator().get("web"),
            Err(LxcError::Config { .. })
        ));
    }

    #[test]
    fn test_reads_camel_case_cursor() {
        let json = r#"{"subnet":"10.0.3.0/24","nextCandidate":20,"allocations":{"web":11}}"#;
        let registry: AllocationRegistry = serde_json::from_str(json).unwrap();
        assert_eq!(registry.next_candidate, 20);
        assert!(registry.reserved.is_empty());
        assert_eq!(registry.get("web"), Some(Ipv4Addr::new(10, 0, 3, 11)));
    }
}
