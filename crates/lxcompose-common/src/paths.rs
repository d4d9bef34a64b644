//! Standard filesystem paths for lxcompose.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for lxcompose state.
pub static LXC_COMPOSE_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("LXC_COMPOSE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/srv/lxc-compose"))
});

/// The host machine's own hosts file.
pub static LXC_COMPOSE_HOST_HOSTS: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("LXC_COMPOSE_HOST_HOSTS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/hosts"))
});

/// Standard paths used by lxcompose.
#[derive(Debug, Clone)]
pub struct ComposePaths {
    /// Root state directory (default: /srv/lxc-compose).
    pub root: PathBuf,
    /// Host machine hosts file (default: /etc/hosts).
    pub host_hosts: PathBuf,
}

impl ComposePaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths rooted somewhere else, with the host hosts file inside it.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let host_hosts = root.join("host-hosts");
        Self { root, host_hosts }
    }

    /// Override the host machine hosts file.
    #[must_use]
    pub fn with_host_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_hosts = path.into();
        self
    }

    /// IP allocation registry.
    #[must_use]
    pub fn ip_allocations(&self) -> PathBuf {
        self.root.join("ip-allocations.json")
    }

    /// Port forward registry.
    #[must_use]
    pub fn port_forwards(&self) -> PathBuf {
        self.root.join("port-forwards.json")
    }

    /// Container info snapshot (IP and exposed ports per container).
    #[must_use]
    pub fn container_info(&self) -> PathBuf {
        self.root.join("container-info.json")
    }

    /// Hosts file bind-mounted into every container.
    #[must_use]
    pub fn shared_hosts(&self) -> PathBuf {
        self.root.join("etc").join("hosts")
    }

    /// One-time copy of the host hosts file taken before the first rewrite.
    #[must_use]
    pub fn host_hosts_backup(&self) -> PathBuf {
        self.root.join("hosts.lxc-backup")
    }

    /// Directory holding advisory lock files.
    #[must_use]
    pub fn locks(&self) -> PathBuf {
        self.root.join("locks")
    }
}

impl Default for ComposePaths {
    fn default() -> Self {
        Self {
            root: LXC_COMPOSE_ROOT.clone(),
            host_hosts: LXC_COMPOSE_HOST_HOSTS.clone(),
        }
    }
}
