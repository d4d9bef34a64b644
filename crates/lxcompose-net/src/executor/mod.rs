//! Side-effecting operations against the container runtime and the kernel.
//!
//! Everything that shells out (`lxc`, `iptables`, `sysctl`, `sudo`) goes
//! through the [`Executor`] trait so the stores above it can be exercised
//! against [`MemoryExecutor`] in tests.

mod memory;
mod system;

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use lxcompose_common::LxcResult;
use serde::Serialize;

use crate::firewall::{FirewallRule, Table};

pub use memory::MemoryExecutor;
pub use system::SystemExecutor;

/// Runtime state of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ContainerStatus {
    /// Container is running.
    Running,
    /// Container is stopped.
    Stopped,
    /// Any other runtime state (frozen, error, ...).
    Other(String),
}

impl ContainerStatus {
    /// Map the runtime's status string.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            _ => Self::Other(status.to_string()),
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Other(s) => f.write_str(&s.to_ascii_lowercase()),
        }
    }
}

/// A container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeContainer {
    /// Container name.
    pub name: String,
    /// Current state.
    pub status: ContainerStatus,
    /// First non-loopback IPv4 address, if any.
    pub ipv4: Option<Ipv4Addr>,
}

impl RuntimeContainer {
    /// Whether the container is running with an address.
    #[must_use]
    pub fn live_ip(&self) -> Option<Ipv4Addr> {
        match self.status {
            ContainerStatus::Running => self.ipv4,
            _ => None,
        }
    }
}

/// One line of a chain listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedRule {
    /// 1-based position in the chain.
    pub index: usize,
    /// The rule as printed by the listing.
    pub text: String,
}

/// Parse `iptables -L <chain> -n --line-numbers` output.
///
/// Header lines are skipped; only lines starting with a rule number are kept.
#[must_use]
pub fn parse_rule_listing(output: &str) -> Vec<ListedRule> {
    output
        .lines()
        .filter_map(|line| {
            let (number, rest) = line.trim_start().split_once(char::is_whitespace)?;
            let index = number.parse().ok()?;
            Some(ListedRule {
                index,
                text: rest.trim().to_string(),
            })
        })
        .collect()
}

/// Runtime and packet-filter operations.
pub trait Executor: Send + Sync {
    /// All containers known to the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried. Callers must not
    /// treat this as "no containers".
    fn list_containers(&self) -> LxcResult<Vec<RuntimeContainer>>;

    /// A single container by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried.
    fn container(&self, name: &str) -> LxcResult<Option<RuntimeContainer>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .find(|c| c.name == name))
    }

    /// Create a stopped container from `image`.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime rejects the request.
    fn create_container(&self, name: &str, image: &str) -> LxcResult<()>;

    /// Pin the container's primary NIC to `ip` before it is started.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be configured.
    fn pin_ipv4(&self, name: &str, ip: Ipv4Addr) -> LxcResult<()>;

    /// Start a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started.
    fn start_container(&self, name: &str) -> LxcResult<()>;

    /// Stop a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be stopped.
    fn stop_container(&self, name: &str) -> LxcResult<()>;

    /// Delete a stopped container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be deleted.
    fn delete_container(&self, name: &str) -> LxcResult<()>;

    /// Bind-mount a host file into the container as a disk device.
    ///
    /// Succeeds if the device already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be added.
    fn mount_file(&self, name: &str, device: &str, source: &Path, target: &str) -> LxcResult<()>;

    /// Append a rule to the end of its chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be installed.
    fn append_rule(&self, rule: &FirewallRule) -> LxcResult<()>;

    /// Insert a rule at the head of its chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be installed.
    fn insert_rule(&self, rule: &FirewallRule) -> LxcResult<()>;

    /// Delete the first rule matching `rule`.
    ///
    /// # Errors
    ///
    /// Returns an error if no such rule exists or deletion fails.
    fn delete_rule(&self, rule: &FirewallRule) -> LxcResult<()>;

    /// Whether a rule matching `rule` is installed.
    ///
    /// # Errors
    ///
    /// Returns an error if the check cannot be performed.
    fn rule_exists(&self, rule: &FirewallRule) -> LxcResult<bool>;

    /// Numbered listing of a chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be listed.
    fn list_rules(&self, table: Table, chain: &str) -> LxcResult<Vec<ListedRule>>;

    /// Delete the rule at a 1-based position.
    ///
    /// # Errors
    ///
    /// Returns an error if no rule exists at `index`.
    fn delete_rule_at(&self, table: Table, chain: &str, index: usize) -> LxcResult<()>;

    /// Turn on IPv4 forwarding.
    ///
    /// # Errors
    ///
    /// Returns an error if the sysctl cannot be set.
    fn enable_ip_forwarding(&self) -> LxcResult<()>;

    /// Save the current packet-filter rules so they are restored at boot.
    ///
    /// # Errors
    ///
    /// Returns an error if no save mechanism succeeds.
    fn save_rules(&self) -> LxcResult<()>;

    /// Interface carrying the default route, if one can be determined.
    fn default_interface(&self) -> Option<String>;

    /// Replace a file the current user cannot write.
    ///
    /// # Errors
    ///
    /// Returns an error if the privileged write fails.
    fn elevated_write(&self, path: &Path, contents: &[u8]) -> LxcResult<()>;
}
