//! In-process executor that records every side effect.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use lxcompose_common::{LxcError, LxcResult, atomic_write};
use parking_lot::Mutex;

use super::{ContainerStatus, Executor, ListedRule, RuntimeContainer};
use crate::firewall::{FirewallRule, Table};

#[derive(Debug, Default)]
struct MemoryContainer {
    status: Option<ContainerStatus>,
    pinned: Option<Ipv4Addr>,
    ipv4: Option<Ipv4Addr>,
    devices: BTreeMap<String, (PathBuf, String)>,
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: BTreeMap<String, MemoryContainer>,
    chains: HashMap<(Table, String), Vec<FirewallRule>>,
    ip_forwarding: bool,
    interface: Option<String>,
    elevated_writes: Vec<PathBuf>,
    saved_rules: Option<usize>,
    fail_saves: bool,
    runtime_unavailable: bool,
    fail_mounts: bool,
    fail_rules_for_port: Option<u16>,
}

/// Executor keeping containers and chains in memory.
///
/// Started containers receive the address they were pinned to. Failures can
/// be injected to exercise rollback paths.
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    state: Mutex<MemoryState>,
}

impl MemoryExecutor {
    /// Create an empty executor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interface reported as carrying the default route.
    #[must_use]
    pub fn with_interface(self, iface: &str) -> Self {
        self.state.lock().interface = Some(iface.to_string());
        self
    }

    /// Register a container as if created outside lxcompose.
    pub fn add_container(&self, name: &str, status: ContainerStatus, ipv4: Option<Ipv4Addr>) {
        self.state.lock().containers.insert(
            name.to_string(),
            MemoryContainer {
                status: Some(status),
                pinned: ipv4,
                ipv4,
                devices: BTreeMap::new(),
            },
        );
    }

    /// Forget a container, as if deleted outside lxcompose.
    pub fn remove_container(&self, name: &str) {
        self.state.lock().containers.remove(name);
    }

    /// Change a container's live address.
    pub fn set_ipv4(&self, name: &str, ipv4: Option<Ipv4Addr>) {
        if let Some(container) = self.state.lock().containers.get_mut(name) {
            container.ipv4 = ipv4;
        }
    }

    /// Make runtime queries fail.
    pub fn set_runtime_unavailable(&self, unavailable: bool) {
        self.state.lock().runtime_unavailable = unavailable;
    }

    /// Make file mounts fail.
    pub fn fail_mounts(&self, fail: bool) {
        self.state.lock().fail_mounts = fail;
    }

    /// Make installing any rule with this destination port fail.
    pub fn fail_rules_for_port(&self, port: Option<u16>) {
        self.state.lock().fail_rules_for_port = port;
    }

    /// Installed rules of a chain, in order.
    #[must_use]
    pub fn rules(&self, table: Table, chain: &str) -> Vec<FirewallRule> {
        self.state
            .lock()
            .chains
            .get(&(table, chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of installed rules across all chains.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.state.lock().chains.values().map(Vec::len).sum()
    }

    /// Devices mounted into a container, as `(device, source, path)`.
    #[must_use]
    pub fn devices(&self, name: &str) -> Vec<(String, PathBuf, String)> {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|c| {
                c.devices
                    .iter()
                    .map(|(device, (source, path))| (device.clone(), source.clone(), path.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Address a container was pinned to.
    #[must_use]
    pub fn pinned_ipv4(&self, name: &str) -> Option<Ipv4Addr> {
        self.state.lock().containers.get(name).and_then(|c| c.pinned)
    }

    /// Whether forwarding was enabled.
    #[must_use]
    pub fn ip_forwarding(&self) -> bool {
        self.state.lock().ip_forwarding
    }

    /// Paths written through [`Executor::elevated_write`].
    #[must_use]
    pub fn elevated_writes(&self) -> Vec<PathBuf> {
        self.state.lock().elevated_writes.clone()
    }

    /// Number of rules at the last successful save, if any.
    #[must_use]
    pub fn saved_rules(&self) -> Option<usize> {
        self.state.lock().saved_rules
    }

    /// Make rule saves fail.
    pub fn fail_saves(&self, fail: bool) {
        self.state.lock().fail_saves = fail;
    }

    fn install(&self, rule: &FirewallRule, at_head: bool) -> LxcResult<()> {
        let mut state = self.state.lock();
        if rule.port.is_some() && rule.port == state.fail_rules_for_port {
            return Err(rule_failure(rule, "injected failure"));
        }
        let chain = state
            .chains
            .entry((rule.table, rule.chain.clone()))
            .or_default();
        if at_head {
            chain.insert(0, rule.clone());
        } else {
            chain.push(rule.clone());
        }
        Ok(())
    }
}

fn rule_failure(rule: &FirewallRule, reason: &str) -> LxcError {
    LxcError::ExternalCommand {
        command: format!("iptables {}", rule.spec_args().join(" ")),
        status: Some(1),
        stderr: reason.to_string(),
    }
}

fn missing_container(name: &str) -> LxcError {
    LxcError::ContainerNotFound {
        name: name.to_string(),
    }
}

impl Executor for MemoryExecutor {
    fn list_containers(&self) -> LxcResult<Vec<RuntimeContainer>> {
        let state = self.state.lock();
        if state.runtime_unavailable {
            return Err(LxcError::ExternalCommand {
                command: "lxc list --format=json".to_string(),
                status: Some(1),
                stderr: "runtime unavailable".to_string(),
            });
        }

        Ok(state
            .containers
            .iter()
            .map(|(name, c)| RuntimeContainer {
                name: name.clone(),
                status: c.status.clone().unwrap_or(ContainerStatus::Stopped),
                ipv4: c.ipv4,
            })
            .collect())
    }

    fn create_container(&self, name: &str, _image: &str) -> LxcResult<()> {
        let mut state = self.state.lock();
        if state.containers.contains_key(name) {
            return Err(LxcError::ExternalCommand {
                command: format!("lxc init {name}"),
                status: Some(1),
                stderr: "Instance name is already in use".to_string(),
            });
        }
        state.containers.insert(
            name.to_string(),
            MemoryContainer {
                status: Some(ContainerStatus::Stopped),
                ..MemoryContainer::default()
            },
        );
        Ok(())
    }

    fn pin_ipv4(&self, name: &str, ip: Ipv4Addr) -> LxcResult<()> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| missing_container(name))?;
        container.pinned = Some(ip);
        Ok(())
    }

    fn start_container(&self, name: &str) -> LxcResult<()> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| missing_container(name))?;
        container.status = Some(ContainerStatus::Running);
        container.ipv4 = container.pinned;
        Ok(())
    }

    fn stop_container(&self, name: &str) -> LxcResult<()> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| missing_container(name))?;
        container.status = Some(ContainerStatus::Stopped);
        container.ipv4 = None;
        Ok(())
    }

    fn delete_container(&self, name: &str) -> LxcResult<()> {
        self.state
            .lock()
            .containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| missing_container(name))
    }

    fn mount_file(&self, name: &str, device: &str, source: &Path, target: &str) -> LxcResult<()> {
        let mut state = self.state.lock();
        if state.fail_mounts {
            return Err(LxcError::ExternalCommand {
                command: format!("lxc config device add {name} {device} disk"),
                status: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| missing_container(name))?;
        container
            .devices
            .entry(device.to_string())
            .or_insert_with(|| (source.to_path_buf(), target.to_string()));
        Ok(())
    }

    fn append_rule(&self, rule: &FirewallRule) -> LxcResult<()> {
        self.install(rule, false)
    }

    fn insert_rule(&self, rule: &FirewallRule) -> LxcResult<()> {
        self.install(rule, true)
    }

    fn delete_rule(&self, rule: &FirewallRule) -> LxcResult<()> {
        let mut state = self.state.lock();
        let chain = state
            .chains
            .get_mut(&(rule.table, rule.chain.clone()))
            .ok_or_else(|| rule_failure(rule, "Bad rule (does a matching rule exist in that chain?)"))?;
        let position = chain
            .iter()
            .position(|r| r == rule)
            .ok_or_else(|| rule_failure(rule, "Bad rule (does a matching rule exist in that chain?)"))?;
        chain.remove(position);
        Ok(())
    }

    fn rule_exists(&self, rule: &FirewallRule) -> LxcResult<bool> {
        Ok(self
            .state
            .lock()
            .chains
            .get(&(rule.table, rule.chain.clone()))
            .is_some_and(|chain| chain.contains(rule)))
    }

    fn list_rules(&self, table: Table, chain: &str) -> LxcResult<Vec<ListedRule>> {
        Ok(self
            .rules(table, chain)
            .iter()
            .enumerate()
            .map(|(i, rule)| ListedRule {
                index: i + 1,
                text: rule.listing(),
            })
            .collect())
    }

    fn delete_rule_at(&self, table: Table, chain: &str, index: usize) -> LxcResult<()> {
        let mut state = self.state.lock();
        let rules = state
            .chains
            .get_mut(&(table, chain.to_string()))
            .filter(|rules| index >= 1 && index <= rules.len())
            .ok_or_else(|| LxcError::ExternalCommand {
                command: format!("iptables -t {} -D {chain} {index}", table.as_str()),
                status: Some(1),
                stderr: "Index of deletion too big".to_string(),
            })?;
        rules.remove(index - 1);
        Ok(())
    }

    fn enable_ip_forwarding(&self) -> LxcResult<()> {
        self.state.lock().ip_forwarding = true;
        Ok(())
    }

    fn save_rules(&self) -> LxcResult<()> {
        let mut state = self.state.lock();
        if state.fail_saves {
            return Err(LxcError::ExternalCommand {
                command: "iptables-save".to_string(),
                status: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        state.saved_rules = Some(state.chains.values().map(Vec::len).sum());
        Ok(())
    }

    fn default_interface(&self) -> Option<String> {
        self.state.lock().interface.clone()
    }

    fn elevated_write(&self, path: &Path, contents: &[u8]) -> LxcResult<()> {
        atomic_write(path, contents)?;
        self.state.lock().elevated_writes.push(path.to_path_buf());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::FORWARD_CHAIN;

    #[test]
    fn test_start_assigns_pinned_address() {
        let exec = MemoryExecutor::new();
        let ip = Ipv4Addr::new(10, 0, 3, 11);

        exec.create_container("web", "ubuntu:24.04").unwrap();
        exec.pin_ipv4("web", ip).unwrap();
        assert_eq!(exec.container("web").unwrap().unwrap().live_ip(), None);

        exec.start_container("web").unwrap();
        assert_eq!(exec.container("web").unwrap().unwrap().live_ip(), Some(ip));
    }

    #[test]
    fn test_rule_listing_and_positional_delete() {
        let exec = MemoryExecutor::new();
        let a = FirewallRule::accept(FORWARD_CHAIN).to("10.0.3.11");
        let b = FirewallRule::drop(FORWARD_CHAIN).to("10.0.3.11");
        exec.append_rule(&a).unwrap();
        exec.append_rule(&b).unwrap();

        let listed = exec.list_rules(Table::Filter, FORWARD_CHAIN).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].index, 2);
        assert!(listed[1].text.starts_with("DROP"));

        exec.delete_rule_at(Table::Filter, FORWARD_CHAIN, 1).unwrap();
        assert_eq!(exec.rules(Table::Filter, FORWARD_CHAIN), vec![b]);
        assert!(exec.delete_rule_at(Table::Filter, FORWARD_CHAIN, 5).is_err());
    }

    #[test]
    fn test_insert_goes_first() {
        let exec = MemoryExecutor::new();
        let a = FirewallRule::drop(FORWARD_CHAIN).to("10.0.3.11");
        let b = FirewallRule::accept(FORWARD_CHAIN).to("10.0.3.11");
        exec.append_rule(&a).unwrap();
        exec.insert_rule(&b).unwrap();
        assert_eq!(exec.rules(Table::Filter, FORWARD_CHAIN), vec![b, a]);
    }

    #[test]
    fn test_delete_missing_rule_fails() {
        let exec = MemoryExecutor::new();
        let rule = FirewallRule::drop(FORWARD_CHAIN);
        assert!(exec.delete_rule(&rule).is_err());
        assert!(!exec.rule_exists(&rule).unwrap());
    }

    #[test]
    fn test_runtime_unavailable() {
        let exec = MemoryExecutor::new();
        exec.set_runtime_unavailable(true);
        assert!(exec.list_containers().is_err());
    }
}
