//! Host port forwarding to containers.
//!
//! Each forward is persisted in the port-forward registry and realized as
//! three rules: a DNAT in `nat/PREROUTING`, an accept for the forwarded
//! traffic at the head of `FORWARD`, and a shared masquerade for the
//! container subnet. The registry is the source of truth; `apply_all`
//! rebuilds the kernel side from it after a reboot.

use std::net::{Ipv4Addr, SocketAddrV4};

use lxcompose_common::{ContainerName, LxcError, LxcResult};
use serde::{Deserialize, Serialize};

use crate::firewall::{FORWARD_CHAIN, FirewallRule, Protocol};
use crate::store::NetworkIdentityStore;

/// A persisted port forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    /// Host port.
    #[serde(alias = "hostPort")]
    pub host_port: u16,
    /// Target container.
    #[serde(alias = "containerName")]
    pub container_name: String,
    /// Last known container address.
    #[serde(alias = "containerIP")]
    pub container_ip: Ipv4Addr,
    /// Container port.
    #[serde(alias = "containerPort")]
    pub container_port: u16,
    /// Protocol.
    #[serde(default)]
    pub protocol: Protocol,
    /// Free-form description, also used as the rule comment.
    #[serde(default)]
    pub description: String,
}

impl PortForward {
    /// Whether this forward already serves `request`.
    #[must_use]
    pub fn same_target(&self, request: &ForwardRequest) -> bool {
        self.container_name == request.container
            && self.container_port == request.container_port
    }

    fn comment(&self) -> String {
        if self.description.is_empty() {
            format!("{}:{}", self.container_name, self.container_port)
        } else {
            self.description.clone()
        }
    }

    /// DNAT rule for this forward.
    #[must_use]
    pub fn dnat_rule(&self, interface: Option<&str>) -> FirewallRule {
        FirewallRule::dnat(SocketAddrV4::new(self.container_ip, self.container_port))
            .in_interface(interface)
            .protocol(self.protocol)
            .port(self.host_port)
            .comment(&self.comment())
    }

    /// Accept rule for the forwarded traffic.
    #[must_use]
    pub fn accept_rule(&self) -> FirewallRule {
        FirewallRule::accept(FORWARD_CHAIN)
            .to(self.container_ip)
            .protocol(self.protocol)
            .port(self.container_port)
            .states("NEW,ESTABLISHED,RELATED")
            .comment(&self.comment())
    }
}

/// A request to forward a host port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    /// Host port.
    pub host_port: u16,
    /// Target container.
    pub container: String,
    /// Container port.
    pub container_port: u16,
    /// Protocol.
    pub protocol: Protocol,
    /// Optional description.
    pub description: Option<String>,
}

impl ForwardRequest {
    /// Create a TCP forward request.
    #[must_use]
    pub fn tcp(host_port: u16, container: &str, container_port: u16) -> Self {
        Self {
            host_port,
            container: container.to_string(),
            container_port,
            protocol: Protocol::Tcp,
            description: None,
        }
    }

    /// Create a UDP forward request.
    #[must_use]
    pub fn udp(host_port: u16, container: &str, container_port: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            ..Self::tcp(host_port, container, container_port)
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    List(Vec<PortForward>),
    Wrapped { forwards: Vec<PortForward> },
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl From<RegistryFile> for Vec<PortForward> {
    fn from(file: RegistryFile) -> Self {
        match file {
            RegistryFile::List(forwards) | RegistryFile::Wrapped { forwards } => forwards,
        }
    }
}

/// Outcome of [`PortForwarder::apply_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Forwards reinstalled.
    pub applied: usize,
    /// Forwards that could not be reinstalled, with the reason.
    pub failed: Vec<(u16, Protocol, String)>,
}

impl ApplyReport {
    /// Whether every forward was reinstalled.
    #[must_use]
    pub fn all_applied(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Manages the port-forward registry and its rules.
pub struct PortForwarder<'a> {
    store: &'a NetworkIdentityStore,
}

impl<'a> PortForwarder<'a> {
    /// Create a forwarder over `store`.
    #[must_use]
    pub const fn new(store: &'a NetworkIdentityStore) -> Self {
        Self { store }
    }

    fn load(&self) -> LxcResult<Vec<PortForward>> {
        let file: RegistryFile = self.store.read_json(&self.store.paths().port_forwards())?;
        Ok(file.into())
    }

    fn save(&self, forwards: &[PortForward]) -> LxcResult<()> {
        self.store
            .write_json(&self.store.paths().port_forwards(), forwards)
    }

    fn live_ip(&self, name: &str) -> LxcResult<Ipv4Addr> {
        self.store
            .executor()
            .container(name)?
            .and_then(|c| c.live_ip())
            .ok_or_else(|| LxcError::ContainerNotRunning {
                name: name.to_string(),
            })
    }

    fn masquerade_rule(&self, interface: Option<&str>) -> FirewallRule {
        FirewallRule::masquerade()
            .from(self.store.subnet())
            .out_interface(interface)
            .comment("masquerade")
    }

    /// Install the masquerade rule unless present.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be checked or installed.
    pub fn ensure_masquerade(&self) -> LxcResult<()> {
        let executor = self.store.executor();
        let rule = self.masquerade_rule(executor.default_interface().as_deref());
        if !executor.rule_exists(&rule)? {
            executor.append_rule(&rule)?;
            tracing::debug!(subnet = %self.store.subnet(), "Installed masquerade rule");
        }
        Ok(())
    }

    /// Install the rules of one forward, skipping any already present.
    ///
    /// On failure, whatever this call installed is removed again.
    fn install(&self, forward: &PortForward) -> LxcResult<()> {
        let executor = self.store.executor();
        let interface = executor.default_interface();
        let dnat = forward.dnat_rule(interface.as_deref());
        let accept = forward.accept_rule();

        let mut installed = Vec::new();
        let result = (|| {
            if !executor.rule_exists(&dnat)? {
                executor.append_rule(&dnat)?;
                installed.push(&dnat);
            }
            if !executor.rule_exists(&accept)? {
                executor.insert_rule(&accept)?;
                installed.push(&accept);
            }
            self.ensure_masquerade()
        })();

        if let Err(e) = result {
            for rule in installed {
                if let Err(cleanup) = executor.delete_rule(rule) {
                    tracing::debug!(host_port = forward.host_port, error = %cleanup, "Failed to undo rule");
                }
            }
            return Err(e);
        }

        tracing::debug!(
            host_port = forward.host_port,
            protocol = %forward.protocol,
            container = %forward.container_name,
            container_ip = %forward.container_ip,
            container_port = forward.container_port,
            "Installed forward rules"
        );
        Ok(())
    }

    /// Remove the rules of one forward. Missing rules are ignored.
    fn uninstall(&self, forward: &PortForward) {
        let executor = self.store.executor();
        let interface = executor.default_interface();
        for rule in [forward.dnat_rule(interface.as_deref()), forward.accept_rule()] {
            if let Err(e) = executor.delete_rule(&rule) {
                tracing::debug!(host_port = forward.host_port, error = %e, "Rule already absent");
            }
        }
    }

    /// Forward a host port to a container.
    ///
    /// Re-adding an identical forward is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LxcError::InvalidPortSpec`] if either port is 0,
    /// [`LxcError::FirewallRuleConflict`] if the host port and
    /// protocol are already forwarded elsewhere,
    /// [`LxcError::ContainerNotRunning`] if the container has no live
    /// address, or the firewall error if installing rules fails. The registry
    /// is only updated once every rule is in place.
    pub fn add(&self, request: &ForwardRequest) -> LxcResult<PortForward> {
        let name = ContainerName::new(request.container.as_str())?;
        if request.host_port == 0 || request.container_port == 0 {
            return Err(LxcError::InvalidPortSpec {
                value: format!("{}:{}", request.host_port, request.container_port),
            });
        }
        let path = self.store.paths().port_forwards();
        let _lock = self.store.lock(&path)?;
        let mut forwards = self.load()?;

        if let Some(existing) = forwards
            .iter()
            .find(|f| f.host_port == request.host_port && f.protocol == request.protocol)
        {
            if existing.same_target(request) {
                tracing::debug!(host_port = request.host_port, "Forward already registered");
                return Ok(existing.clone());
            }
            return Err(LxcError::FirewallRuleConflict {
                host_port: request.host_port,
                protocol: request.protocol.to_string(),
                owner: format!("{}:{}", existing.container_name, existing.container_port),
            });
        }

        let forward = PortForward {
            host_port: request.host_port,
            container_name: name.to_string(),
            container_ip: self.live_ip(name.as_str())?,
            container_port: request.container_port,
            protocol: request.protocol,
            description: request.description.clone().unwrap_or_default(),
        };

        self.install(&forward)?;
        forwards.push(forward.clone());
        if let Err(e) = self.save(&forwards) {
            self.uninstall(&forward);
            return Err(e);
        }

        tracing::info!(
            host_port = forward.host_port,
            protocol = %forward.protocol,
            container = %forward.container_name,
            container_port = forward.container_port,
            "Added port forward"
        );
        Ok(forward)
    }

    /// Remove the forward for a host port.
    ///
    /// # Errors
    ///
    /// Returns [`LxcError::ForwardNotFound`] if nothing is forwarded on that
    /// port, or an error if the registry cannot be updated.
    pub fn remove(&self, host_port: u16, protocol: Protocol) -> LxcResult<PortForward> {
        let path = self.store.paths().port_forwards();
        let _lock = self.store.lock(&path)?;
        let mut forwards = self.load()?;

        let position = forwards
            .iter()
            .position(|f| f.host_port == host_port && f.protocol == protocol)
            .ok_or_else(|| LxcError::ForwardNotFound {
                host_port,
                protocol: protocol.to_string(),
            })?;

        let forward = forwards.remove(position);
        self.uninstall(&forward);
        self.save(&forwards)?;

        tracing::info!(host_port, %protocol, "Removed port forward");
        Ok(forward)
    }

    /// Remove every forward targeting `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be updated.
    pub fn remove_for_container(&self, name: &str) -> LxcResult<Vec<PortForward>> {
        let path = self.store.paths().port_forwards();
        let _lock = self.store.lock(&path)?;
        let forwards = self.load()?;

        let (removed, kept): (Vec<_>, Vec<_>) = forwards
            .into_iter()
            .partition(|f| f.container_name == name);
        if removed.is_empty() {
            return Ok(removed);
        }

        for forward in &removed {
            self.uninstall(forward);
        }
        self.save(&kept)?;

        tracing::info!(container = name, count = removed.len(), "Removed container forwards");
        Ok(removed)
    }

    /// Move `name`'s forwards to its current live address.
    ///
    /// Returns whether anything changed. Between removing the old rules and
    /// installing the new ones the mapping is briefly unavailable.
    ///
    /// # Errors
    ///
    /// Returns [`LxcError::ContainerNotRunning`] if the container has no live
    /// address, or an error if rules or the registry cannot be updated.
    pub fn update_ip(&self, name: &str) -> LxcResult<bool> {
        let path = self.store.paths().port_forwards();
        let _lock = self.store.lock(&path)?;
        let mut forwards = self.load()?;
        let new_ip = self.live_ip(name)?;

        let mut updated = false;
        for forward in forwards
            .iter_mut()
            .filter(|f| f.container_name == name && f.container_ip != new_ip)
        {
            self.uninstall(forward);
            forward.container_ip = new_ip;
            self.install(forward)?;
            updated = true;
        }

        if updated {
            self.save(&forwards)?;
            tracing::info!(container = name, ip = %new_ip, "Updated forwards to new address");
        }
        Ok(updated)
    }

    /// Reinstall every persisted forward with refreshed addresses.
    ///
    /// Enables IPv4 forwarding first. Forwards whose container has no live
    /// address keep their last known address and are reported as failed.
    ///
    /// # Errors
    ///
    /// Returns an error only if the registry cannot be read or written.
    pub fn apply_all(&self) -> LxcResult<ApplyReport> {
        let executor = self.store.executor();
        if let Err(e) = executor.enable_ip_forwarding() {
            tracing::warn!(error = %e, "Failed to enable IP forwarding");
        }

        let path = self.store.paths().port_forwards();
        let _lock = self.store.lock(&path)?;
        let mut forwards = self.load()?;
        let mut report = ApplyReport::default();

        for forward in &mut forwards {
            let result = self.live_ip(&forward.container_name).and_then(|ip| {
                forward.container_ip = ip;
                self.install(forward)
            });
            match result {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    tracing::warn!(host_port = forward.host_port, error = %e, "Failed to apply forward");
                    report
                        .failed
                        .push((forward.host_port, forward.protocol, e.to_string()));
                }
            }
        }

        self.save(&forwards)?;
        tracing::info!(applied = report.applied, failed = report.failed.len(), "Applied port forwards");
        Ok(report)
    }

    /// Save the installed rules so they survive a reboot.
    ///
    /// Best-effort: a failure is logged and reported as `false`. The registry
    /// stays the source of truth either way.
    #[must_use]
    pub fn save_rules(&self) -> bool {
        match self.store.executor().save_rules() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to save firewall rules");
                false
            }
        }
    }

    /// Every persisted forward.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub fn list(&self) -> LxcResult<Vec<PortForward>> {
        self.load()
    }

    /// Forwards targeting `container`, or all of them.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub fn show(&self, container: Option<&str>) -> LxcResult<Vec<PortForward>> {
        let mut forwards = self.load()?;
        if let Some(name) = container {
            forwards.retain(|f| f.container_name == name);
        }
        Ok(forwards)
    }

    /// Remove every forward and its rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be updated.
    pub fn clear_all(&self) -> LxcResult<usize> {
        let path = self.store.paths().port_forwards();
        let _lock = self.store.lock(&path)?;
        let forwards = self.load()?;

        for forward in &forwards {
            self.uninstall(forward);
        }
        self.save(&[])?;

        tracing::info!(count = forwards.len(), "Cleared all port forwards");
        Ok(forwards.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ContainerStatus, Executor, MemoryExecutor};
    use crate::firewall::Table;
    use lxcompose_common::{ComposePaths, FileLocker};
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, Arc<MemoryExecutor>, NetworkIdentityStore) {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(MemoryExecutor::new().with_interface("eth0"));
        exec.add_container("web", ContainerStatus::Running, Some(Ipv4Addr::new(10, 0, 3, 11)));
        let store = NetworkIdentityStore::new(ComposePaths::with_root(dir.path()), exec.clone())
            .with_locker(FileLocker::memory());
        (dir, exec, store)
    }

    #[test]
    fn test_add_installs_rules() {
        let (_dir, exec, store) = setup();
        let forward = store
            .forwards()
            .add(&ForwardRequest::tcp(8080, "web", 80))
            .unwrap();

        assert_eq!(forward.container_ip, Ipv4Addr::new(10, 0, 3, 11));
        assert_eq!(exec.rules(Table::Nat, "PREROUTING").len(), 1);
        assert_eq!(exec.rules(Table::Nat, "POSTROUTING").len(), 1);
        assert_eq!(exec.rules(Table::Filter, FORWARD_CHAIN).len(), 1);
        assert_eq!(store.forwards().list().unwrap(), vec![forward]);
    }

    #[test]
    fn test_readd_is_noop() {
        let (_dir, exec, store) = setup();
        let forwarder = store.forwards();
        forwarder.add(&ForwardRequest::tcp(8080, "web", 80)).unwrap();
        forwarder.add(&ForwardRequest::tcp(8080, "web", 80)).unwrap();

        assert_eq!(forwarder.list().unwrap().len(), 1);
        assert_eq!(exec.rule_count(), 3);
    }

    #[test]
    fn test_same_port_other_protocol_is_allowed() {
        let (_dir, _exec, store) = setup();
        let forwarder = store.forwards();
        forwarder.add(&ForwardRequest::tcp(5353, "web", 53)).unwrap();
        forwarder.add(&ForwardRequest::udp(5353, "web", 53)).unwrap();
        assert_eq!(forwarder.list().unwrap().len(), 2);
    }

    #[test]
    fn test_not_running_container() {
        let (_dir, exec, store) = setup();
        exec.add_container("db", ContainerStatus::Stopped, None);
        let err = store
            .forwards()
            .add(&ForwardRequest::tcp(5432, "db", 5432))
            .unwrap_err();
        assert!(matches!(err, LxcError::ContainerNotRunning { .. }));
        assert!(store.forwards().list().unwrap().is_empty());
        assert_eq!(exec.rule_count(), 0);
    }

    #[test]
    fn test_port_zero_is_rejected() {
        let (_dir, exec, store) = setup();
        let forwarder = store.forwards();

        for request in [
            ForwardRequest::tcp(0, "web", 80),
            ForwardRequest::tcp(8080, "web", 0),
        ] {
            let err = forwarder.add(&request).unwrap_err();
            assert!(matches!(err, LxcError::InvalidPortSpec { .. }));
        }
        assert!(forwarder.list().unwrap().is_empty());
        assert_eq!(exec.rule_count(), 0);
    }

    #[test]
    fn test_failed_install_rolls_back() {
        let (_dir, exec, store) = setup();
        exec.fail_rules_for_port(Some(80));

        // DNAT matches the host port and succeeds; the accept rule matches 80
        assert!(store.forwards().add(&ForwardRequest::tcp(8080, "web", 80)).is_err());
        assert_eq!(exec.rule_count(), 0);
        assert!(store.forwards().list().unwrap().is_empty());
    }

    #[test]
    fn test_remove() {
        let (_dir, exec, store) = setup();
        let forwarder = store.forwards();
        forwarder.add(&ForwardRequest::tcp(8080, "web", 80)).unwrap();

        let removed = forwarder.remove(8080, Protocol::Tcp).unwrap();
        assert_eq!(removed.host_port, 8080);
        assert!(forwarder.list().unwrap().is_empty());
        // Masquerade is shared and stays
        assert_eq!(exec.rule_count(), 1);

        assert!(matches!(
            forwarder.remove(8080, Protocol::Tcp),
            Err(LxcError::ForwardNotFound { .. })
        ));
    }

    #[test]
    fn test_update_ip() {
        let (_dir, exec, store) = setup();
        let forwarder = store.forwards();
        forwarder.add(&ForwardRequest::tcp(8080, "web", 80)).unwrap();
        assert!(!forwarder.update_ip("web").unwrap());

        let new_ip = Ipv4Addr::new(10, 0, 3, 42);
        exec.set_ipv4("web", Some(new_ip));
        assert!(forwarder.update_ip("web").unwrap());

        assert_eq!(forwarder.list().unwrap()[0].container_ip, new_ip);
        let dnat = &exec.rules(Table::Nat, "PREROUTING")[0];
        assert_eq!(dnat.action, crate::firewall::Action::Dnat(SocketAddrV4::new(new_ip, 80)));
        assert_eq!(exec.rule_count(), 3);
    }

    #[test]
    fn test_apply_all_after_reboot() {
        let (dir, _exec, store) = setup();
        store.forwards().add(&ForwardRequest::tcp(8080, "web", 80)).unwrap();

        // Fresh kernel state, same registry
        let exec = Arc::new(MemoryExecutor::new());
        exec.add_container("web", ContainerStatus::Running, Some(Ipv4Addr::new(10, 0, 3, 11)));
        let rebooted = NetworkIdentityStore::new(ComposePaths::with_root(dir.path()), exec.clone())
            .with_locker(FileLocker::memory());

        let report = rebooted.forwards().apply_all().unwrap();
        assert!(report.all_applied());
        assert!(exec.ip_forwarding());
        assert_eq!(exec.rule_count(), 3);

        // Idempotent
        rebooted.forwards().apply_all().unwrap();
        assert_eq!(exec.rule_count(), 3);
    }

    #[test]
    fn test_apply_all_reports_missing_containers() {
        let (_dir, exec, store) = setup();
        store.forwards().add(&ForwardRequest::tcp(8080, "web", 80)).unwrap();
        exec.stop_container("web").unwrap();

        let report = store.forwards().apply_all().unwrap();
        assert!(!report.all_applied());
        assert_eq!(report.failed[0].0, 8080);
        assert_eq!(store.forwards().list().unwrap().len(), 1);
    }

    #[test]
    fn test_save_rules_is_best_effort() {
        let (_dir, exec, store) = setup();
        let forwarder = store.forwards();
        forwarder.add(&ForwardRequest::tcp(8080, "web", 80)).unwrap();

        assert!(forwarder.save_rules());
        assert_eq!(exec.saved_rules(), Some(3));

        exec.fail_saves(true);
        assert!(!forwarder.save_rules());
        assert_eq!(exec.saved_rules(), Some(3));
    }

    #[test]
    fn test_show_and_clear() {
        let (_dir, exec, store) = setup();
        exec.add_container("api", ContainerStatus::Running, Some(Ipv4Addr::new(10, 0, 3, 12)));
        let forwarder = store.forwards();
        forwarder.add(&ForwardRequest::tcp(8080, "web", 80)).unwrap();
        forwarder.add(&ForwardRequest::tcp(9090, "api", 90)).unwrap();

        assert_eq!(forwarder.show(Some("api")).unwrap().len(), 1);
        assert_eq!(forwarder.show(None).unwrap().len(), 2);

        assert_eq!(forwarder.clear_all().unwrap(), 2);
        assert!(forwarder.list().unwrap().is_empty());
        assert_eq!(exec.rules(Table::Filter, FORWARD_CHAIN).len(), 0);
    }

    #[test]
    fn test_reads_wrapped_registry() {
        let (_dir, _exec, store) = setup();
        std::fs::create_dir_all(store.paths().root.clone()).unwrap();
        std::fs::write(
            store.paths().port_forwards(),
            r#"{"forwards":[{"host_port":8080,"container_name":"web","container_ip":"10.0.3.11","container_port":80,"protocol":"tcp","description":""}]}"#,
        )
        .unwrap();
        assert_eq!(store.forwards().list().unwrap().len(), 1);
    }

    #[test]
    fn test_reads_camel_case_registry() {
        let json = r#"[{"hostPort":8080,"containerName":"web","containerIP":"10.0.3.11","containerPort":80,"protocol":"udp","description":"dns"}]"#;
        let file: RegistryFile = serde_json::from_str(json).unwrap();
        let forwards: Vec<PortForward> = file.into();
        assert_eq!(forwards[0].protocol, Protocol::Udp);
        assert_eq!(forwards[0].container_ip, Ipv4Addr::new(10, 0, 3, 11));
    }
}
