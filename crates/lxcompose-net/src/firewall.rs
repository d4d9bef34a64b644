//! Firewall rule model and the per-container exposed-port policy.
//!
//! Rules are plain values rendered to `iptables` arguments by the
//! [`Executor`](crate::executor::Executor); nothing here touches the kernel
//! directly.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use lxcompose_common::{LxcError, LxcResult};
use serde::{Deserialize, Serialize};

use crate::executor::ListedRule;
use crate::store::NetworkIdentityStore;

/// Prefix of the comment on forward and masquerade rules.
pub const RULE_COMMENT_PREFIX: &str = "lxc-compose";

/// Chain holding per-container filter rules.
pub const FORWARD_CHAIN: &str = "FORWARD";

/// Transport protocol of a port rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol.
    #[default]
    Tcp,
    /// UDP protocol.
    Udp,
}

impl Protocol {
    /// Get the protocol string for iptables.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = LxcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(LxcError::InvalidPortSpec {
                value: format!("unknown protocol '{s}'"),
            }),
        }
    }
}

/// iptables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// The default `filter` table.
    Filter,
    /// The `nat` table.
    Nat,
}

impl Table {
    /// Table name as passed to `iptables -t`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
        }
    }
}

/// Rule target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Accept the packet.
    Accept,
    /// Drop the packet silently.
    Drop,
    /// Rewrite the destination.
    Dnat(SocketAddrV4),
    /// Rewrite the source to the outgoing interface address.
    Masquerade,
}

impl Action {
    const fn target(&self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
            Self::Dnat(_) => "DNAT",
            Self::Masquerade => "MASQUERADE",
        }
    }
}

/// How a rule is submitted to iptables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    /// `-A`: add at the end of the chain.
    Append,
    /// `-I`: add at the head of the chain.
    Insert,
    /// `-D`: delete the matching rule.
    Delete,
    /// `-C`: check whether the rule exists.
    Check,
}

impl RuleOp {
    const fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Insert => "-I",
            Self::Delete => "-D",
            Self::Check => "-C",
        }
    }
}

/// A single firewall rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    /// Table the rule lives in.
    pub table: Table,
    /// Chain the rule lives in.
    pub chain: String,
    /// Incoming interface.
    pub in_interface: Option<String>,
    /// Outgoing interface.
    pub out_interface: Option<String>,
    /// Source network/IP.
    pub source: Option<String>,
    /// Destination network/IP.
    pub destination: Option<String>,
    /// Protocol.
    pub protocol: Option<Protocol>,
    /// Destination port.
    pub port: Option<u16>,
    /// Connection tracking states, e.g. `ESTABLISHED,RELATED`.
    pub states: Option<String>,
    /// Action to take.
    pub action: Action,
    /// Rule comment.
    pub comment: Option<String>,
}

impl FirewallRule {
    fn new(table: Table, chain: &str, action: Action) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            in_interface: None,
            out_interface: None,
            source: None,
            destination: None,
            protocol: None,
            port: None,
            states: None,
            action,
            comment: None,
        }
    }

    /// Create an accept rule in the filter table.
    #[must_use]
    pub fn accept(chain: &str) -> Self {
        Self::new(Table::Filter, chain, Action::Accept)
    }

    /// Create a drop rule in the filter table.
    #[must_use]
    pub fn drop(chain: &str) -> Self {
        Self::new(Table::Filter, chain, Action::Drop)
    }

    /// Create a DNAT rule in `nat/PREROUTING`.
    #[must_use]
    pub fn dnat(to: SocketAddrV4) -> Self {
        Self::new(Table::Nat, "PREROUTING", Action::Dnat(to))
    }

    /// Create a masquerade rule in `nat/POSTROUTING`.
    #[must_use]
    pub fn masquerade() -> Self {
        Self::new(Table::Nat, "POSTROUTING", Action::Masquerade)
    }

    /// Set incoming interface.
    #[must_use]
    pub fn in_interface(mut self, iface: Option<&str>) -> Self {
        self.in_interface = iface.map(str::to_string);
        self
    }

    /// Set outgoing interface.
    #[must_use]
    pub fn out_interface(mut self, iface: Option<&str>) -> Self {
        self.out_interface = iface.map(str::to_string);
        self
    }

    /// Set source.
    #[must_use]
    pub fn from(mut self, source: impl fmt::Display) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// Set destination.
    #[must_use]
    pub fn to(mut self, destination: impl fmt::Display) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    /// Set protocol.
    #[must_use]
    pub const fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Set destination port. Only rendered when a protocol is set.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Match connection tracking states.
    #[must_use]
    pub fn states(mut self, states: &str) -> Self {
        self.states = Some(states.to_string());
        self
    }

    /// Set comment; it is prefixed with [`RULE_COMMENT_PREFIX`].
    #[must_use]
    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = Some(format!("{RULE_COMMENT_PREFIX}: {comment}"));
        self
    }

    /// Full `iptables` argument list for `op`.
    #[must_use]
    pub fn to_args(&self, op: RuleOp) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.as_str().to_string(),
            op.flag().to_string(),
            self.chain.clone(),
        ];
        args.extend(self.spec_args());
        args
    }

    /// Rule specification without table, operation and chain.
    #[must_use]
    pub fn spec_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        if let Some(iface) = &self.in_interface {
            args.extend(["-i".to_string(), iface.clone()]);
        }
        if let Some(iface) = &self.out_interface {
            args.extend(["-o".to_string(), iface.clone()]);
        }
        if let Some(src) = &self.source {
            args.extend(["-s".to_string(), src.clone()]);
        }
        if let Some(dst) = &self.destination {
            args.extend(["-d".to_string(), dst.clone()]);
        }
        if let Some(proto) = self.protocol {
            args.extend(["-p".to_string(), proto.as_str().to_string()]);
            if let Some(port) = self.port {
                args.extend(["--dport".to_string(), port.to_string()]);
            }
        }
        if let Some(states) = &self.states {
            args.extend([
                "-m".to_string(),
                "state".to_string(),
                "--state".to_string(),
                states.clone(),
            ]);
        }
        if let Some(comment) = &self.comment {
            args.extend([
                "-m".to_string(),
                "comment".to_string(),
                "--comment".to_string(),
                comment.clone(),
            ]);
        }

        args.extend(["-j".to_string(), self.action.target().to_string()]);
        if let Action::Dnat(to) = self.action {
            args.extend(["--to-destination".to_string(), to.to_string()]);
        }

        args
    }

    /// One line as `iptables -L <chain> -n` prints it, without the index column.
    #[must_use]
    pub fn listing(&self) -> String {
        let prot = self.protocol.map_or("all", |p| p.as_str());
        let source = self.source.as_deref().unwrap_or("0.0.0.0/0");
        let destination = self.destination.as_deref().unwrap_or("0.0.0.0/0");
        let mut line = format!(
            "{:<10} {:<4} --  {:<20} {:<20}",
            self.action.target(),
            prot,
            source,
            destination
        );

        if let Some(comment) = &self.comment {
            line.push_str(&format!(" /* {comment} */"));
        }
        if let (Some(proto), Some(port)) = (self.protocol, self.port) {
            line.push_str(&format!(" {proto} dpt:{port}"));
        }
        if let Some(states) = &self.states {
            line.push_str(&format!(" state {states}"));
        }
        if let Action::Dnat(to) = self.action {
            line.push_str(&format!(" to:{to}"));
        }

        line.trim_end().to_string()
    }
}

/// Whether a listed rule line names `ip` as a source or destination.
///
/// Matches whole columns, so `10.0.3.1` never matches `10.0.3.11`.
#[must_use]
pub fn listing_references(line: &str, ip: Ipv4Addr) -> bool {
    let plain = ip.to_string();
    let host = format!("{plain}/32");
    let dnat = format!("to:{plain}:");
    line.split_whitespace()
        .any(|token| token == plain || token == host || token.starts_with(&dnat))
}

/// A listing line reduced to comparable tokens. iptables may print the
/// state list in a different order than it was given.
fn normalize_listing(line: &str) -> String {
    line.split_whitespace()
        .map(|token| {
            if token.contains(',') {
                let mut parts: Vec<&str> = token.split(',').collect();
                parts.sort_unstable();
                parts.join(",")
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ports of one container that must be reachable from outside the subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedPorts {
    /// Container address.
    pub ip: Ipv4Addr,
    /// Exposed TCP ports.
    pub ports: Vec<u16>,
}

impl ExposedPorts {
    /// Create an exposed port set.
    #[must_use]
    pub fn new(ip: Ipv4Addr, ports: impl IntoIterator<Item = u16>) -> Self {
        let mut ports: Vec<u16> = ports.into_iter().collect();
        ports.sort_unstable();
        ports.dedup();
        Self { ip, ports }
    }

    /// Rule for already-established inbound connections.
    #[must_use]
    pub fn established_rule(&self) -> FirewallRule {
        FirewallRule::accept(FORWARD_CHAIN)
            .to(self.ip)
            .states("ESTABLISHED,RELATED")
    }

    /// The ordered rule set; the chain is first-match-wins.
    #[must_use]
    pub fn rules(&self) -> Vec<FirewallRule> {
        let mut rules = vec![self.established_rule()];
        rules.extend(self.ports.iter().map(|&port| {
            FirewallRule::accept(FORWARD_CHAIN)
                .to(self.ip)
                .protocol(Protocol::Tcp)
                .port(port)
        }));
        rules.push(FirewallRule::accept(FORWARD_CHAIN).from(self.ip));
        rules.push(FirewallRule::drop(FORWARD_CHAIN).to(self.ip));
        rules
    }
}

/// Installs and removes exposed-port policies.
pub struct ExposedPolicy<'a> {
    store: &'a NetworkIdentityStore,
}

impl<'a> ExposedPolicy<'a> {
    /// Create a policy manager over `store`.
    #[must_use]
    pub const fn new(store: &'a NetworkIdentityStore) -> Self {
        Self { store }
    }

    /// Install the policy for a container.
    ///
    /// The installed policy is compared with the wanted one and left alone
    /// when they match. Otherwise the old policy is deleted and the new one
    /// appended, so ports dropped from the set stop being reachable. With no
    /// ports declared the container ends up with no policy at all.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be listed, or if a port, outbound
    /// or drop rule cannot be installed. The established-connections rule is
    /// best-effort.
    pub fn apply(&self, exposed: &ExposedPorts) -> LxcResult<()> {
        let executor = self.store.executor();
        let wanted: Vec<String> = if exposed.ports.is_empty() {
            Vec::new()
        } else {
            exposed
                .rules()
                .iter()
                .map(|rule| normalize_listing(&rule.listing()))
                .collect()
        };

        let installed = self.installed(exposed.ip)?;
        let current: Vec<String> = installed
            .iter()
            .map(|rule| normalize_listing(&rule.text))
            .collect();
        if current == wanted {
            tracing::debug!(ip = %exposed.ip, "Exposed port policy already installed");
            return Ok(());
        }

        let mut indices: Vec<usize> = installed.iter().map(|rule| rule.index).collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        for index in indices {
            if let Err(e) = executor.delete_rule_at(Table::Filter, FORWARD_CHAIN, index) {
                tracing::debug!(ip = %exposed.ip, index, error = %e, "Failed to delete stale policy rule");
            }
        }

        if exposed.ports.is_empty() {
            tracing::info!(ip = %exposed.ip, "Removed exposed port policy");
            return Ok(());
        }

        tracing::info!(ip = %exposed.ip, ports = ?exposed.ports, "Setting up exposed ports");
        let established = exposed.established_rule();
        for rule in &exposed.rules() {
            if *rule == established {
                if let Err(e) = executor.append_rule(rule) {
                    tracing::warn!(ip = %exposed.ip, error = %e, "Failed to allow established connections");
                }
                continue;
            }
            executor.append_rule(rule)?;
        }

        Ok(())
    }

    /// Policy rules of `ip` in chain order. Forward rules carry a comment and
    /// are not part of the policy.
    fn installed(&self, ip: Ipv4Addr) -> LxcResult<Vec<ListedRule>> {
        Ok(self
            .store
            .executor()
            .list_rules(Table::Filter, FORWARD_CHAIN)?
            .into_iter()
            .filter(|rule| listing_references(&rule.text, ip) && !rule.text.contains("/*"))
            .collect())
    }

    /// Remove every `FORWARD` rule that references `ip`.
    ///
    /// Rules are deleted by descending index so earlier deletions do not
    /// shift later ones. Individual deletion failures are logged.
    ///
    /// # Errors
    ///
    /// Returns an error only if the chain cannot be listed.
    pub fn remove(&self, ip: Ipv4Addr) -> LxcResult<usize> {
        let executor = self.store.executor();
        let listed = executor.list_rules(Table::Filter, FORWARD_CHAIN)?;

        let mut indices: Vec<usize> = listed
            .iter()
            .filter(|rule| listing_references(&rule.text, ip))
            .map(|rule| rule.index)
            .collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));

        let mut removed = 0;
        for index in indices {
            match executor.delete_rule_at(Table::Filter, FORWARD_CHAIN, index) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(%ip, index, error = %e, "Failed to delete rule"),
            }
        }

        tracing::debug!(%ip, removed, "Removed container firewall rules");
        Ok(removed)
    }
}
