//! Executor backed by the `lxc`, `iptables` and `sysctl` binaries.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Command;

use lxcompose_common::{LxcError, LxcResult, atomic_write};
use serde::Deserialize;
use tempfile::NamedTempFile;

use super::{ContainerStatus, Executor, ListedRule, RuntimeContainer, parse_rule_listing};
use crate::firewall::{FirewallRule, RuleOp, Table};

/// Primary NIC name inside containers.
const PRIMARY_NIC: &str = "eth0";

/// Where `iptables-save` output goes when `netfilter-persistent` is missing.
pub const IPTABLES_RULES_PATH: &str = "/etc/iptables/rules.v4";

/// Runs real commands, prefixing privileged ones with `sudo` when not root.
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    sudo: bool,
}

impl SystemExecutor {
    /// Create an executor for the current user.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sudo: !rustix::process::geteuid().is_root(),
        }
    }

    fn command(&self, program: &str, privileged: bool) -> Command {
        if privileged && self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        }
    }

    fn run<S: AsRef<str>>(&self, program: &str, args: &[S], privileged: bool) -> LxcResult<String> {
        let command_line = render_command(program, args);
        tracing::debug!(command = %command_line, "Running command");

        let output = self
            .command(program, privileged)
            .args(args.iter().map(AsRef::as_ref))
            .output()
            .map_err(|e| LxcError::ExternalCommand {
                command: command_line.clone(),
                status: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(LxcError::ExternalCommand {
                command: command_line,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn lxc<S: AsRef<str>>(&self, args: &[S]) -> LxcResult<String> {
        self.run("lxc", args, false)
    }

    fn iptables(&self, args: &[String]) -> LxcResult<String> {
        self.run("iptables", args, true)
    }
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn render_command<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg.as_ref());
    }
    line
}

#[derive(Debug, Deserialize)]
struct LxcListEntry {
    name: String,
    status: String,
    #[serde(default)]
    state: Option<LxcState>,
}

#[derive(Debug, Deserialize)]
struct LxcState {
    #[serde(default)]
    network: Option<BTreeMap<String, LxcNic>>,
}

#[derive(Debug, Deserialize)]
struct LxcNic {
    #[serde(default)]
    addresses: Vec<LxcAddress>,
}

#[derive(Debug, Deserialize)]
struct LxcAddress {
    family: String,
    address: String,
}

/// Parse `lxc list --format=json` output.
pub(crate) fn parse_lxc_list(json: &str) -> LxcResult<Vec<RuntimeContainer>> {
    let entries: Vec<LxcListEntry> = serde_json::from_str(json)?;

    Ok(entries
        .into_iter()
        .map(|entry| {
            let ipv4 = entry
                .state
                .and_then(|state| state.network)
                .and_then(|nics| {
                    nics.into_iter()
                        .filter(|(iface, _)| iface != "lo")
                        .flat_map(|(_, nic)| nic.addresses)
                        .filter(|addr| addr.family == "inet")
                        .find_map(|addr| addr.address.parse::<Ipv4Addr>().ok())
                });

            RuntimeContainer {
                name: entry.name,
                status: ContainerStatus::parse(&entry.status),
                ipv4,
            }
        })
        .collect())
}

/// Extract the interface from `ip route show default` output.
pub(crate) fn parse_default_route(output: &str) -> Option<String> {
    let mut tokens = output.lines().next()?.split_whitespace();
    tokens.find(|t| *t == "dev")?;
    tokens.next().map(str::to_string)
}

impl Executor for SystemExecutor {
    fn list_containers(&self) -> LxcResult<Vec<RuntimeContainer>> {
        let output = self.lxc(&["list", "--format=json"])?;
        parse_lxc_list(&output)
    }

    fn create_container(&self, name: &str, image: &str) -> LxcResult<()> {
        tracing::info!(name, image, "Creating container");
        self.lxc(&["init", image, name])?;
        Ok(())
    }

    fn pin_ipv4(&self, name: &str, ip: Ipv4Addr) -> LxcResult<()> {
        let setting = format!("ipv4.address={ip}");
        // Override fails once the device is already local to the instance.
        if let Err(e) = self.lxc(&["config", "device", "override", name, PRIMARY_NIC, setting.as_str()]) {
            tracing::debug!(name, error = %e, "Device override failed, updating in place");
            self.lxc(&["config", "device", "set", name, PRIMARY_NIC, setting.as_str()])?;
        }
        tracing::debug!(name, %ip, "Pinned container address");
        Ok(())
    }

    fn start_container(&self, name: &str) -> LxcResult<()> {
        self.lxc(&["start", name])?;
        Ok(())
    }

    fn stop_container(&self, name: &str) -> LxcResult<()> {
        self.lxc(&["stop", name])?;
        Ok(())
    }

    fn delete_container(&self, name: &str) -> LxcResult<()> {
        self.lxc(&["delete", name])?;
        Ok(())
    }

    fn mount_file(&self, name: &str, device: &str, source: &Path, target: &str) -> LxcResult<()> {
        let source_arg = format!("source={}", source.display());
        let path_arg = format!("path={target}");
        match self.lxc(&["config", "device", "add", name, device, "disk", source_arg.as_str(), path_arg.as_str()]) {
            Ok(_) => Ok(()),
            Err(LxcError::ExternalCommand { stderr, .. }) if stderr.contains("already exists") => {
                tracing::debug!(name, device, "Device already present");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn append_rule(&self, rule: &FirewallRule) -> LxcResult<()> {
        self.iptables(&rule.to_args(RuleOp::Append))?;
        Ok(())
    }

    fn insert_rule(&self, rule: &FirewallRule) -> LxcResult<()> {
        self.iptables(&rule.to_args(RuleOp::Insert))?;
        Ok(())
    }

    fn delete_rule(&self, rule: &FirewallRule) -> LxcResult<()> {
        self.iptables(&rule.to_args(RuleOp::Delete))?;
        Ok(())
    }

    fn rule_exists(&self, rule: &FirewallRule) -> LxcResult<bool> {
        match self.iptables(&rule.to_args(RuleOp::Check)) {
            Ok(_) => Ok(true),
            Err(LxcError::ExternalCommand {
                status: Some(1), ..
            }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list_rules(&self, table: Table, chain: &str) -> LxcResult<Vec<ListedRule>> {
        let args = [
            "-t".to_string(),
            table.as_str().to_string(),
            "-L".to_string(),
            chain.to_string(),
            "-n".to_string(),
            "--line-numbers".to_string(),
        ];
        let output = self.iptables(&args)?;
        Ok(parse_rule_listing(&output))
    }

    fn delete_rule_at(&self, table: Table, chain: &str, index: usize) -> LxcResult<()> {
        let args = [
            "-t".to_string(),
            table.as_str().to_string(),
            "-D".to_string(),
            chain.to_string(),
            index.to_string(),
        ];
        self.iptables(&args)?;
        Ok(())
    }

    fn enable_ip_forwarding(&self) -> LxcResult<()> {
        self.run("sysctl", &["-w", "net.ipv4.ip_forward=1"], true)?;
        tracing::info!("IP forwarding enabled");
        Ok(())
    }

    fn save_rules(&self) -> LxcResult<()> {
        match self.run("netfilter-persistent", &["save"], true) {
            Ok(_) => {
                tracing::info!("Saved firewall rules with netfilter-persistent");
                return Ok(());
            }
            Err(e) => tracing::debug!(error = %e, "netfilter-persistent unavailable"),
        }

        let dump = self.run::<&str>("iptables-save", &[], true)?;
        self.elevated_write(Path::new(IPTABLES_RULES_PATH), dump.as_bytes())?;
        tracing::info!(path = IPTABLES_RULES_PATH, "Saved firewall rules");
        Ok(())
    }

    fn default_interface(&self) -> Option<String> {
        match self.run("ip", &["route", "show", "default"], false) {
            Ok(output) => parse_default_route(&output),
            Err(e) => {
                tracing::debug!(error = %e, "Could not determine default interface");
                None
            }
        }
    }

    fn elevated_write(&self, path: &Path, contents: &[u8]) -> LxcResult<()> {
        use std::os::unix::fs::PermissionsExt;

        if !self.sudo {
            atomic_write(path, contents)?;
            return Ok(());
        }

        let mode = std::fs::metadata(path).map_or(0o644, |m| m.permissions().mode() & 0o7777);

        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(contents)?;
        tmp.as_file().sync_all()?;

        let target = path.display().to_string();
        let staged = format!("{target}.lxcompose-new");
        if let Some(parent) = path.parent() {
            let parent = parent.display().to_string();
            self.run("mkdir", &["-p", parent.as_str()], true)?;
        }
        let tmp_path = tmp.path().display().to_string();
        let mode = format!("{mode:o}");
        self.run(
            "install",
            &["-m", mode.as_str(), tmp_path.as_str(), staged.as_str()],
            true,
        )?;
        self.run("mv", &["-f", staged.as_str(), target.as_str()], true)?;

        tracing::debug!(path = %target, "File replaced with elevated privileges");
        Ok(())
    }
}
