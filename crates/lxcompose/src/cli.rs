//! lxc-compose CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use console::style;
use lxcompose_common::ComposePaths;
use lxcompose_net::ipam::DEFAULT_START;
use lxcompose_net::{
    ContainerNetworkRecord, ForwardRequest, HostsTarget, NetworkIdentityStore, PortForward,
    Protocol, Subnet, SystemExecutor,
};
use tabled::{Table, Tabled};

use crate::orchestrator::Orchestrator;
use crate::spec::ComposeFile;

/// lxc-compose - declarative LXC containers with stable addresses
#[derive(Parser)]
#[command(name = "lxc-compose")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Container subnet (a /24)
    #[arg(long, global = true, env = "LXC_COMPOSE_SUBNET", default_value = "10.0.3.0/24")]
    pub subnet: Subnet,

    /// First host suffix handed out; lower suffixes are reserved
    #[arg(
        long,
        global = true,
        env = "LXC_COMPOSE_IP_START",
        default_value_t = DEFAULT_START,
        value_parser = clap::value_parser!(u8).range(2..=254)
    )]
    pub start: u8,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// lxc-compose commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create and start containers
    Up {
        /// Path to the compose file
        #[arg(short, long, default_value = "lxc-compose.yml")]
        file: PathBuf,

        /// Seconds to wait for each container to obtain an address
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Stop containers, keeping their addresses
    Down {
        /// Path to the compose file
        #[arg(short, long, default_value = "lxc-compose.yml")]
        file: PathBuf,
    },

    /// Stop and delete containers and release their addresses
    Destroy {
        /// Path to the compose file
        #[arg(short, long, default_value = "lxc-compose.yml")]
        file: PathBuf,
    },

    /// List containers and their network state
    List {
        /// Only show containers of this compose file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Manage host port forwards
    Port {
        /// The port subcommand.
        #[command(subcommand)]
        command: PortCommands,
    },

    /// Inspect managed hosts entries
    Hosts {
        /// The hosts subcommand.
        #[command(subcommand)]
        command: HostsCommands,
    },
}

/// `port` subcommands.
#[derive(Subcommand)]
pub enum PortCommands {
    /// Forward a host port to a container port
    Add {
        /// Host port
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        host_port: u16,
        /// Target container
        container: String,
        /// Container port
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        container_port: u16,
        /// Protocol (tcp or udp)
        #[arg(short, long, default_value = "tcp")]
        protocol: Protocol,
        /// Description shown in listings and rule comments
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Remove a forward
    Remove {
        /// Host port
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        host_port: u16,
        /// Protocol (tcp or udp)
        #[arg(short, long, default_value = "tcp")]
        protocol: Protocol,
    },

    /// List all forwards
    List,

    /// Show forwards, optionally for one container
    Show {
        /// Container name
        container: Option<String>,
    },

    /// Remove all forwards
    Clear,

    /// Reinstall all forwards, e.g. after a reboot
    Apply {
        /// Also save the installed rules so they survive a reboot
        #[arg(long)]
        save: bool,
    },

    /// Save the installed firewall rules so they survive a reboot
    Save,

    /// Point a container's forwards at its current address
    Update {
        /// Container name
        container: String,
    },
}

/// `hosts` subcommands.
#[derive(Subcommand)]
pub enum HostsCommands {
    /// List managed entries of both hosts files
    List,

    /// Restore the host hosts file from the backup taken before the first change
    Restore,
}

#[derive(Tabled)]
struct ForwardRow {
    #[tabled(rename = "HOST PORT")]
    host_port: u16,
    #[tabled(rename = "PROTOCOL")]
    protocol: String,
    #[tabled(rename = "CONTAINER")]
    container: String,
    #[tabled(rename = "CONTAINER IP")]
    container_ip: String,
    #[tabled(rename = "CONTAINER PORT")]
    container_port: u16,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
}

impl From<&PortForward> for ForwardRow {
    fn from(f: &PortForward) -> Self {
        Self {
            host_port: f.host_port,
            protocol: f.protocol.to_string(),
            container: f.container_name.clone(),
            container_ip: f.container_ip.to_string(),
            container_port: f.container_port,
            description: f.description.clone(),
        }
    }
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "EXPOSED")]
    exposed: String,
    #[tabled(rename = "FORWARDS")]
    forwards: String,
    #[tabled(rename = "NOTES")]
    notes: String,
}

impl From<&ContainerNetworkRecord> for ContainerRow {
    fn from(r: &ContainerNetworkRecord) -> Self {
        let mut notes = Vec::new();
        if r.is_orphan() {
            notes.push("not in runtime".to_string());
        }
        if r.ip_mismatch() {
            if let Some(live) = r.runtime.as_ref().and_then(|c| c.ipv4) {
                notes.push(format!("live address {live}"));
            }
        }

        Self {
            name: r.name.clone(),
            status: r
                .runtime
                .as_ref()
                .map_or_else(|| "-".to_string(), |c| c.status.to_string()),
            ip: r.ip().map_or_else(|| "-".to_string(), |ip| ip.to_string()),
            exposed: join(r.exposed_ports.iter()),
            forwards: join(
                r.forwards
                    .iter()
                    .map(|f| format!("{}->{}/{}", f.host_port, f.container_port, f.protocol)),
            ),
            notes: notes.join(", "),
        }
    }
}

#[derive(Tabled)]
struct HostsRow {
    #[tabled(rename = "FILE")]
    file: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "NAME")]
    name: String,
}

fn join<T: ToString>(items: impl Iterator<Item = T>) -> String {
    let joined: Vec<String> = items.map(|i| i.to_string()).collect();
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined.join(", ")
    }
}

fn print_forwards(forwards: &[PortForward]) {
    if forwards.is_empty() {
        println!("No port forwards configured");
    } else {
        let rows: Vec<ForwardRow> = forwards.iter().map(ForwardRow::from).collect();
        println!("{}", Table::new(rows));
    }
}

impl Cli {
    /// The store these arguments describe, backed by the real system.
    #[must_use]
    pub fn store(&self) -> NetworkIdentityStore {
        NetworkIdentityStore::new(ComposePaths::new(), Arc::new(SystemExecutor::new()))
            .with_subnet(self.subnet)
            .with_start(self.start)
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns any failure of the command.
    pub async fn execute(self) -> Result<()> {
        let store = self.store();
        self.execute_with(store).await
    }

    /// Execute the CLI command against `store`.
    ///
    /// # Errors
    ///
    /// Returns any failure of the command.
    pub async fn execute_with(self, store: NetworkIdentityStore) -> Result<()> {
        match self.command {
            Commands::Up { file, timeout } => {
                let orchestrator = Orchestrator::new(load(&file)?, store)
                    .with_wait_timeout(Duration::from_secs(timeout));
                for result in orchestrator.up().await? {
                    let verb = if result.created { "Created" } else { "Up to date" };
                    println!("{} {} ({})", style(verb).green(), result.name, result.ip);
                }
                Ok(())
            }

            Commands::Down { file } => {
                Orchestrator::new(load(&file)?, store).down()?;
                println!("Stopped");
                Ok(())
            }

            Commands::Destroy { file } => {
                Orchestrator::new(load(&file)?, store).destroy()?;
                println!("Destroyed");
                Ok(())
            }

            Commands::List { file, json } => {
                prune(&store);
                let compose = file.as_deref().map(load).transpose()?;
                let records: Vec<ContainerNetworkRecord> = store
                    .reconciler()
                    .records()?
                    .into_iter()
                    .filter(|r| compose.as_ref().is_none_or(|c| c.container(&r.name).is_some()))
                    .collect();

                if json {
                    println!("{}", serde_json::to_string_pretty(&records)?);
                } else if records.is_empty() {
                    println!("No containers");
                } else {
                    let rows: Vec<ContainerRow> = records.iter().map(ContainerRow::from).collect();
                    println!("{}", Table::new(rows));
                }
                Ok(())
            }

            Commands::Port { command } => port(&store, command),

            Commands::Hosts { command } => hosts(&store, command),
        }
    }
}

fn port(store: &NetworkIdentityStore, command: PortCommands) -> Result<()> {
    let forwarder = store.forwards();
    match command {
        PortCommands::Add {
            host_port,
            container,
            container_port,
            protocol,
            description,
        } => {
            prune(store);
            let request = ForwardRequest {
                host_port,
                container,
                container_port,
                protocol,
                description,
            };
            let forward = forwarder.add(&request)?;
            println!(
                "{} {}/{} -> {}:{} ({})",
                style("Forwarding").green(),
                forward.host_port,
                forward.protocol,
                forward.container_ip,
                forward.container_port,
                forward.container_name
            );
        }
        PortCommands::Remove { host_port, protocol } => {
            let forward = forwarder.remove(host_port, protocol)?;
            println!(
                "Removed forward {}/{} -> {}:{}",
                forward.host_port, forward.protocol, forward.container_name, forward.container_port
            );
        }
        PortCommands::List => {
            prune(store);
            print_forwards(&forwarder.list()?);
        }
        PortCommands::Show { container } => {
            prune(store);
            print_forwards(&forwarder.show(container.as_deref())?);
        }
        PortCommands::Clear => {
            let removed = forwarder.clear_all()?;
            println!("Removed {removed} port forwards");
        }
        PortCommands::Apply { save } => {
            let report = forwarder.apply_all()?;
            println!("Applied {} port forwards", report.applied);
            for (host_port, protocol, reason) in &report.failed {
                println!("{} {host_port}/{protocol}: {reason}", style("Failed").red());
            }
            if save {
                print_saved(forwarder.save_rules());
            }
        }
        PortCommands::Save => print_saved(forwarder.save_rules()),
        PortCommands::Update { container } => {
            if forwarder.update_ip(&container)? {
                println!("Updated forwards of {container}");
            } else {
                println!("Forwards of {container} are up to date");
            }
        }
    }
    Ok(())
}

fn print_saved(saved: bool) {
    if saved {
        println!("{} firewall rules", style("Saved").green());
    } else {
        println!("{} firewall rules were not saved", style("Warning:").yellow());
    }
}

fn hosts(store: &NetworkIdentityStore, command: HostsCommands) -> Result<()> {
    let hosts = store.hosts();
    match command {
        HostsCommands::List => {
            let mut rows = Vec::new();
            for target in HostsTarget::ALL {
                let file = hosts.path(target).display().to_string();
                rows.extend(hosts.list_entries(target)?.into_iter().map(|e| HostsRow {
                    file: file.clone(),
                    ip: e.ip.to_string(),
                    name: e.name,
                }));
            }
            if rows.is_empty() {
                println!("No managed hosts entries");
            } else {
                println!("{}", Table::new(rows));
            }
        }
        HostsCommands::Restore => {
            hosts.restore_backup()?;
            println!("Restored {}", store.paths().host_hosts.display());
        }
    }
    Ok(())
}

fn load(path: &Path) -> Result<ComposeFile> {
    Ok(ComposeFile::from_file(path)?)
}

fn prune(store: &NetworkIdentityStore) {
    match store.reconciler().sync_with_reality() {
        Ok(pruned) => {
            for name in pruned {
                tracing::info!(container = %name, "Removed state of deleted container");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Could not reconcile with the runtime"),
    }
}
