//! Managed sections of hosts files.
//!
//! Two files carry a managed section: the shared hosts file bind-mounted into
//! every container, and the host machine's own hosts file. Only the lines
//! between the section markers are ever touched; everything around them is
//! carried through rewrites byte for byte.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use lxcompose_common::{ContainerName, LxcError, LxcResult};
use serde::Serialize;

use crate::store::NetworkIdentityStore;

/// Section markers of one hosts file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Markers {
    /// Opening marker line.
    pub start: &'static str,
    /// Closing marker line.
    pub end: &'static str,
}

/// Markers in the shared container hosts file.
pub const SHARED_MARKERS: Markers = Markers {
    start: "# BEGIN LXC Compose managed section - DO NOT EDIT",
    end: "# END LXC Compose managed section",
};

/// Markers in the host machine's hosts file.
pub const HOST_MARKERS: Markers = Markers {
    start: "# BEGIN lxc-compose managed section",
    end: "# END lxc-compose managed section",
};

/// Content a fresh shared hosts file starts with.
pub const SHARED_HEADER: &str = "# LXC Compose managed hosts file\n\
127.0.0.1\tlocalhost\n\
::1\tlocalhost ip6-localhost ip6-loopback\n\
\n\
# Container entries\n";

/// Which hosts file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostsTarget {
    /// Hosts file mounted into every container.
    Shared,
    /// The host machine's hosts file.
    Host,
}

impl HostsTarget {
    /// Both targets, shared file first.
    pub const ALL: [Self; 2] = [Self::Shared, Self::Host];

    /// Markers used in this file.
    #[must_use]
    pub const fn markers(self) -> Markers {
        match self {
            Self::Shared => SHARED_MARKERS,
            Self::Host => HOST_MARKERS,
        }
    }
}

/// A hosts file split around its managed section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostsSection {
    /// Everything before the opening marker, verbatim.
    pub before: String,
    /// Lines between the markers, without line terminators.
    pub managed: Vec<String>,
    /// Everything after the closing marker line, verbatim.
    pub after: String,
}

impl HostsSection {
    /// Split `content` at the markers.
    ///
    /// Without an opening marker the whole file is `before`. Without a
    /// closing marker the managed section runs to the end of the file.
    #[must_use]
    pub fn parse(content: &str, markers: Markers) -> Self {
        let mut section = Self::default();
        let mut offset = 0;
        let mut in_section = false;

        for line in content.split_inclusive('\n') {
            let next = offset + line.len();
            let bare = line.strip_suffix('\n').unwrap_or(line);

            if !in_section {
                if bare.trim() == markers.start {
                    section.before = content[..offset].to_string();
                    in_section = true;
                }
            } else if bare.trim() == markers.end {
                section.after = content[next..].to_string();
                return section;
            } else {
                section.managed.push(bare.to_string());
            }

            offset = next;
        }

        if !in_section {
            section.before = content.to_string();
        }
        section
    }

    /// Reassemble the file.
    #[must_use]
    pub fn render(&self, markers: Markers) -> String {
        let size = self.before.len()
            + self.after.len()
            + self.managed.iter().map(|l| l.len() + 1).sum::<usize>()
            + markers.start.len()
            + markers.end.len()
            + 3;
        let mut out = String::with_capacity(size);

        out.push_str(&self.before);
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(markers.start);
        out.push('\n');
        for line in &self.managed {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(markers.end);
        out.push('\n');
        out.push_str(&self.after);
        out
    }

    /// Parsed `(ip, name)` entries of the managed section.
    ///
    /// Comments and lines without an IPv4 address are skipped; each extra
    /// name on a line yields its own entry.
    #[must_use]
    pub fn entries(&self) -> Vec<HostsEntry> {
        self.managed
            .iter()
            .filter(|line| !is_comment(line))
            .filter_map(|line| {
                let mut tokens = line.split_whitespace();
                let ip: Ipv4Addr = tokens.next()?.parse().ok()?;
                Some(tokens.map(move |name| HostsEntry {
                    ip,
                    name: name.to_string(),
                }))
            })
            .flatten()
            .collect()
    }

    /// Whether a managed line names `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.managed.iter().any(|line| line_names(line, name))
    }

    /// Address `name` resolves to within the section.
    #[must_use]
    pub fn ip_of(&self, name: &str) -> Option<Ipv4Addr> {
        self.entries()
            .into_iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.ip)
    }

    /// Whether exactly one managed line names `name`, and it points at `ip`.
    #[must_use]
    pub fn resolves(&self, name: &str, ip: Ipv4Addr) -> bool {
        let mut lines = self.managed.iter().filter(|line| line_names(line, name));
        let first = lines.next().and_then(|line| line.split_whitespace().next());
        lines.next().is_none() && first.and_then(|t| t.parse().ok()) == Some(ip)
    }

    /// Drop every managed line naming `name`; returns how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.managed.len();
        self.managed.retain(|line| !line_names(line, name));
        before - self.managed.len()
    }

    /// Point `name` at `ip`, replacing any previous line for it.
    pub fn upsert(&mut self, name: &str, ip: Ipv4Addr) {
        self.remove(name);
        self.managed.push(format!("{ip}\t{name}"));
        self.sort();
    }

    /// Order managed lines by numeric address; other lines keep their
    /// relative order at the end.
    pub fn sort(&mut self) {
        self.managed.sort_by_key(|line| {
            line.split_whitespace()
                .next()
                .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
                .map_or(u64::MAX, |ip| u64::from(u32::from(ip)))
        });
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

fn line_names(line: &str, name: &str) -> bool {
    !is_comment(line) && line.split_whitespace().any(|token| token == name)
}

/// One managed hosts entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostsEntry {
    /// Address.
    pub ip: Ipv4Addr,
    /// Container name.
    pub name: String,
}

/// Keeps both hosts files in step with the allocation registry.
pub struct HostsSynchronizer<'a> {
    store: &'a NetworkIdentityStore,
}

impl<'a> HostsSynchronizer<'a> {
    /// Create a synchronizer over `store`.
    #[must_use]
    pub const fn new(store: &'a NetworkIdentityStore) -> Self {
        Self { store }
    }

    /// Location of a target file.
    #[must_use]
    pub fn path(&self, target: HostsTarget) -> PathBuf {
        match target {
            HostsTarget::Shared => self.store.paths().shared_hosts(),
            HostsTarget::Host => self.store.paths().host_hosts.clone(),
        }
    }

    /// Read and split a target file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn read(&self, target: HostsTarget) -> LxcResult<HostsSection> {
        let content = self.store.read_text(&self.path(target))?;
        let mut section = HostsSection::parse(&content, target.markers());
        if target == HostsTarget::Shared && content.trim().is_empty() {
            section.before = SHARED_HEADER.to_string();
        }
        Ok(section)
    }

    /// Replace a target file with `section`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, target: HostsTarget, section: &HostsSection) -> LxcResult<()> {
        let path = self.path(target);
        let _lock = self.store.lock(&path)?;
        self.write_locked(target, section)
    }

    fn write_locked(&self, target: HostsTarget, section: &HostsSection) -> LxcResult<()> {
        let path = self.path(target);
        if target == HostsTarget::Host {
            self.backup_host_file();
        }
        self.store
            .write_text(&path, &section.render(target.markers()))
    }

    /// Lock, read, modify and rewrite one file. The file is only rewritten
    /// when `change` reports a modification.
    fn modify<F>(&self, target: HostsTarget, change: F) -> LxcResult<bool>
    where
        F: FnOnce(&mut HostsSection) -> bool,
    {
        self.try_modify(target, |section| Ok(change(section)))
    }

    /// Like `modify`, but `change` may reject the section it sees under the
    /// lock, in which case the file is left alone.
    fn try_modify<F>(&self, target: HostsTarget, change: F) -> LxcResult<bool>
    where
        F: FnOnce(&mut HostsSection) -> LxcResult<bool>,
    {
        let path = self.path(target);
        let _lock = self.store.lock(&path)?;
        let mut section = self.read(target)?;
        if !change(&mut section)? {
            return Ok(false);
        }
        self.write_locked(target, &section)?;
        Ok(true)
    }

    fn backup_host_file(&self) {
        let paths = self.store.paths();
        let backup = paths.host_hosts_backup();
        if backup.exists() || !paths.host_hosts.exists() {
            return;
        }

        let result = self
            .store
            .read_text(&paths.host_hosts)
            .and_then(|content| self.store.write_text(&backup, &content));
        match result {
            Ok(()) => tracing::info!(backup = %backup.display(), "Backed up host hosts file"),
            Err(e) => tracing::warn!(error = %e, "Could not back up host hosts file"),
        }
    }

    /// Register `name` at `ip` in both files.
    ///
    /// Fails without touching either file if the name is already taken by a
    /// hosts entry or an existing container.
    ///
    /// # Errors
    ///
    /// Returns [`LxcError::NameConflict`] on conflict, or an error if a file
    /// cannot be written. A failed write leaves neither file holding the name.
    pub fn add(&self, name: &str, ip: Ipv4Addr) -> LxcResult<()> {
        let name = ContainerName::new(name)?;
        if self.store.reconciler().name_conflict(name.as_str())? {
            return Err(LxcError::name_conflict(name.as_str()));
        }

        // Checked again under each file lock; a concurrent add of the same
        // name fails here.
        let mut written = Vec::new();
        for target in HostsTarget::ALL {
            let result = self.try_modify(target, |section| {
                if section.contains(name.as_str()) {
                    return Err(LxcError::name_conflict(name.as_str()));
                }
                section.upsert(name.as_str(), ip);
                Ok(true)
            });
            if let Err(e) = result {
                for done in written {
                    if let Err(cleanup) = self.modify(done, |section| section.remove(name.as_str()) > 0) {
                        tracing::warn!(name = %name, error = %cleanup, "Failed to undo partial hosts update");
                    }
                }
                return Err(e);
            }
            written.push(target);
        }
        tracing::debug!(name = %name, %ip, "Added hosts entries");
        Ok(())
    }

    /// Point `name` at `ip` in both files, without the conflict check.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub fn update(&self, name: &str, ip: Ipv4Addr) -> LxcResult<()> {
        let name = ContainerName::new(name)?;
        self.upsert(name.as_str(), ip)
    }

    fn upsert(&self, name: &str, ip: Ipv4Addr) -> LxcResult<()> {
        for target in HostsTarget::ALL {
            self.modify(target, |section| {
                if section.resolves(name, ip) {
                    return false;
                }
                section.upsert(name, ip);
                true
            })?;
        }
        tracing::debug!(name, %ip, "Updated hosts entries");
        Ok(())
    }

    /// Remove `name` from both files. Absent names are a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or written.
    pub fn remove(&self, name: &str) -> LxcResult<bool> {
        let mut removed = false;
        for target in HostsTarget::ALL {
            removed |= self.modify(target, |section| section.remove(name) > 0)?;
        }
        if removed {
            tracing::debug!(name, "Removed hosts entries");
        }
        Ok(removed)
    }

    /// Entries of one file's managed section.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn list_entries(&self, target: HostsTarget) -> LxcResult<Vec<HostsEntry>> {
        Ok(self.read(target)?.entries())
    }

    /// Every name present in either managed section.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read.
    pub fn managed_names(&self) -> LxcResult<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for target in HostsTarget::ALL {
            names.extend(self.list_entries(target)?.into_iter().map(|e| e.name));
        }
        Ok(names)
    }

    /// Address of `name` in the shared file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn ip_of(&self, name: &str) -> LxcResult<Option<Ipv4Addr>> {
        Ok(self.read(HostsTarget::Shared)?.ip_of(name))
    }

    /// Put the host hosts file back the way it was before the first rewrite.
    ///
    /// # Errors
    ///
    /// Returns [`LxcError::Config`] when no backup exists, or an error if the
    /// file cannot be written.
    pub fn restore_backup(&self) -> LxcResult<()> {
        let paths = self.store.paths();
        let backup = paths.host_hosts_backup();
        if !backup.exists() {
            return Err(LxcError::Config {
                message: format!("no hosts backup found at {}", backup.display()),
            });
        }

        let _lock = self.store.lock(&paths.host_hosts)?;
        let content = self.store.read_text(&backup)?;
        self.store.write_text(&paths.host_hosts, &content)?;
        tracing::info!(path = %paths.host_hosts.display(), "Restored hosts file from backup");
        Ok(())
    }
}
