//! # lxcompose-net
//!
//! Network identity for lxcompose containers.
//!
//! This crate keeps four pieces of on-disk state consistent with each other
//! and with the container runtime:
//! - the IP allocation registry ([`ipam`])
//! - the managed sections of the shared and host hosts files ([`hosts`])
//! - the port-forward registry and its firewall rules ([`portmap`],
//!   [`firewall`])
//! - reconciliation and rollback across all of them ([`reconcile`])
//!
//! All components borrow a [`NetworkIdentityStore`], which carries the file
//! locations, the subnet, the lock provider and the [`Executor`] used for
//! every runtime and firewall side effect.

#![warn(missing_docs)]

pub mod container_info;
pub mod executor;
pub mod firewall;
pub mod hosts;
pub mod ipam;
pub mod portmap;
pub mod provision;
pub mod reconcile;
pub mod store;

pub use container_info::{ContainerInfo, ContainerInfoStore};
pub use executor::{
    ContainerStatus, Executor, ListedRule, MemoryExecutor, RuntimeContainer, SystemExecutor,
};
pub use firewall::{ExposedPolicy, ExposedPorts, FirewallRule, Protocol, Table};
pub use hosts::{HostsEntry, HostsSection, HostsSynchronizer, HostsTarget};
pub use ipam::{AllocationRegistry, IpAllocator, Subnet};
pub use portmap::{ApplyReport, ForwardRequest, PortForward, PortForwarder};
pub use provision::{Provisioner, SetupRequest};
pub use reconcile::{ContainerNetworkRecord, Reconciler};
pub use store::NetworkIdentityStore;
