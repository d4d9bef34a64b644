//! # lxcompose
//!
//! Declarative LXC containers with stable addresses.
//!
//! lxcompose provides:
//! - A compose file describing containers, exposed ports and port forwards
//! - Dependency-ordered container creation with pinned IPv4 addresses
//! - Name resolution between containers through a shared hosts file
//! - Cleanup of network state left behind by deleted containers

#![warn(missing_docs)]

pub mod cli;
pub mod orchestrator;
pub mod spec;

pub use orchestrator::Orchestrator;
pub use spec::ComposeFile;
