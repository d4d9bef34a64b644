//! # lxcompose-common
//!
//! Shared utilities and types for lxcompose.
//!
//! This crate provides common functionality used across all lxcompose crates:
//! - Container name validation
//! - Standard filesystem paths
//! - Atomic file replacement and advisory file locks
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod fsutil;
pub mod id;
pub mod paths;

pub use error::{LxcError, LxcResult};
pub use fsutil::{FileLockGuard, FileLocker, atomic_write, read_or_empty};
pub use id::ContainerName;
pub use paths::ComposePaths;
