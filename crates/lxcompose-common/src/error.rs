//! Common error types for lxcompose.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`LxcError`].
pub type LxcResult<T> = Result<T, LxcError>;

/// Errors raised while managing container network identity.
#[derive(Error, Diagnostic, Debug)]
pub enum LxcError {
    /// No free address is left in the subnet.
    #[error("No more IP addresses available in subnet {subnet}")]
    #[diagnostic(
        code(lxcompose::ipam::exhausted),
        help("Destroy unused containers or pick a larger start offset with --start")
    )]
    AllocationExhausted {
        /// The exhausted subnet.
        subnet: String,
    },

    /// The container name is already owned by something else on this host.
    #[error("Container name '{name}' already exists")]
    #[diagnostic(
        code(lxcompose::name_conflict),
        help(
            "Container names must be globally unique: each name maps to exactly one IP address.\n\
             Use project namespaces ({prefix}-db, {prefix}-cache, {prefix}-web)\n\
             or reverse domain notation (com-example-db, org-myproject-app)."
        )
    )]
    NameConflict {
        /// The conflicting name.
        name: String,
        /// Suggested project prefix for the remediation hint.
        prefix: String,
    },

    /// The host port is already forwarded to a different target.
    #[error("Host port {host_port}/{protocol} is already forwarded to {owner}")]
    #[diagnostic(
        code(lxcompose::firewall::conflict),
        help("Remove the existing forward first with `lxc-compose port remove {host_port} --protocol {protocol}`")
    )]
    FirewallRuleConflict {
        /// Host port.
        host_port: u16,
        /// Protocol name.
        protocol: String,
        /// Current owner, as `container:port`.
        owner: String,
    },

    /// No forward rule exists for the port.
    #[error("No forward rule found for port {host_port}/{protocol}")]
    #[diagnostic(code(lxcompose::firewall::forward_not_found))]
    ForwardNotFound {
        /// Host port.
        host_port: u16,
        /// Protocol name.
        protocol: String,
    },

    /// Container not found in the runtime.
    #[error("Container not found: {name}")]
    #[diagnostic(code(lxcompose::container::not_found))]
    ContainerNotFound {
        /// The container name that was not found.
        name: String,
    },

    /// Container exists but has no usable address.
    #[error("Container '{name}' not found or not running")]
    #[diagnostic(
        code(lxcompose::container::not_running),
        help("Start it with `lxc start {name}` and wait for it to obtain an address")
    )]
    ContainerNotRunning {
        /// The container name.
        name: String,
    },

    /// Invalid container name format.
    #[error("Invalid container name: {name}")]
    #[diagnostic(
        code(lxcompose::container::invalid_name),
        help("Container names must be 1-63 characters of letters, digits and hyphens, starting with a letter")
    )]
    InvalidContainerName {
        /// The invalid name.
        name: String,
    },

    /// Invalid subnet definition.
    #[error("Invalid subnet: {value}")]
    #[diagnostic(
        code(lxcompose::ipam::invalid_subnet),
        help("Only IPv4 /24 subnets such as 10.0.3.0/24 are supported")
    )]
    InvalidSubnet {
        /// The invalid value.
        value: String,
    },

    /// Invalid port specification.
    #[error("Invalid port specification: {value}")]
    #[diagnostic(
        code(lxcompose::config::invalid_port),
        help("Use a port number (8080), a mapping (\"8080:80\" or \"5353:53/udp\") or {{host, container, protocol}}")
    )]
    InvalidPortSpec {
        /// The invalid value.
        value: String,
    },

    /// An external command exited unsuccessfully.
    #[error("Command failed: {command}")]
    #[diagnostic(code(lxcompose::command))]
    ExternalCommand {
        /// The full command line.
        command: String,
        /// Exit status, if the process ran.
        status: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(lxcompose::permission_denied),
        help("Try running with elevated privileges (sudo)")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// The operator interrupted a wait.
    #[error("Interrupted while {operation}")]
    #[diagnostic(code(lxcompose::interrupted))]
    Interrupted {
        /// What was being waited on.
        operation: String,
    },

    /// A wait ran out of time.
    #[error("Timed out after {seconds}s while {operation}")]
    #[diagnostic(code(lxcompose::timeout))]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// The timeout in seconds.
        seconds: u64,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(lxcompose::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(lxcompose::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(lxcompose::config))]
    Config {
        /// The error message.
        message: String,
    },
}

impl LxcError {
    /// Build a [`LxcError::NameConflict`] with a prefix hint derived from the name.
    #[must_use]
    pub fn name_conflict(name: &str) -> Self {
        let prefix = name.split('-').next().unwrap_or(name).to_string();
        Self::NameConflict {
            name: name.to_string(),
            prefix,
        }
    }

    /// Whether this error is an I/O permission failure.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            Self::PermissionDenied { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for LxcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = LxcError::FirewallRuleConflict {
            host_port: 8080,
            protocol: "tcp".to_string(),
            owner: "web:80".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Host port 8080/tcp is already forwarded to web:80"
        );
    }

    #[test]
    fn name_conflict_prefix() {
        match LxcError::name_conflict("shop-db") {
            LxcError::NameConflict { name, prefix } => {
                assert_eq!(name, "shop-db");
                assert_eq!(prefix, "shop");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn permission_classification() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: LxcError = io_err.into();
        assert!(err.is_permission_denied());

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: LxcError = io_err.into();
        assert!(!err.is_permission_denied());
    }
}
