//! Error types for NIC control operations.
//!
//! Everything that talks to the device surfaces a [`NicError`]. The
//! reconciliation engine uses [`NicError::is_fatal`] to decide whether a
//! failure is recorded against a single rule or aborts the whole run.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for device operations.
pub type NicResult<T> = Result<T, NicError>;

/// Why the device refused to install a flow rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// The hardware classification table has no free slot.
    TableFull,
    /// The driver rejected the match or action as invalid.
    Invalid,
    /// Any other refusal.
    Other,
}

impl RejectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectKind::TableFull => "rule table exhausted",
            RejectKind::Invalid => "invalid rule",
            RejectKind::Other => "rejected",
        }
    }
}

/// Errors that can occur while querying or mutating a NIC.
#[derive(Debug, Error)]
pub enum NicError {
    /// Failed to spawn a control tool.
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Control tool returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Reading or writing a sysfs attribute failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// The attribute path.
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Tool output did not have the expected shape.
    #[error("Failed to parse {what}: {message}")]
    Parse {
        /// What was being parsed (e.g. "ethtool -l output").
        what: String,
        /// Error message.
        message: String,
    },

    /// The interface does not exist.
    #[error("Interface '{interface}' not found")]
    InterfaceNotFound {
        /// The interface name.
        interface: String,
    },

    /// The driver does not implement the requested operation.
    #[error("Operation not supported by {interface}: {operation}")]
    Unsupported {
        /// The interface name.
        interface: String,
        /// The operation that was refused.
        operation: String,
    },

    /// The device refused to install a flow rule.
    #[error("Rule rejected by {interface} ({}): {message}", kind.as_str())]
    RuleRejected {
        /// The interface name.
        interface: String,
        /// Classified refusal reason.
        kind: RejectKind,
        /// Driver/tool message.
        message: String,
    },

    /// The device refused to delete a flow rule.
    #[error("Failed to delete rule {rule_id} on {interface}: {message}")]
    DeleteFailed {
        /// The interface name.
        interface: String,
        /// Device-local rule id.
        rule_id: u32,
        /// Driver/tool message.
        message: String,
    },

    /// Another process holds the per-interface lock.
    #[error("Lock {} is held by another flowsteer run", path.display())]
    LockHeld {
        /// The lock file path.
        path: PathBuf,
    },

    /// Acquiring the per-interface lock failed.
    #[error("Lock {} unavailable: {message}", path.display())]
    Lock {
        /// The lock file path.
        path: PathBuf,
        /// Error message.
        message: String,
    },
}

impl NicError {
    /// Creates a parse error.
    pub fn parse(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.into(),
        }
    }

    /// Creates an interface-not-found error.
    pub fn interface_not_found(interface: impl Into<String>) -> Self {
        Self::InterfaceNotFound {
            interface: interface.into(),
        }
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(interface: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            interface: interface.into(),
            operation: operation.into(),
        }
    }

    /// Creates an I/O error for a sysfs path.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if the control surface itself is unreachable or
    /// misbehaving, as opposed to the device refusing one request.
    ///
    /// Fatal errors abort a reconciliation run; the rest are recorded
    /// against the rule or capability that triggered them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NicError::ShellExec { .. }
                | NicError::Parse { .. }
                | NicError::InterfaceNotFound { .. }
                | NicError::Lock { .. }
                | NicError::LockHeld { .. }
        )
    }

    /// Returns true if the device ran out of rule slots.
    pub fn is_table_full(&self) -> bool {
        matches!(
            self,
            NicError::RuleRejected {
                kind: RejectKind::TableFull,
                ..
            }
        )
    }

    /// Short, single-line reason suitable for per-rule reports.
    pub fn reason(&self) -> String {
        match self {
            NicError::ShellCommandFailed { output, .. } => output.clone(),
            NicError::RuleRejected { message, .. } | NicError::DeleteFailed { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}
