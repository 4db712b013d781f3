//! Error types for reconciliation operations.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use flowsteer_common::NicError;

/// Result type alias for flowsteer operations.
pub type FlowsteerResult<T> = Result<T, FlowsteerError>;

/// Errors that abort an operation.
///
/// Per-rule failures and missing optional capabilities do not appear here;
/// they are recorded in [`crate::ReconciliationResult`] instead.
#[derive(Debug, Error)]
pub enum FlowsteerError {
    /// The interface does not exist.
    #[error("Device '{interface}' not found")]
    DeviceNotFound { interface: String },

    /// The traffic-split policy is malformed for this device.
    #[error("Invalid policy for {field}: {message}")]
    InvalidPolicy { field: String, message: String },

    /// The operation strictly requires a capability the device lacks.
    #[error("{interface} does not support {capability}")]
    CapabilityUnsupported {
        interface: String,
        capability: String,
    },

    /// The device has no SR-IOV capability.
    #[error("{interface} does not support SR-IOV")]
    SriovUnsupported { interface: String },

    /// More VFs requested than the device supports.
    #[error("Requested {requested} VFs on {interface}, device supports at most {max}")]
    VfCountExceedsMax {
        interface: String,
        requested: u32,
        max: u32,
    },

    /// VF net interfaces did not appear within the poll budget.
    #[error("VF {vf_index} on {interface} did not materialize within {waited:?}")]
    VfMaterializationTimeout {
        interface: String,
        vf_index: u32,
        waited: Duration,
    },

    /// The device ran out of rule slots before the whole range was applied.
    #[error("Rule table on {interface} exhausted: {failed} of {desired} rules not applied")]
    RuleTableExhausted {
        interface: String,
        desired: usize,
        failed: usize,
    },

    /// Some rules could not be added or removed.
    #[error("{failed} rule operations failed on {interface}")]
    RulesFailed { interface: String, failed: usize },

    /// Another run holds the interface lock.
    #[error("{interface} is locked by another flowsteer run ({})", path.display())]
    LockHeld { interface: String, path: PathBuf },

    /// The device rule table does not match the plan after apply.
    #[error("Verification mismatch on {interface}: missing ports {missing:?}, unexpected ports {unexpected:?}")]
    PartialVerificationMismatch {
        interface: String,
        missing: Vec<u16>,
        unexpected: Vec<u16>,
    },

    /// Reading or writing the ownership ledger failed.
    #[error("Ledger {}: {message}", path.display())]
    Ledger { path: PathBuf, message: String },

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device communication failure.
    #[error(transparent)]
    Device(#[from] NicError),
}

impl FlowsteerError {
    /// Creates an invalid policy error.
    pub fn invalid_policy(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a ledger error.
    pub fn ledger(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Ledger {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Maps a device error, turning a missing interface into
    /// [`FlowsteerError::DeviceNotFound`].
    pub fn from_device(err: NicError) -> Self {
        match err {
            NicError::InterfaceNotFound { interface } => Self::DeviceNotFound { interface },
            NicError::Unsupported {
                interface,
                operation,
            } => Self::CapabilityUnsupported {
                interface,
                capability: operation,
            },
            other => Self::Device(other),
        }
    }

    /// Maps a lock acquisition failure for `interface`.
    pub fn from_lock(interface: &str, err: NicError) -> Self {
        match err {
            NicError::LockHeld { path } => Self::LockHeld {
                interface: interface.to_string(),
                path,
            },
            other => Self::from_device(other),
        }
    }

    /// Returns true if re-invoking the operation may succeed without any
    /// change to the policy or the host.
    pub fn is_retryable(&self) -> bool {
        match self {
            FlowsteerError::VfMaterializationTimeout { .. } | FlowsteerError::LockHeld { .. } => true,
            _ => false,
        }
    }
}
