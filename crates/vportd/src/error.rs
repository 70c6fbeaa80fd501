//! Error types for the vport registry

use thiserror::Error;

use crate::identity::HvIdentity;

/// Vport registry errors
#[derive(Error, Debug)]
pub enum VportError {
    /// Allocation of a new entry failed; the registry is unchanged
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Create notification for an identity that already has an entry
    #[error("Duplicate identity: {0}")]
    DuplicateIdentity(HvIdentity),

    /// Port number is already bound to another entry
    #[error("Port number {0} already in use")]
    DuplicatePortNo(u32),

    /// Name is already bound to another entry
    #[error("Port name already in use: {0}")]
    DuplicateName(String),

    /// No entry matches the given key
    #[error("Vport not found: {0}")]
    NotFound(String),

    /// Controller or fabric left the contracted protocol
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Host string does not fit its presentation buffer
    #[error("Conversion failure: {0}")]
    Conversion(#[from] ConversionError),

    /// Switch did not finish activation within the wait policy
    #[error("Switch not activated after {0} ms")]
    NotActivated(u64),

    /// Switch activation failed permanently
    #[error("Switch activation failed")]
    ActivationFailed,

    /// Notification parameters are inconsistent with the registry
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure converting a host counted string into bounded text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// Converted text plus terminator exceeds the destination bound
    #[error("string needs {needed} bytes, buffer holds {max}")]
    BufferOverflow { needed: usize, max: usize },

    /// Source contains code units with no single-byte representation
    #[error("unmappable code unit {0:#06x}")]
    Unmappable(u16),
}

/// Result type for vport registry operations
pub type Result<T> = std::result::Result<T, VportError>;

impl VportError {
    /// True for errors that indicate a broken protocol rather than a runtime condition.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, VportError::InvariantViolation(_))
    }
}
