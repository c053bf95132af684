//! Error types for patch parsing and application

use thiserror::Error;

/// Result type for patch operations
pub type Result<T> = std::result::Result<T, PatchError>;

/// Errors that can occur while parsing, validating or applying a patch
#[derive(Error, Debug)]
pub enum PatchError {
    /// The magic matched but the body violates the format
    #[error("invalid {format} patch: {reason}")]
    InvalidPatchFile {
        format: &'static str,
        reason: String,
    },

    /// No codec recognizes the container
    #[error("unrecognized patch format")]
    UnsupportedFormat,

    /// The container declares a feature this library does not implement
    #[error("{format}: unsupported feature: {feature}")]
    UnsupportedFeature {
        format: &'static str,
        feature: String,
    },

    /// The source buffer failed the codec's precondition check
    #[error("{format} source validation failed: {reason}")]
    ValidationFailed {
        format: &'static str,
        reason: String,
    },

    /// The produced output diverged from the declared target checksum
    #[error("{format} target checksum mismatch: expected {expected}, got {actual}")]
    TargetChecksumMismatch {
        format: &'static str,
        expected: String,
        actual: String,
    },

    /// The source buffer does not meet the codec's structural needs
    #[error("invalid source file: {0}")]
    InvalidSourceFile(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PatchError {
    pub(crate) fn invalid(format: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidPatchFile {
            format,
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(format: &'static str, reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            format,
            reason: reason.into(),
        }
    }

    pub(crate) fn checksum_u32(format: &'static str, expected: u32, actual: u32) -> Self {
        Self::TargetChecksumMismatch {
            format,
            expected: format!("{expected:08x}"),
            actual: format!("{actual:08x}"),
        }
    }
}
