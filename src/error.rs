//! Error types for key extraction.

use thiserror::Error;

/// Errors that can abort an extraction run.
///
/// Region-level read faults are logged and skipped by the pipeline rather
/// than surfaced here; an `ExtractError` is the single error a caller sees
/// for one `extract` invocation.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The target process is not running.
    #[error("target process is not running")]
    TargetOffline,

    /// The caller lacks the OS privilege to inspect the target process.
    #[error("insufficient privilege to inspect the target process")]
    PermissionDenied,

    /// The target process disappeared while it was being inspected.
    #[error("target process disappeared during the scan")]
    ProcessGone,

    /// Region enumeration produced an empty candidate set.
    #[error("no candidate memory regions in the target process")]
    NoMemoryRegions,

    /// Every candidate region was scanned without a validated key.
    #[error("no valid key found in the scanned memory regions")]
    NoValidKey,

    /// The first page carries an all-zero salt: the database is plaintext
    /// and there is no key to recover.
    #[error("database is not encrypted (first page has a zero salt)")]
    DatabaseNotEncrypted,

    /// No memory acquisition backend exists for the running OS.
    #[error("no memory acquisition backend for this platform")]
    Unsupported,

    /// The caller's cancellation token fired.
    #[error("extraction cancelled")]
    Cancelled,

    /// A failure that indicates a broken installation rather than a property
    /// of the target (cryptographic library errors, unexpected syscall
    /// faults).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExtractError {
    /// Create an `Internal` error from any displayable cause.
    pub fn internal(msg: impl Into<String>) -> Self {
        ExtractError::Internal(msg.into())
    }
}

/// Result type for extraction operations.
pub type ExtractResult<T> = Result<T, ExtractError>;
