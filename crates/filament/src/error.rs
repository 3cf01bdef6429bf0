//! Error types for the runtime.

use filament_core::CodecError;

/// Errors surfaced by receive operations.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    /// A message matched a matcher's fingerprint but its bytes failed to
    /// decode. Programmer error; the queue itself is left intact.
    #[error(transparent)]
    Decode(#[from] CodecError),
}

/// Errors from resolving a closure against a remote table.
#[derive(Debug, thiserror::Error)]
pub enum ClosureError {
    /// No resolver is registered under the label.
    #[error("unknown closure label: {0}")]
    UnknownLabel(String),
    /// The environment bytes did not decode to what the resolver expects.
    #[error("closure environment: {0}")]
    Environment(CodecError),
    /// The resolver produced a value of a different type than requested.
    #[error("closure type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// The type the caller asked for.
        expected: String,
        /// The type the resolver produced.
        found: String,
    },
}
