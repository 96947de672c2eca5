//! Error type shared by SDK-level ABI boundaries.

/// Errors a collaborator may hand back to the core across the trait
/// boundary. Collaborator-internal errors (decoder syntax errors, backend
/// register allocation failures) are expected to be folded into one of
/// these variants rather than grow the enum per collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SdkError {
    /// The collaborator doesn't support the requested operation at all.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The collaborator failed to produce a result for a reason it can
    /// describe, but that doesn't fit a more specific variant.
    #[error("collaborator error: {0}")]
    Other(String),
}
