//! Typed error kinds for the build pipeline.
//!
//! Functions throughout the crate return `anyhow::Result` and attach the
//! logical manifest location (`"onboot[2]"`-style) with `Context` as errors
//! propagate. The kinds below are the root causes a caller may want to
//! distinguish; they can be recovered with `err.downcast_ref::<BuildError>()`.

use thiserror::Error;

/// Fatal error kinds produced by the build pipeline.
///
/// Every variant aborts the whole build; the in-progress output stream is
/// not valid and must be discarded by the caller.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The manifest failed schema validation. Collects every violation
    /// found, not just the first.
    #[error("invalid manifest:\n{}", violations.join("\n"))]
    Schema { violations: Vec<String> },

    /// An image reference string could not be parsed.
    #[error("invalid image reference {reference:?}: {reason}")]
    Reference { reference: String, reason: String },

    /// The registry collaborator failed to pull an image.
    #[error("failed to pull image {reference}: {reason}")]
    Pull { reference: String, reason: String },

    /// A config value failed validation (unknown capability, malformed
    /// mount/bind/rlimit string, and similar).
    #[error("{0}")]
    Validation(String),

    /// A symbolic uid/gid did not resolve against the declared image names.
    #[error("cannot find id: {0}")]
    UnknownIdentity(String),

    /// The kernel binary is neither gzip nor a supported bzImage.
    #[error("unsupported kernel format: {0}")]
    UnsupportedKernelFormat(String),

    /// The kernel image did not contain the configured kernel binary or
    /// auxiliary tar.
    #[error("incomplete kernel image: {0}")]
    IncompleteKernelImage(String),
}
