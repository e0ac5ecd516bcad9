//! Error handling.
//!
//! The runtime never uses exceptions-as-control-flow in its own hot paths:
//! a fiber's failure is observed by its scope as a value, and backend
//! errors (poller, fd, process) are committed event values rather than
//! raised. [`Error`] exists for the cases where a `Result` genuinely is the
//! right shape: misuse of the API, and the one legitimate place a root
//! scope's failure may propagate out of [`crate::scheduler::Scheduler::run`].

use std::fmt::Display;

/// A specialized [`Result`](std::result::Result) for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All error cases the runtime itself can surface.
///
/// `BackendError` is the escape hatch for external collaborators (the
/// poller, fd/stream backend, process backend) to report failures without
/// this crate depending on their concrete error types.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A fiber's body returned an error. Carried as a scope's primary error
    /// on the first such occurrence; subsequent ones are recorded as extra
    /// errors.
    #[error("fiber failed: {0}")]
    FiberFailure(String),

    /// The owning scope was cancelled. This is the value delivered to any
    /// cancellation-aware branch of a performed event.
    #[error("scope cancelled: {reason}")]
    ScopeCancelled {
        /// Human-readable reason, usually propagated from the fiber or
        /// ancestor scope that triggered the cancellation.
        reason: String,
    },

    /// A finaliser raised while a scope was tearing down. Always recorded
    /// as an extra error; never replaces a scope's primary error.
    #[error("finaliser failed: {0}")]
    FinaliserError(String),

    /// `perform` was called outside of a running fiber, or a finaliser
    /// attempted to suspend.
    #[error("perform misuse: {0}")]
    PerformMisuse(&'static str),

    /// An error surfaced by an external collaborator (poller, fd/stream
    /// backend, process backend).
    #[error("backend error: {0}")]
    BackendError(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// A short, stable, machine-readable name for the error's variant,
    /// independent of its message. Useful in logs and test assertions.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Error::FiberFailure(_) => "FiberFailure",
            Error::ScopeCancelled { .. } => "ScopeCancelled",
            Error::FinaliserError(_) => "FinaliserError",
            Error::PerformMisuse(_) => "PerformMisuse",
            Error::BackendError(_) => "BackendError",
        }
    }

    /// Constructs a [`Error::ScopeCancelled`] from anything displayable.
    pub fn cancelled(reason: impl Display) -> Self {
        Error::ScopeCancelled {
            reason: reason.to_string(),
        }
    }

    /// Constructs a [`Error::BackendError`] wrapping an arbitrary source
    /// error, the way an fd/poller/process backend would report a failure
    /// back into an event's committed value.
    pub fn backend(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::BackendError(Box::new(source))
    }
}
