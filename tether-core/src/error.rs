//! Error Types
//!
//! Every fallible operation in the runtime returns [`Error`]. Errors are
//! `Clone` because a failed atom caches its error and hands the same value to
//! every later reader until the atom is invalidated.
//!
//! Factories and flow bodies return [`BoxError`], so user code can raise any
//! error type with `?`. The runtime wraps those into [`Error`] while keeping
//! the original reachable through [`Error::downcast_source`].

use std::sync::Arc;

use thiserror::Error;

use crate::execution::ContextStatus;

/// Error type returned by atom factories, flow bodies, and cleanups.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared form of [`BoxError`], cheap to clone into every waiting caller.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by scopes, controllers, and execution contexts.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The scope was disposed; no further operations are accepted.
    #[error("scope has been disposed")]
    ScopeDisposed,

    /// A synchronous read hit an atom that has no value yet.
    #[error("atom `{atom}` is not resolved")]
    NotResolved { atom: String },

    /// The atom's factory, or one of its declared dependencies, failed.
    #[error("failed to resolve atom `{atom}`: {source}")]
    ExecutorResolution {
        atom: String,
        #[source]
        source: SharedError,
    },

    /// Declared dependencies form a cycle and can never resolve.
    #[error("circular dependency: {}", .path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    /// `exec()` was called on a context that is closing or closed.
    #[error("execution context `{context}` is {status}")]
    ExecutionContextClosed {
        context: String,
        status: ContextStatus,
    },

    /// The execution was cancelled by an abort-mode close.
    #[error("execution in context `{context}` was aborted")]
    ExecutionAborted { context: String },

    /// A flow body returned an error.
    #[error("flow `{flow}` failed: {source}")]
    FlowFailed {
        flow: String,
        #[source]
        source: SharedError,
    },

    /// An invalidation chain revisited an atom it was already processing.
    #[error("infinite invalidation loop detected: {}", .path.join(" -> "))]
    InfiniteInvalidationLoop { path: Vec<String> },

    /// A required tag was neither provided nor defaulted.
    #[error("tag `{label}` is required but was not provided")]
    TagNotFound { label: String },

    /// The cached value does not have the type the handle expects.
    #[error("atom `{atom}` holds a value of an unexpected type")]
    TypeMismatch { atom: String },

    /// An extension failed during scope initialization.
    #[error("extension `{extension}` failed to initialize: {source}")]
    ExtensionInit {
        extension: String,
        #[source]
        source: SharedError,
    },
}

impl Error {
    /// Wrap a factory failure for the named atom.
    pub(crate) fn resolution(atom: &str, source: BoxError) -> Self {
        Error::ExecutorResolution {
            atom: atom.to_string(),
            source: Arc::from(source),
        }
    }

    /// Wrap a flow failure, passing runtime errors through untouched.
    ///
    /// A nested `exec()` that fails with a typed runtime error keeps its
    /// variant when the outer flow propagates it with `?`.
    pub(crate) fn flow(flow: &str, source: BoxError) -> Self {
        match source.downcast::<Error>() {
            Ok(inner) => *inner,
            Err(source) => Error::FlowFailed {
                flow: flow.to_string(),
                source: Arc::from(source),
            },
        }
    }

    /// Recover the original error raised by user code, if it has type `E`.
    pub fn downcast_source<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Error::ExecutorResolution { source, .. }
            | Error::FlowFailed { source, .. }
            | Error::ExtensionInit { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether this error came from an abort-mode close.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::ExecutionAborted { .. })
    }
}

/// A cleanup callback failed.
///
/// Cleanup failures never propagate: each one is logged and the remaining
/// cleanups still run.
#[derive(Debug, Clone, Error)]
#[error("cleanup for `{owner}` failed: {source}")]
pub struct CleanupError {
    pub owner: String,
    #[source]
    pub source: SharedError,
}

impl CleanupError {
    pub(crate) fn new(owner: &str, source: BoxError) -> Self {
        Self {
            owner: owner.to_string(),
            source: Arc::from(source),
        }
    }

    /// Log this failure.
    pub(crate) fn report(&self) {
        tracing::warn!(owner = %self.owner, error = %self.source, "cleanup failed");
    }
}
