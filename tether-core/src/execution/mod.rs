//! Execution
//!
//! Short-lived work runs inside an [`ExecutionContext`]. Contexts form a
//! tree: every `exec` or `run` creates a child context that owns its own
//! data, cleanups, and cancellation token, and the child is closed before the
//! call returns.
//!
//! # Lifecycle
//!
//! ```text
//! active -> closing -> closed
//! ```
//!
//! 1. While `active`, a context accepts `exec`, `run`, and the parallel
//!    helpers. Each call is counted as in flight.
//!
//! 2. `close()` moves the context to `closing`. New executions are rejected
//!    with [`Error::ExecutionContextClosed`](crate::Error::ExecutionContextClosed).
//!
//! 3. A graceful close waits for every in-flight execution, then closes any
//!    remaining children. An abort close cancels the token first, which
//!    makes every in-flight execution in the subtree fail with
//!    [`Error::ExecutionAborted`](crate::Error::ExecutionAborted).
//!
//! 4. Close cleanups run newest first and the context becomes `closed`.
//!
//! Closing is idempotent: every call returns the same [`CloseHandle`].

mod context;
mod flow;

pub use context::{CloseHandle, ExecutionContext};
pub use flow::{Flow, FlowBuilder};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle status of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Active,
    Closing,
    Closed,
}

impl fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ContextStatus::Active => "active",
            ContextStatus::Closing => "closing",
            ContextStatus::Closed => "closed",
        };
        f.write_str(status)
    }
}

/// How a context is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseMode {
    /// Wait for in-flight executions to finish.
    #[default]
    Graceful,
    /// Cancel in-flight executions, then settle.
    Abort,
}

/// Every outcome of [`ExecutionContext::parallel_settled`], in input order.
#[derive(Debug, Clone)]
pub struct Settled<T> {
    pub results: Vec<Result<T, Error>>,
}

impl<T> Settled<T> {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|result| result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Successful values, skipping failures.
    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.results.iter().filter_map(|result| result.as_ref().ok())
    }

    pub fn errors(&self) -> impl Iterator<Item = &Error> + '_ {
        self.results.iter().filter_map(|result| result.as_ref().err())
    }
}
