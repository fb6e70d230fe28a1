//! Extensions
//!
//! An [`Extension`] wraps every atom resolution and every execution in a
//! scope. Hooks receive the next step as a boxed future and return the
//! future to run instead, so an extension can observe, time, retry, or
//! replace the outcome.
//!
//! Extensions registered first are outermost:
//!
//! ```text
//! first.wrap(second.wrap(factory))
//! ```
//!
//! An `Err` returned by a wrapper becomes the result of the wrapped
//! operation. For resolutions it is cached as the atom's failure.

use std::any::Any;
use std::fmt;

use futures_util::future::{FutureExt, LocalBoxFuture};

use crate::atom::{AnyValue, AtomRef};
use crate::error::{BoxError, Result};
use crate::execution::ExecutionContext;
use crate::scope::Scope;
use crate::tag::TagStore;

/// The wrapped step of an atom resolution.
pub type ResolveFuture = LocalBoxFuture<'static, Result<AnyValue>>;

/// The wrapped step of an execution.
pub type ExecFuture = LocalBoxFuture<'static, Result<Box<dyn Any>>>;

/// What an execution is running.
#[derive(Clone)]
pub enum ExecTarget {
    /// A declared flow, with its metadata tags.
    Flow { name: String, tags: TagStore },
    /// An ad-hoc closure passed to `run`.
    Function { name: String },
}

impl ExecTarget {
    pub fn name(&self) -> &str {
        match self {
            ExecTarget::Flow { name, .. } | ExecTarget::Function { name } => name,
        }
    }

    pub fn is_flow(&self) -> bool {
        matches!(self, ExecTarget::Flow { .. })
    }
}

impl fmt::Debug for ExecTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecTarget::Flow { name, tags } => f
                .debug_struct("Flow")
                .field("name", name)
                .field("tags", tags)
                .finish(),
            ExecTarget::Function { name } => {
                f.debug_struct("Function").field("name", name).finish()
            }
        }
    }
}

/// Hooks wrapped around resolutions and executions.
///
/// Every method has a pass-through default, so an extension only implements
/// what it needs.
pub trait Extension {
    /// Name used in logs and in [`Error::ExtensionInit`](crate::Error::ExtensionInit).
    fn name(&self) -> &str;

    /// Called once per scope before the first resolution.
    fn init<'a>(&'a self, _scope: &'a Scope) -> LocalBoxFuture<'a, std::result::Result<(), BoxError>> {
        async { Ok(()) }.boxed_local()
    }

    fn wrap_resolve(&self, next: ResolveFuture, _atom: &AtomRef, _scope: &Scope) -> ResolveFuture {
        next
    }

    fn wrap_exec(
        &self,
        next: ExecFuture,
        _target: &ExecTarget,
        _ctx: &ExecutionContext,
    ) -> ExecFuture {
        next
    }

    /// Called when the scope is disposed, after every cleanup has run.
    fn dispose(&self, _scope: &Scope) {}
}
