//! Tether Core
//!
//! This crate provides the core runtime for the Tether dependency-injection
//! and reactive-state system. It implements:
//!
//! - Atoms: long-lived, cached computations with declared dependencies
//! - Scopes: the containers that resolve, cache, and clean up atoms
//! - Controllers and derived selections for reactive reads
//! - A sequential invalidation engine with loop detection
//! - Execution contexts that run short-lived flows with explicit close
//!   semantics
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `atom`: Atom definitions and their dependency declarations
//! - `scope`: Resolution, caching, cleanup, and the invalidation engine
//! - `reactive`: Controllers, subscriptions, and fine-grained selections
//! - `execution`: Flows and the hierarchical execution-context lifecycle
//! - `tag`: Typed keys for ambient configuration and request data
//! - `extension`: Hooks wrapped around every resolution and execution
//!
//! Everything runs on a single thread. Scopes are `!Send` and expect to be
//! driven from a current-thread tokio runtime inside a
//! [`tokio::task::LocalSet`], which is where invalidation frames are
//! scheduled.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{Atom, Scope};
//!
//! let counter = Atom::new("counter", |_| async { Ok(0) });
//! let doubled = Atom::builder("doubled")
//!     .reactive(&counter)
//!     .build({
//!         let counter = counter.clone();
//!         move |ctx| {
//!             let value = ctx.dep(&counter);
//!             async move { Ok(value? * 2) }
//!         }
//!     });
//!
//! let scope = Scope::new();
//! assert_eq!(scope.resolve(&doubled).await?, 0);
//!
//! scope.controller(&counter).set(21)?;
//! assert_eq!(scope.resolve(&doubled).await?, 42);
//! ```

pub mod atom;
pub mod error;
pub mod execution;
pub mod extension;
pub mod id;
pub mod reactive;
pub mod scope;
pub mod tag;

pub use atom::{Atom, AtomBuilder, AtomRef, AnyValue, Dependency};
pub use error::{BoxError, CleanupError, Error, Result, SharedError};
pub use execution::{
    CloseHandle, CloseMode, ContextStatus, ExecutionContext, Flow, FlowBuilder, Settled,
};
pub use extension::{ExecFuture, ExecTarget, Extension, ResolveFuture};
pub use id::{AtomId, ContextId, ListenerId};
pub use reactive::{Controller, ControllerEvent, SelectHandle, Subscription};
pub use scope::{
    create_scope, AtomContext, AtomSnapshot, AtomStatus, Preset, Scope, ScopeConfig,
    ScopeSnapshot,
};
pub use tag::{Tag, TagKey, TagStore};
