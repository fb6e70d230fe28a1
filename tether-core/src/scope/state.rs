//! Executor State
//!
//! Every atom a scope has touched gets one [`ExecutorState`]. The state is
//! the single source of truth for the atom inside that scope: its status,
//! cached value or error, cleanup stack, reactive dependents, listeners, and
//! any work parked while a resolution is in flight.

use std::rc::Rc;

use futures_util::future::{LocalBoxFuture, Shared};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use super::invalidation::Change;
use crate::atom::{AnyValue, AtomRef};
use crate::error::{BoxError, CleanupError, Error};
use crate::id::{AtomId, ListenerId};
use crate::reactive::ControllerEvent;
use crate::tag::TagStore;

/// Resolution status of an atom within one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomStatus {
    /// Never resolved in this scope.
    Idle,

    /// A factory run (or a set/update) is in progress. A previously
    /// resolved value stays readable.
    Resolving,

    /// A value is cached.
    Resolved,

    /// An error is cached until the atom is invalidated.
    Failed,
}

/// A cleanup callback, boxed so sync and async cleanups share one stack.
pub(crate) type CleanupFn = Box<dyn FnOnce() -> LocalBoxFuture<'static, Result<(), BoxError>>>;

/// One in-flight resolution, shared by every concurrent caller.
pub(crate) type SharedResolution = Shared<LocalBoxFuture<'static, Result<AnyValue, Error>>>;

/// A registered cleanup.
///
/// `seq` is a scope-wide registration counter, so cleanups from different
/// atoms can still be run in global reverse order on dispose.
pub(crate) struct Cleanup {
    pub seq: u64,
    pub owner: String,
    pub run: CleanupFn,
}

impl Cleanup {
    pub async fn run(self) {
        run_cleanup(&self.owner, self.run).await;
    }
}

/// Run one cleanup, logging a failure instead of returning it.
pub(crate) async fn run_cleanup(owner: &str, cleanup: CleanupFn) {
    if let Err(err) = cleanup().await {
        CleanupError::new(owner, err).report();
    }
}

/// Run a cleanup stack last-registered first.
pub(crate) async fn run_lifo(cleanups: Vec<Cleanup>) {
    for cleanup in cleanups.into_iter().rev() {
        cleanup.run().await;
    }
}

pub(crate) struct Listener {
    pub id: ListenerId,
    pub event: ControllerEvent,
    pub callback: Rc<dyn Fn()>,
}

pub(crate) struct ExecutorState {
    pub atom: AtomRef,
    pub status: AtomStatus,
    pub value: Option<AnyValue>,
    pub error: Option<Error>,

    /// Cleanups registered by the current factory run, in registration order.
    pub cleanups: Vec<Cleanup>,

    /// Atoms that declared this one as a reactive dependency.
    pub dependents: IndexSet<AtomId>,

    /// The in-flight resolution, if any.
    pub pending: Option<SharedResolution>,

    /// Identifies the resolution that owns `pending`. A resolution that
    /// finishes after its state was released and recreated is ignored.
    pub epoch: u64,

    pub listeners: Vec<Listener>,

    /// Invalidate/set/update requested while resolving; replayed next frame.
    pub parked: Option<Change>,

    /// Per-atom data that survives re-resolution.
    pub data: TagStore,
}

impl ExecutorState {
    pub fn new(atom: AtomRef) -> Self {
        Self {
            atom,
            status: AtomStatus::Idle,
            value: None,
            error: None,
            cleanups: Vec::new(),
            dependents: IndexSet::new(),
            pending: None,
            epoch: 0,
            listeners: Vec::new(),
            parked: None,
            data: TagStore::new(),
        }
    }

    /// Callbacks interested in `event`, cloned so they can run unborrowed.
    pub fn listeners_for(&self, event: ControllerEvent) -> Vec<Rc<dyn Fn()>> {
        self.listeners
            .iter()
            .filter(|listener| listener.event.accepts(event))
            .map(|listener| Rc::clone(&listener.callback))
            .collect()
    }
}
