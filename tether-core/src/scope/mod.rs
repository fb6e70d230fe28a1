//! Scope
//!
//! The scope is the resolution and caching container. It owns one
//! [`ExecutorState`](state::ExecutorState) per atom it has touched, the
//! reverse dependency edges used for invalidation, and every cleanup the
//! factories registered.
//!
//! # Resolution
//!
//! `resolve(atom)` walks through these steps:
//!
//! 1. A cached value (or cached error) is returned immediately.
//!
//! 2. If a resolution is already in flight, the caller joins it. Concurrent
//!    callers share one factory invocation and see the same result.
//!
//! 3. Otherwise required tags are checked, declared dependencies are
//!    resolved concurrently, reactive edges are recorded, and the factory
//!    runs through the extension chain.
//!
//! 4. The outcome is cached and listeners are notified.
//!
//! # Threading
//!
//! A scope is `!Send`. All state sits behind `RefCell`s that are never held
//! across an `.await` or a user callback, so cooperative interleaving on one
//! thread is the only synchronization needed.

mod config;
mod context;
pub(crate) mod invalidation;
mod snapshot;
pub(crate) mod state;

pub use config::{Preset, ScopeConfig};
pub use context::AtomContext;
pub use snapshot::{AtomSnapshot, ScopeSnapshot};
pub use state::AtomStatus;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use futures_util::future::{join_all, FutureExt, LocalBoxFuture, Shared};
use indexmap::IndexMap;
use tokio::sync::Notify;

use crate::atom::{AnyValue, Atom, AtomRef, Dependency};
use crate::error::{Error, Result};
use crate::execution::ExecutionContext;
use crate::extension::{ExecFuture, ExecTarget, Extension, ResolveFuture};
use crate::id::{AtomId, ListenerId};
use crate::reactive::{Controller, ControllerEvent, SelectHandle, Subscription};
use crate::tag::{Tag, TagStore};

use config::PresetTarget;
use invalidation::InvalidationQueue;
use state::{Cleanup, CleanupFn, ExecutorState, Listener};

/// Create a scope from a configuration.
pub fn create_scope(config: ScopeConfig) -> Scope {
    Scope::with_config(config)
}

pub(crate) struct ScopeInner {
    name: String,
    states: RefCell<IndexMap<AtomId, ExecutorState>>,
    presets: HashMap<AtomId, PresetTarget>,
    tags: TagStore,
    extensions: Vec<Rc<dyn Extension>>,
    ready: RefCell<Option<Shared<LocalBoxFuture<'static, Result<()>>>>>,
    queue: RefCell<InvalidationQueue>,
    settled: Notify,
    sequence: Cell<u64>,
    disposed: Cell<bool>,
    /// Set while an invalidation chain is being polled.
    in_chain: Cell<bool>,
    /// Cleanups registered by a run whose state was released or disposed.
    orphaned: RefCell<Vec<Cleanup>>,
}

/// The resolution and caching container.
///
/// Cloning a scope is cheap; clones share the same state.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<ScopeInner>,
}

impl Scope {
    /// Create a scope with no presets, extensions, or tags.
    pub fn new() -> Self {
        Self::with_config(ScopeConfig::default())
    }

    pub fn with_config(config: ScopeConfig) -> Self {
        let presets = config.preset_map();
        let ScopeConfig {
            name,
            extensions,
            tags,
            ..
        } = config;

        Self {
            inner: Rc::new(ScopeInner {
                name: name.unwrap_or_else(|| "scope".to_string()),
                states: RefCell::new(IndexMap::new()),
                presets,
                tags,
                extensions,
                ready: RefCell::new(None),
                queue: RefCell::new(InvalidationQueue::default()),
                settled: Notify::new(),
                sequence: Cell::new(0),
                disposed: Cell::new(false),
                in_chain: Cell::new(false),
                orphaned: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Ambient tags provided at creation.
    pub fn tags(&self) -> &TagStore {
        &self.inner.tags
    }

    /// Read an ambient tag, falling back to its default.
    pub fn tag<T: Clone + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        self.inner.tags.get(tag)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.get() {
            Err(Error::ScopeDisposed)
        } else {
            Ok(())
        }
    }

    fn next_sequence(&self) -> u64 {
        let next = self.inner.sequence.get() + 1;
        self.inner.sequence.set(next);
        next
    }

    /// Resolves once every extension's `init` has completed.
    pub async fn ready(&self) -> Result<()> {
        self.ensure_live()?;
        let ready = {
            let mut slot = self.inner.ready.borrow_mut();
            slot.get_or_insert_with(|| {
                let weak = Rc::downgrade(&self.inner);
                async move {
                    match weak.upgrade() {
                        Some(inner) => Scope { inner }.init_extensions().await,
                        None => Err(Error::ScopeDisposed),
                    }
                }
                .boxed_local()
                .shared()
            })
            .clone()
        };
        ready.await
    }

    async fn init_extensions(&self) -> Result<()> {
        for extension in &self.inner.extensions {
            extension
                .init(self)
                .await
                .map_err(|source| Error::ExtensionInit {
                    extension: extension.name().to_string(),
                    source: Arc::from(source),
                })?;
            tracing::debug!(scope = %self.inner.name, extension = extension.name(), "extension initialized");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------------

    /// Resolve an atom, running its factory if nothing is cached.
    ///
    /// Any invalidation frame that is queued but has not started yet is
    /// settled first, so the returned value reflects every `set`, `update`,
    /// and `invalidate` issued before this call.
    pub async fn resolve<T: Clone + 'static>(&self, atom: &Atom<T>) -> Result<T> {
        self.ensure_live()?;
        self.drain_unstarted().await;
        let value = self.resolve_in(atom.erased(), &[]).await?;
        downcast(atom.name(), &value)
    }

    /// Run a frame that was queued but has not started, so top-level reads
    /// observe every earlier `set`, `update`, and `invalidate`.
    pub(crate) async fn drain_unstarted(&self) {
        if self.has_unstarted_frame() {
            self.drain().await;
        }
    }

    /// Resolve an erased atom. `path` holds the atoms whose resolution is
    /// waiting on this one and is used to reject circular declarations.
    pub(crate) async fn resolve_in(&self, atom: &AtomRef, path: &[AtomRef]) -> Result<AnyValue> {
        self.ensure_live()?;
        if path.contains(atom) {
            let mut cycle: Vec<String> = path
                .iter()
                .skip_while(|entry| *entry != atom)
                .map(|entry| entry.name().to_string())
                .collect();
            cycle.push(atom.name().to_string());
            return Err(Error::CircularDependency { path: cycle });
        }
        self.ready().await?;

        let (resolution, announce) = {
            let mut states = self.inner.states.borrow_mut();
            let state = states
                .entry(atom.id())
                .or_insert_with(|| ExecutorState::new(atom.clone()));

            match (state.status, &state.value, &state.error) {
                (AtomStatus::Resolved, Some(value), _) => return Ok(Rc::clone(value)),
                (AtomStatus::Failed, _, Some(error)) => return Err(error.clone()),
                _ => {}
            }

            match &state.pending {
                Some(pending) => (pending.clone(), false),
                None => {
                    let announce = state.status == AtomStatus::Idle;
                    let epoch = self.next_sequence();
                    let mut chain = path.to_vec();
                    chain.push(atom.clone());

                    let resolution = self
                        .clone()
                        .run_factory(atom.clone(), chain, epoch)
                        .shared();

                    state.status = AtomStatus::Resolving;
                    state.epoch = epoch;
                    state.pending = Some(resolution.clone());
                    (resolution, announce)
                }
            }
        };

        if announce {
            self.notify(atom.id(), ControllerEvent::Resolving);
        }
        resolution.await
    }

    fn run_factory(self, atom: AtomRef, path: Vec<AtomRef>, epoch: u64) -> ResolveFuture {
        async move {
            tracing::debug!(scope = %self.inner.name, atom = atom.name(), "resolving atom");
            let outcome = self.execute(&atom, &path, epoch).await;
            self.settle_resolution(&atom, epoch, &outcome);
            self.run_orphaned().await;
            outcome
        }
        .boxed_local()
    }

    async fn execute(&self, atom: &AtomRef, path: &[AtomRef], epoch: u64) -> Result<AnyValue> {
        let definition = match self.inner.presets.get(&atom.id()) {
            Some(PresetTarget::Value(value)) => return Ok(Rc::clone(value)),
            Some(PresetTarget::Atom(replacement)) => replacement.clone(),
            None => atom.clone(),
        };

        for dependency in definition.dependencies() {
            if let Dependency::Tag {
                key,
                label,
                has_default,
            } = dependency
            {
                if !has_default && !self.inner.tags.contains_key(*key) {
                    return Err(Error::TagNotFound {
                        label: label.to_string(),
                    });
                }
            }
        }

        let eager: Vec<&AtomRef> = definition
            .dependencies()
            .iter()
            .filter(|dependency| dependency.is_eager())
            .filter_map(Dependency::atom)
            .collect();

        let results = join_all(eager.iter().map(|dep| self.resolve_in(dep, path))).await;

        let mut values = HashMap::with_capacity(eager.len());
        for (dep, result) in eager.iter().zip(results) {
            match result {
                Ok(value) => {
                    values.insert(dep.id(), value);
                }
                Err(err) => {
                    return Err(Error::ExecutorResolution {
                        atom: atom.name().to_string(),
                        source: Arc::new(err),
                    })
                }
            }
        }

        for dependency in definition.dependencies() {
            if let Dependency::Reactive(source) = dependency {
                self.add_dependent(source.id(), atom.id());
            }
        }

        let ctx = AtomContext::new(self.clone(), atom.clone(), epoch, values, path.to_vec());
        let name = atom.name().to_string();
        let next: ResolveFuture = (definition.factory())(ctx)
            .map(move |result| result.map_err(|err| Error::resolution(&name, err)))
            .boxed_local();

        self.wrap_resolve(next, atom).await
    }

    fn wrap_resolve(&self, next: ResolveFuture, atom: &AtomRef) -> ResolveFuture {
        self.inner
            .extensions
            .iter()
            .rev()
            .fold(next, |next, extension| extension.wrap_resolve(next, atom, self))
    }

    pub(crate) fn wrap_exec(
        &self,
        next: ExecFuture,
        target: &ExecTarget,
        ctx: &ExecutionContext,
    ) -> ExecFuture {
        self.inner
            .extensions
            .iter()
            .rev()
            .fold(next, |next, extension| extension.wrap_exec(next, target, ctx))
    }

    fn settle_resolution(&self, atom: &AtomRef, epoch: u64, outcome: &Result<AnyValue>) {
        let event = {
            let mut states = self.inner.states.borrow_mut();
            let Some(state) = states.get_mut(&atom.id()) else {
                return;
            };
            if state.epoch != epoch {
                return;
            }

            state.pending = None;
            match outcome {
                Ok(value) => {
                    state.status = AtomStatus::Resolved;
                    state.value = Some(Rc::clone(value));
                    state.error = None;
                    ControllerEvent::Resolved
                }
                Err(err) => {
                    state.status = AtomStatus::Failed;
                    state.value = None;
                    state.error = Some(err.clone());
                    ControllerEvent::Failed
                }
            }
        };

        match outcome {
            Ok(_) => tracing::debug!(scope = %self.inner.name, atom = atom.name(), "atom resolved"),
            Err(err) => {
                tracing::debug!(scope = %self.inner.name, atom = atom.name(), error = %err, "atom failed")
            }
        }

        self.notify_settled(atom.id(), event);
        self.replay_parked(atom.id());
    }

    fn add_dependent(&self, source: AtomId, dependent: AtomId) {
        if let Some(state) = self.inner.states.borrow_mut().get_mut(&source) {
            state.dependents.insert(dependent);
        }
    }

    // ------------------------------------------------------------------------
    // Synchronous reads
    // ------------------------------------------------------------------------

    /// Read an atom without triggering resolution.
    ///
    /// Returns `None` when the atom has no value yet. While an atom is
    /// re-resolving this returns the previous value. A failed atom returns
    /// its cached error.
    pub fn get<T: Clone + 'static>(&self, atom: &Atom<T>) -> Result<Option<T>> {
        self.ensure_live()?;
        let states = self.inner.states.borrow();
        let Some(state) = states.get(&atom.id()) else {
            return Ok(None);
        };
        match (state.status, &state.error) {
            (AtomStatus::Failed, Some(error)) => Err(error.clone()),
            _ => state
                .value
                .as_ref()
                .map(|value| downcast(atom.name(), value))
                .transpose(),
        }
    }

    /// Controller semantics of a synchronous read.
    pub(crate) fn read(&self, atom: &AtomRef) -> Result<AnyValue> {
        self.ensure_live()?;
        let not_resolved = || Error::NotResolved {
            atom: atom.name().to_string(),
        };
        let states = self.inner.states.borrow();
        let state = states.get(&atom.id()).ok_or_else(not_resolved)?;
        match state.status {
            AtomStatus::Idle => Err(not_resolved()),
            AtomStatus::Resolving | AtomStatus::Resolved => {
                state.value.clone().ok_or_else(not_resolved)
            }
            AtomStatus::Failed => Err(state.error.clone().unwrap_or_else(not_resolved)),
        }
    }

    /// Current status of an atom; `Idle` when the scope has never seen it.
    pub fn status<T>(&self, atom: &Atom<T>) -> AtomStatus {
        self.status_of(atom.id())
    }

    pub(crate) fn status_of(&self, atom: AtomId) -> AtomStatus {
        self.inner
            .states
            .borrow()
            .get(&atom)
            .map_or(AtomStatus::Idle, |state| state.status)
    }

    // ------------------------------------------------------------------------
    // Reactive surface
    // ------------------------------------------------------------------------

    /// Reactive handle for an atom in this scope.
    pub fn controller<T: Clone + 'static>(&self, atom: &Atom<T>) -> Controller<T> {
        Controller::new(self.clone(), atom.clone())
    }

    /// Subscribe to one event (or all events) of an atom.
    pub fn on<T, F>(&self, atom: &Atom<T>, event: ControllerEvent, listener: F) -> Result<Subscription>
    where
        F: Fn() + 'static,
    {
        self.add_listener(atom.erased(), event, Rc::new(listener))
    }

    /// Subscribe to every new resolved value of an atom.
    pub fn on_update<T, F>(&self, atom: &Atom<T>, listener: F) -> Result<Subscription>
    where
        F: Fn() + 'static,
    {
        self.on(atom, ControllerEvent::Resolved, listener)
    }

    /// Derived subscription using `PartialEq` to suppress unchanged values.
    pub fn select<T, S, F>(&self, atom: &Atom<T>, selector: F) -> Result<SelectHandle<S>>
    where
        T: Clone + 'static,
        S: Clone + PartialEq + 'static,
        F: Fn(&T) -> S + 'static,
    {
        self.select_with(atom, selector, |a: &S, b: &S| a == b)
    }

    /// Derived subscription with a custom equality function.
    pub fn select_with<T, S, F, E>(
        &self,
        atom: &Atom<T>,
        selector: F,
        eq: E,
    ) -> Result<SelectHandle<S>>
    where
        T: Clone + 'static,
        S: Clone + 'static,
        F: Fn(&T) -> S + 'static,
        E: Fn(&S, &S) -> bool + 'static,
    {
        self.ensure_live()?;
        SelectHandle::new(self.controller(atom), selector, eq)
    }

    pub(crate) fn add_listener(
        &self,
        atom: &AtomRef,
        event: ControllerEvent,
        callback: Rc<dyn Fn()>,
    ) -> Result<Subscription> {
        self.ensure_live()?;
        let id = ListenerId::new();
        self.inner
            .states
            .borrow_mut()
            .entry(atom.id())
            .or_insert_with(|| ExecutorState::new(atom.clone()))
            .listeners
            .push(Listener {
                id,
                event,
                callback,
            });

        let weak: Weak<ScopeInner> = Rc::downgrade(&self.inner);
        let atom_id = atom.id();
        Ok(Subscription::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Dropped after the borrow ends: a callback may own subscriptions.
            let removed: Vec<Listener> = match inner.states.borrow_mut().get_mut(&atom_id) {
                Some(state) => {
                    let (removed, kept) = std::mem::take(&mut state.listeners)
                        .into_iter()
                        .partition(|listener| listener.id == id);
                    state.listeners = kept;
                    removed
                }
                None => Vec::new(),
            };
            drop(removed);
        }))
    }

    pub(crate) fn notify(&self, atom: AtomId, event: ControllerEvent) {
        let callbacks = self
            .inner
            .states
            .borrow()
            .get(&atom)
            .map(|state| state.listeners_for(event))
            .unwrap_or_default();

        if callbacks.is_empty() {
            return;
        }
        tracing::trace!(scope = %self.inner.name, %atom, ?event, listeners = callbacks.len(), "notifying listeners");
        for callback in callbacks {
            callback();
        }
    }

    // ------------------------------------------------------------------------
    // Cleanup and data
    // ------------------------------------------------------------------------

    /// Attach a cleanup to the run identified by `epoch`. When that run's
    /// state is gone (released, disposed, or replaced by a newer run) the
    /// cleanup is orphaned and runs once the current resolution settles.
    pub(crate) fn push_cleanup(&self, atom: &AtomRef, epoch: u64, run: CleanupFn) {
        let cleanup = Cleanup {
            seq: self.next_sequence(),
            owner: atom.name().to_string(),
            run,
        };
        let mut states = self.inner.states.borrow_mut();
        match states.get_mut(&atom.id()) {
            Some(state) if state.epoch == epoch && !self.inner.disposed.get() => {
                state.cleanups.push(cleanup);
            }
            _ => {
                tracing::debug!(scope = %self.inner.name, atom = atom.name(), "cleanup registered after its run ended");
                self.inner.orphaned.borrow_mut().push(cleanup);
            }
        }
    }

    async fn run_orphaned(&self) {
        let orphaned = std::mem::take(&mut *self.inner.orphaned.borrow_mut());
        if !orphaned.is_empty() {
            state::run_lifo(orphaned).await;
        }
    }

    pub(crate) fn data_get<T: Clone + 'static>(&self, atom: AtomId, tag: &Tag<T>) -> Option<T> {
        self.inner
            .states
            .borrow()
            .get(&atom)
            .and_then(|state| state.data.get(tag))
    }

    pub(crate) fn data_set<T: Clone + 'static>(&self, atom: AtomId, tag: &Tag<T>, value: T) {
        if let Some(state) = self.inner.states.borrow_mut().get_mut(&atom) {
            state.data.set(tag, value);
        }
    }

    /// Run an atom's cleanups and forget its state, listeners included.
    pub async fn release<T>(&self, atom: &Atom<T>) -> Result<()> {
        self.release_any(atom.erased()).await
    }

    pub(crate) async fn release_any(&self, atom: &AtomRef) -> Result<()> {
        self.ensure_live()?;
        let removed = {
            let mut states = self.inner.states.borrow_mut();
            let removed = states.shift_remove(&atom.id());
            for state in states.values_mut() {
                state.dependents.shift_remove(&atom.id());
            }
            removed
        };

        if let Some(state) = removed {
            tracing::debug!(scope = %self.inner.name, atom = atom.name(), "releasing atom");
            state::run_lifo(state.cleanups).await;
        }
        Ok(())
    }

    /// Tear the scope down.
    ///
    /// Every cleanup of every atom runs, newest registration first,
    /// regardless of which atom registered it. The scope rejects all
    /// further operations afterwards. Calling `dispose` again is a no-op.
    pub async fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        tracing::debug!(scope = %self.inner.name, "disposing scope");

        let states = std::mem::take(&mut *self.inner.states.borrow_mut());
        self.inner.queue.borrow_mut().clear();

        let mut cleanups: Vec<Cleanup> = std::mem::take(&mut *self.inner.orphaned.borrow_mut());
        for (_, state) in states {
            cleanups.extend(state.cleanups);
        }
        cleanups.sort_by_key(|cleanup| cleanup.seq);
        state::run_lifo(cleanups).await;

        for extension in self.inner.extensions.iter().rev() {
            extension.dispose(self);
        }
        self.inner.settled.notify_waiters();
    }

    /// Serializable view of every atom this scope holds.
    pub fn snapshot(&self) -> Result<ScopeSnapshot> {
        self.ensure_live()?;
        let states = self.inner.states.borrow();
        Ok(ScopeSnapshot::capture(&self.inner.name, &states))
    }

    /// Root execution context bound to this scope.
    pub fn create_context(&self) -> Result<ExecutionContext> {
        self.ensure_live()?;
        Ok(ExecutionContext::root(self.clone()))
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.inner.name)
            .field("atoms", &self.inner.states.borrow().len())
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}

pub(crate) fn downcast<T: Clone + 'static>(atom: &str, value: &AnyValue) -> Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| Error::TypeMismatch {
            atom: atom.to_string(),
        })
}
