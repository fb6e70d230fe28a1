//! Invalidation Engine
//!
//! Changes to resolved atoms (invalidate, set, update) never run inline.
//! They are queued per scope and processed in frames.
//!
//! # Frames
//!
//! 1. A request lands in an insertion-ordered queue keyed by atom. Repeated
//!    requests for the same atom collapse: two invalidations become one
//!    factory run, set/update mutations accumulate in order, and between an
//!    invalidation and a mutation the later request wins.
//!
//! 2. The first request of a frame schedules a drain on the local task set.
//!
//! 3. The drain takes roots in queue order and processes each chain
//!    depth-first: apply the change, then walk every reactive dependent, each
//!    dependent finishing its own downstream walk before the next sibling.
//!
//! 4. Work parked while an atom was resolving (a factory invalidating itself,
//!    a set issued mid-resolution) becomes the next frame.
//!
//! # Loop detection
//!
//! The chain keeps the path of atoms it is currently visiting. A dependent
//! walk, or a request issued from inside the chain (a factory or listener
//! running while the chain is polled), that reaches an atom already on that
//! path fails with
//! [`Error::InfiniteInvalidationLoop`]. The error goes back to whoever issued
//! the request, is logged, and is reported by the next [`Scope::flush`].

use std::future::Future;

use futures_util::future::{poll_fn, FutureExt, LocalBoxFuture};
use indexmap::map::Entry;
use indexmap::IndexMap;
use smallvec::SmallVec;

use super::state::{self, AtomStatus};
use super::Scope;
use crate::atom::AnyValue;
use crate::error::{Error, Result};
use crate::id::AtomId;
use crate::reactive::ControllerEvent;

/// A value replacement queued by `set` or `update`.
///
/// Receives the current value (if any) and produces the next one.
pub(crate) type Mutation = Box<dyn FnOnce(Option<&AnyValue>) -> Result<AnyValue>>;

/// A queued change to one atom.
pub(crate) enum Change {
    /// Run cleanups and re-run the factory.
    Invalidate,
    /// Run cleanups and replace the value without running the factory.
    Mutate(Vec<Mutation>),
}

impl Change {
    /// Collapse a later request for the same atom into this one.
    pub(crate) fn merge(self, later: Change) -> Change {
        match (self, later) {
            (Change::Mutate(mut earlier), Change::Mutate(more)) => {
                earlier.extend(more);
                Change::Mutate(earlier)
            }
            (_, later) => later,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Change::Invalidate => "invalidate",
            Change::Mutate(_) => "mutate",
        }
    }
}

fn merge_into(queue: &mut IndexMap<AtomId, Change>, atom: AtomId, change: Change) {
    match queue.entry(atom) {
        Entry::Occupied(mut entry) => {
            let earlier = std::mem::replace(entry.get_mut(), Change::Invalidate);
            *entry.get_mut() = earlier.merge(change);
        }
        Entry::Vacant(entry) => {
            entry.insert(change);
        }
    }
}

/// Per-scope queue state.
#[derive(Default)]
pub(crate) struct InvalidationQueue {
    /// Roots of the current frame.
    pending: IndexMap<AtomId, Change>,
    /// Work for the next frame.
    deferred: IndexMap<AtomId, Change>,
    /// Atoms on the chain being processed, root first.
    path: SmallVec<[AtomId; 8]>,
    processing: bool,
    scheduled: bool,
    /// First chain failure since the last flush.
    failure: Option<Error>,
}

impl InvalidationQueue {
    fn is_idle(&self) -> bool {
        !self.processing && self.pending.is_empty() && self.deferred.is_empty()
    }

    fn record(&mut self, err: Error) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.deferred.clear();
        self.path.clear();
        self.failure = None;
    }
}

impl Scope {
    /// Queue a change for `atom`.
    ///
    /// Invalidating an atom that never resolved is a no-op; mutating one is
    /// an error.
    pub(crate) fn request(&self, atom: AtomId, change: Change) -> Result<()> {
        self.ensure_live()?;

        let mut states = self.inner.states.borrow_mut();
        let Some(state) = states.get_mut(&atom) else {
            return match change {
                Change::Invalidate => Ok(()),
                Change::Mutate(_) => Err(Error::NotResolved {
                    atom: atom.to_string(),
                }),
            };
        };

        match state.status {
            AtomStatus::Idle => {
                return match change {
                    Change::Invalidate => Ok(()),
                    Change::Mutate(_) => Err(Error::NotResolved {
                        atom: state.atom.name().to_string(),
                    }),
                };
            }
            AtomStatus::Resolving => {
                tracing::trace!(atom = state.atom.name(), change = change.kind(), "parking change until resolution settles");
                state.parked = Some(match state.parked.take() {
                    Some(earlier) => earlier.merge(change),
                    None => change,
                });
                return Ok(());
            }
            AtomStatus::Resolved | AtomStatus::Failed => {}
        }

        let mut queue = self.inner.queue.borrow_mut();
        if self.inner.in_chain.get() {
            if let Some(position) = queue.path.iter().position(|id| *id == atom) {
                let mut path: Vec<String> = queue.path[position..]
                    .iter()
                    .filter_map(|id| states.get(id))
                    .map(|entry| entry.atom.name().to_string())
                    .collect();
                path.push(state_name(&states, atom));
                let err = Error::InfiniteInvalidationLoop { path };
                tracing::error!(scope = %self.inner.name, error = %err, "invalidation loop");
                queue.record(err.clone());
                return Err(err);
            }
        }

        merge_into(&mut queue.pending, atom, change);
        drop(states);
        self.schedule(&mut queue);
        Ok(())
    }

    /// Queue parked work without validation. Lands in the next frame when a
    /// chain is running.
    pub(crate) fn defer(&self, atom: AtomId, change: Change) {
        if self.inner.disposed.get() {
            return;
        }
        let mut queue = self.inner.queue.borrow_mut();
        if queue.processing {
            merge_into(&mut queue.deferred, atom, change);
        } else {
            merge_into(&mut queue.pending, atom, change);
            self.schedule(&mut queue);
        }
    }

    /// Replay whatever was parked on `atom` while it was resolving.
    pub(crate) fn replay_parked(&self, atom: AtomId) {
        let parked = self
            .inner
            .states
            .borrow_mut()
            .get_mut(&atom)
            .and_then(|state| state.parked.take());
        if let Some(change) = parked {
            self.defer(atom, change);
        }
    }

    fn schedule(&self, queue: &mut InvalidationQueue) {
        if queue.scheduled || queue.processing {
            return;
        }
        queue.scheduled = true;
        let scope = self.clone();
        tokio::task::spawn_local(async move {
            scope.drain().await;
        });
    }

    pub(crate) fn has_unstarted_frame(&self) -> bool {
        let queue = self.inner.queue.borrow();
        !queue.processing && !queue.pending.is_empty()
    }

    /// Process every root queued for the current frame.
    pub(crate) async fn drain(&self) {
        {
            let mut queue = self.inner.queue.borrow_mut();
            if queue.processing {
                return;
            }
            queue.processing = true;
            queue.scheduled = false;
        }

        loop {
            if self.inner.disposed.get() {
                break;
            }
            let next = {
                let mut queue = self.inner.queue.borrow_mut();
                queue.path.clear();
                queue.pending.shift_remove_index(0)
            };
            let Some((atom, change)) = next else {
                break;
            };

            tracing::debug!(scope = %self.inner.name, %atom, change = change.kind(), "processing invalidation chain");
            if let Err(err) = self.run_chain(atom, change).await {
                tracing::debug!(scope = %self.inner.name, %atom, error = %err, "invalidation chain stopped");
                self.inner.queue.borrow_mut().record(err);
            }
        }

        {
            let mut queue = self.inner.queue.borrow_mut();
            queue.processing = false;
            queue.path.clear();
            if !queue.deferred.is_empty() && !self.inner.disposed.get() {
                let next = std::mem::take(&mut queue.deferred);
                for (atom, change) in next {
                    merge_into(&mut queue.pending, atom, change);
                }
                self.schedule(&mut queue);
            }
        }
        self.inner.settled.notify_waiters();
    }

    /// Wait until no frame is queued or running.
    pub(crate) async fn settle(&self) {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (idle, processing) = {
                let queue = self.inner.queue.borrow();
                (queue.is_idle(), queue.processing)
            };
            if idle || self.inner.disposed.get() {
                return;
            }
            if !processing {
                self.drain().await;
                continue;
            }
            notified.await;
        }
    }

    /// Wait for all queued invalidation work to settle.
    ///
    /// Returns the first chain failure (such as a detected loop) recorded
    /// since the previous flush.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_live()?;
        self.settle().await;
        match self.inner.queue.borrow_mut().failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Process one root, marking the scope as inside the chain for as long
    /// as the chain itself is being polled. Requests issued by other tasks
    /// while the chain waits are plain queue entries.
    async fn run_chain(&self, atom: AtomId, change: Change) -> Result<()> {
        let mut chain = self.process(atom, change);
        poll_fn(|cx| {
            let outer = self.inner.in_chain.replace(true);
            let poll = chain.as_mut().poll(cx);
            self.inner.in_chain.set(outer);
            poll
        })
        .await
    }

    /// Notify listeners of a settled resolution. When the chain is the one
    /// refreshing `atom`, the listeners count as part of the chain even if
    /// another task happened to drive the shared resolution to completion.
    pub(crate) fn notify_settled(&self, atom: AtomId, event: ControllerEvent) {
        let owned = {
            let queue = self.inner.queue.borrow();
            queue.processing && queue.path.last() == Some(&atom)
        };
        let outer = self.inner.in_chain.replace(self.inner.in_chain.get() || owned);
        self.notify(atom, event);
        self.inner.in_chain.set(outer);
    }

    fn enter(&self, atom: AtomId) -> Result<()> {
        let mut queue = self.inner.queue.borrow_mut();
        if let Some(position) = queue.path.iter().position(|id| *id == atom) {
            let states = self.inner.states.borrow();
            let mut path: Vec<String> = queue.path[position..]
                .iter()
                .map(|id| state_name(&states, *id))
                .collect();
            path.push(state_name(&states, atom));
            let err = Error::InfiniteInvalidationLoop { path };
            tracing::error!(scope = %self.inner.name, error = %err, "invalidation loop");
            queue.record(err.clone());
            return Err(err);
        }
        queue.path.push(atom);
        Ok(())
    }

    fn process(&self, atom: AtomId, change: Change) -> LocalBoxFuture<'_, Result<()>> {
        async move {
            self.enter(atom)?;

            let result = async {
                let changed = match change {
                    Change::Invalidate => self.refresh(atom).await,
                    Change::Mutate(mutations) => self.apply_mutations(atom, mutations).await,
                };
                if changed {
                    for dependent in self.dependents_of(atom) {
                        self.process(dependent, Change::Invalidate).await?;
                    }
                }
                Ok::<(), Error>(())
            }
            .await;

            self.inner.queue.borrow_mut().path.pop();
            result
        }
        .boxed_local()
    }

    fn dependents_of(&self, atom: AtomId) -> Vec<AtomId> {
        let states = self.inner.states.borrow();
        let Some(state) = states.get(&atom) else {
            return Vec::new();
        };
        state
            .dependents
            .iter()
            .copied()
            .filter(|id| {
                states
                    .get(id)
                    .is_some_and(|dependent| dependent.status != AtomStatus::Idle)
            })
            .collect()
    }

    /// Run cleanups and re-run the factory. Returns whether the atom was
    /// actually refreshed.
    async fn refresh(&self, atom: AtomId) -> bool {
        let cleanups = {
            let mut states = self.inner.states.borrow_mut();
            let Some(state) = states.get_mut(&atom) else {
                return false;
            };
            match state.status {
                AtomStatus::Idle => return false,
                AtomStatus::Resolving => {
                    state.parked = Some(match state.parked.take() {
                        Some(earlier) => earlier.merge(Change::Invalidate),
                        None => Change::Invalidate,
                    });
                    return false;
                }
                AtomStatus::Resolved | AtomStatus::Failed => std::mem::take(&mut state.cleanups),
            }
        };

        state::run_lifo(cleanups).await;

        let atom_ref = {
            let mut states = self.inner.states.borrow_mut();
            let Some(state) = states.get_mut(&atom) else {
                return false;
            };
            if state.status == AtomStatus::Resolving {
                return false;
            }
            state.status = AtomStatus::Resolving;
            state.error = None;
            state.atom.clone()
        };

        self.notify(atom, ControllerEvent::Resolving);
        if let Err(err) = self.resolve_in(&atom_ref, &[]).await {
            tracing::debug!(scope = %self.inner.name, atom = atom_ref.name(), error = %err, "re-resolution failed");
        }
        true
    }

    /// Run cleanups and replace the value through the mutation list.
    async fn apply_mutations(&self, atom: AtomId, mutations: Vec<Mutation>) -> bool {
        let cleanups = {
            let mut states = self.inner.states.borrow_mut();
            let Some(state) = states.get_mut(&atom) else {
                return false;
            };
            match state.status {
                AtomStatus::Idle => return false,
                AtomStatus::Resolving => {
                    let change = Change::Mutate(mutations);
                    state.parked = Some(match state.parked.take() {
                        Some(earlier) => earlier.merge(change),
                        None => change,
                    });
                    return false;
                }
                AtomStatus::Resolved | AtomStatus::Failed => std::mem::take(&mut state.cleanups),
            }
        };

        state::run_lifo(cleanups).await;

        let mut current = {
            let mut states = self.inner.states.borrow_mut();
            let Some(state) = states.get_mut(&atom) else {
                return false;
            };
            state.status = AtomStatus::Resolving;
            state.value.clone()
        };
        self.notify(atom, ControllerEvent::Resolving);

        let mut outcome = Ok(());
        for mutation in mutations {
            match mutation(current.as_ref()) {
                Ok(value) => current = Some(value),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        let event = {
            let mut states = self.inner.states.borrow_mut();
            let Some(state) = states.get_mut(&atom) else {
                return false;
            };
            match (outcome, current) {
                (Ok(()), Some(value)) => {
                    state.status = AtomStatus::Resolved;
                    state.value = Some(value);
                    state.error = None;
                    ControllerEvent::Resolved
                }
                (Err(err), _) => {
                    state.status = AtomStatus::Failed;
                    state.value = None;
                    state.error = Some(err);
                    ControllerEvent::Failed
                }
                (Ok(()), None) => {
                    state.status = AtomStatus::Failed;
                    state.value = None;
                    state.error = Some(Error::NotResolved {
                        atom: state.atom.name().to_string(),
                    });
                    ControllerEvent::Failed
                }
            }
        };

        self.notify(atom, event);
        self.replay_parked(atom);
        true
    }
}

fn state_name(states: &IndexMap<AtomId, state::ExecutorState>, atom: AtomId) -> String {
    states
        .get(&atom)
        .map(|state| state.atom.name().to_string())
        .unwrap_or_else(|| atom.to_string())
}
