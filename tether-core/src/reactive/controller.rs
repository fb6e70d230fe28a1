//! Controller
//!
//! The per-atom reactive handle. State transitions:
//!
//! ```text
//! idle -> resolving -> resolved
//!              |
//!              +-----> failed
//!
//! resolved | failed -> resolving   (invalidate, set, update)
//! ```
//!
//! `invalidate`, `set`, and `update` never run inline. They are queued on
//! the scope's invalidation engine and take effect when the frame drains.

use std::fmt;
use std::rc::Rc;

use crate::atom::{AnyValue, Atom};
use crate::error::Result;
use crate::scope::invalidation::{Change, Mutation};
use crate::scope::{downcast, AtomStatus, Scope};

use super::Subscription;

/// Which status transitions a listener wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerEvent {
    /// Entered `resolving`.
    Resolving,
    /// Settled with a value.
    Resolved,
    /// Settled with an error.
    Failed,
    /// Every transition.
    Any,
}

impl ControllerEvent {
    /// Whether a listener registered for `self` should see `event`.
    pub(crate) fn accepts(self, event: ControllerEvent) -> bool {
        self == ControllerEvent::Any || self == event
    }
}

/// Reactive handle for one atom in one scope.
pub struct Controller<T> {
    scope: Scope,
    atom: Atom<T>,
}

impl<T> Controller<T>
where
    T: Clone + 'static,
{
    pub(crate) fn new(scope: Scope, atom: Atom<T>) -> Self {
        Self { scope, atom }
    }

    pub fn atom(&self) -> &Atom<T> {
        &self.atom
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Current status; `Idle` when the scope has no state for the atom.
    pub fn state(&self) -> AtomStatus {
        self.scope.status(&self.atom)
    }

    /// Synchronous read.
    ///
    /// Fails with [`Error::NotResolved`](crate::Error::NotResolved) until a
    /// first value exists. While re-resolving this returns the previous
    /// value. A failed atom returns its cached error.
    pub fn get(&self) -> Result<T> {
        let value = self.scope.read(self.atom.erased())?;
        downcast(self.atom.name(), &value)
    }

    pub async fn resolve(&self) -> Result<T> {
        self.scope.resolve(&self.atom).await
    }

    /// Queue a re-resolution. A request made while the atom is resolving is
    /// replayed once that resolution settles.
    pub fn invalidate(&self) -> Result<()> {
        self.scope.request(self.atom.id(), Change::Invalidate)
    }

    /// Replace the value without running the factory.
    pub fn set(&self, value: T) -> Result<()> {
        let mutation: Mutation = Box::new(move |_| Ok(Rc::new(value) as AnyValue));
        self.scope
            .request(self.atom.id(), Change::Mutate(vec![mutation]))
    }

    /// Replace the value with `f(current)`.
    ///
    /// Updates queued in the same frame apply in order, each seeing the
    /// result of the previous one.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(T) -> T + 'static,
    {
        if self.state() == AtomStatus::Failed {
            self.scope.read(self.atom.erased())?;
        }

        let name = self.atom.name().to_string();
        let mutation: Mutation = Box::new(move |current: Option<&AnyValue>| {
            let current = current.ok_or_else(|| crate::Error::NotResolved {
                atom: name.clone(),
            })?;
            let next = f(downcast::<T>(&name, current)?);
            Ok(Rc::new(next) as AnyValue)
        });
        self.scope
            .request(self.atom.id(), Change::Mutate(vec![mutation]))
    }

    /// Listen for status transitions.
    pub fn on<F>(&self, event: ControllerEvent, listener: F) -> Result<Subscription>
    where
        F: Fn() + 'static,
    {
        self.scope
            .add_listener(self.atom.erased(), event, Rc::new(listener))
    }

    /// Run cleanups and forget the atom's state in this scope.
    pub async fn release(&self) -> Result<()> {
        self.scope.release(&self.atom).await
    }
}

impl<T> Clone for Controller<T> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            atom: self.atom.clone(),
        }
    }
}

impl<T> fmt::Debug for Controller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("atom", &self.atom.name())
            .field("scope", &self.scope.name())
            .finish()
    }
}
