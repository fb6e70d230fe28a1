//! The handle a factory receives while it runs.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures_util::future::FutureExt;

use super::invalidation::Change;
use super::{downcast, Scope};
use crate::atom::{AnyValue, Atom, AtomRef};
use crate::error::{BoxError, Error, Result};
use crate::id::AtomId;
use crate::reactive::Controller;
use crate::tag::Tag;

struct ContextInner {
    scope: Scope,
    atom: AtomRef,
    epoch: u64,
    values: HashMap<AtomId, AnyValue>,
    path: Vec<AtomRef>,
}

/// Passed to every atom factory.
///
/// Gives access to declared dependency values, ad-hoc resolution, scope
/// tags, cleanup registration, and per-atom data that survives
/// re-resolution. Cheap to clone, so it can be moved into the factory's
/// future.
#[derive(Clone)]
pub struct AtomContext {
    inner: Rc<ContextInner>,
}

impl AtomContext {
    pub(crate) fn new(
        scope: Scope,
        atom: AtomRef,
        epoch: u64,
        values: HashMap<AtomId, AnyValue>,
        path: Vec<AtomRef>,
    ) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                scope,
                atom,
                epoch,
                values,
                path,
            }),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Name of the atom being resolved.
    pub fn name(&self) -> &str {
        self.inner.atom.name()
    }

    pub fn atom(&self) -> &AtomRef {
        &self.inner.atom
    }

    /// Value of a declared dependency.
    ///
    /// Falls back to whatever the scope has cached for undeclared atoms and
    /// fails with [`Error::NotResolved`] when there is nothing.
    pub fn dep<T: Clone + 'static>(&self, atom: &Atom<T>) -> Result<T> {
        if let Some(value) = self.inner.values.get(&atom.id()) {
            return downcast(atom.name(), value);
        }
        self.inner
            .scope
            .get(atom)?
            .ok_or_else(|| Error::NotResolved {
                atom: atom.name().to_string(),
            })
    }

    /// Resolve another atom on demand. No reactive edge is recorded.
    pub async fn resolve<T: Clone + 'static>(&self, atom: &Atom<T>) -> Result<T> {
        let value = self
            .inner
            .scope
            .resolve_in(atom.erased(), &self.inner.path)
            .await?;
        downcast(atom.name(), &value)
    }

    pub fn controller<T: Clone + 'static>(&self, atom: &Atom<T>) -> Controller<T> {
        self.inner.scope.controller(atom)
    }

    /// Read an ambient scope tag, falling back to its default.
    pub fn tag<T: Clone + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        self.inner.scope.tags().get(tag)
    }

    pub fn require_tag<T: Clone + 'static>(&self, tag: &Tag<T>) -> Result<T> {
        self.inner.scope.tags().require(tag)
    }

    /// Register a cleanup that runs before the next factory run, on release,
    /// or on dispose. Cleanups run newest first.
    pub fn cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + 'static,
    {
        self.cleanup_async(move || async move {
            cleanup();
            Ok(())
        });
    }

    /// Register a fallible, asynchronous cleanup. A failure is logged and
    /// the remaining cleanups still run.
    pub fn cleanup_async<F, Fut>(&self, cleanup: F)
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + 'static,
    {
        self.inner
            .scope
            .push_cleanup(&self.inner.atom, self.inner.epoch, Box::new(move || cleanup().boxed_local()));
    }

    /// Ask for this atom to be re-resolved once the current run settles.
    pub fn invalidate(&self) -> Result<()> {
        self.inner.scope.request(self.inner.atom.id(), Change::Invalidate)
    }

    /// Read per-atom data stored by an earlier run.
    pub fn data_get<T: Clone + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        self.inner.scope.data_get(self.inner.atom.id(), tag)
    }

    /// Store per-atom data. It survives invalidation but not release.
    pub fn data_set<T: Clone + 'static>(&self, tag: &Tag<T>, value: T) {
        self.inner.scope.data_set(self.inner.atom.id(), tag, value);
    }
}

impl fmt::Debug for AtomContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomContext")
            .field("atom", &self.inner.atom.name())
            .field("dependencies", &self.inner.values.len())
            .finish()
    }
}
