//! Atom Definitions
//!
//! An [`Atom`] is an immutable declaration of a long-lived, cacheable
//! computation. It carries a factory, the dependencies that must be
//! available before the factory runs, and optional metadata tags. It holds no
//! runtime state: every scope that resolves the atom keeps its own executor
//! state keyed by the atom's [`AtomId`].
//!
//! # Dependencies
//!
//! Dependencies are declared on the [`AtomBuilder`] and recorded as
//! [`Dependency`] values:
//!
//! - `dep(&a)` resolves `a` before the factory runs.
//! - `reactive(&a)` does the same and also records an edge so that when `a`
//!   changes, this atom is re-resolved by the invalidation engine.
//! - `lazy(&a)` only documents the relationship; the factory obtains a
//!   controller for `a` and resolves it when it wants to.
//! - `require_tag(&t)` fails resolution unless the scope provides `t`.
//!
//! Declared atom dependencies are resolved concurrently.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::rc::Rc;

use futures_util::future::{FutureExt, LocalBoxFuture};

use crate::error::BoxError;
use crate::id::AtomId;
use crate::scope::AtomContext;
use crate::tag::{Tag, TagKey, TagStore};

/// A type-erased atom value as stored in a scope.
pub type AnyValue = Rc<dyn Any>;

pub(crate) type ErasedFactory =
    Rc<dyn Fn(AtomContext) -> LocalBoxFuture<'static, Result<AnyValue, BoxError>>>;

/// A declared dependency of an atom or flow.
#[derive(Clone)]
pub enum Dependency {
    /// Resolved before the factory runs.
    Atom(AtomRef),
    /// Resolved before the factory runs; changes propagate to the dependent.
    Reactive(AtomRef),
    /// Not resolved up front.
    Lazy(AtomRef),
    /// A scope tag that must be present (or defaulted).
    Tag {
        key: TagKey,
        label: &'static str,
        has_default: bool,
    },
}

impl Dependency {
    /// The atom this dependency refers to, if any.
    pub fn atom(&self) -> Option<&AtomRef> {
        match self {
            Dependency::Atom(atom) | Dependency::Reactive(atom) | Dependency::Lazy(atom) => {
                Some(atom)
            }
            Dependency::Tag { .. } => None,
        }
    }

    /// Whether the dependency must be resolved before the factory runs.
    pub fn is_eager(&self) -> bool {
        matches!(self, Dependency::Atom(_) | Dependency::Reactive(_))
    }

    pub fn is_reactive(&self) -> bool {
        matches!(self, Dependency::Reactive(_))
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Atom(atom) => f.debug_tuple("Atom").field(&atom.name()).finish(),
            Dependency::Reactive(atom) => f.debug_tuple("Reactive").field(&atom.name()).finish(),
            Dependency::Lazy(atom) => f.debug_tuple("Lazy").field(&atom.name()).finish(),
            Dependency::Tag { label, .. } => f.debug_tuple("Tag").field(label).finish(),
        }
    }
}

pub(crate) struct AtomDef {
    id: AtomId,
    name: String,
    factory: ErasedFactory,
    dependencies: Vec<Dependency>,
    tags: TagStore,
}

/// Type-erased handle to an atom definition.
///
/// This is what scopes, extensions, and snapshots see. Cloning is cheap.
#[derive(Clone)]
pub struct AtomRef {
    def: Rc<AtomDef>,
}

impl AtomRef {
    pub fn id(&self) -> AtomId {
        self.def.id
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.def.dependencies
    }

    /// Metadata tags attached at definition time.
    pub fn tags(&self) -> &TagStore {
        &self.def.tags
    }

    pub(crate) fn factory(&self) -> &ErasedFactory {
        &self.def.factory
    }
}

impl PartialEq for AtomRef {
    fn eq(&self, other: &Self) -> bool {
        self.def.id == other.def.id
    }
}

impl Eq for AtomRef {}

impl fmt::Debug for AtomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomRef")
            .field("id", &self.def.id)
            .field("name", &self.def.name)
            .field("dependencies", &self.def.dependencies)
            .finish()
    }
}

/// A typed atom definition producing values of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let config = Atom::new("config", |_| async { Ok(Config::default()) });
///
/// let pool = Atom::builder("pool")
///     .dep(&config)
///     .build({
///         let config = config.clone();
///         move |ctx| {
///             let config = ctx.dep(&config);
///             async move { Ok(Pool::connect(&config?)?) }
///         }
///     });
/// ```
pub struct Atom<T> {
    inner: AtomRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Atom<T>
where
    T: Clone + 'static,
{
    /// Define an atom with no dependencies.
    pub fn new<F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(AtomContext) -> Fut + 'static,
        Fut: Future<Output = Result<T, BoxError>> + 'static,
    {
        AtomBuilder::new(name).build(factory)
    }
}

impl Atom<()> {
    /// Start a definition with dependencies or tags. The value type is
    /// fixed by the factory passed to [`AtomBuilder::build`].
    pub fn builder(name: impl Into<String>) -> AtomBuilder {
        AtomBuilder::new(name)
    }
}

impl<T> Atom<T> {
    pub fn id(&self) -> AtomId {
        self.inner.id()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn tags(&self) -> &TagStore {
        self.inner.tags()
    }

    /// The type-erased definition.
    pub fn erased(&self) -> &AtomRef {
        &self.inner
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.inner.def.id)
            .field("name", &self.inner.def.name)
            .finish()
    }
}

/// Builder for atom definitions.
pub struct AtomBuilder {
    name: String,
    dependencies: Vec<Dependency>,
    tags: TagStore,
}

impl AtomBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            tags: TagStore::new(),
        }
    }

    /// Resolve `atom` before the factory runs.
    pub fn dep<U>(mut self, atom: &Atom<U>) -> Self {
        self.dependencies.push(Dependency::Atom(atom.inner.clone()));
        self
    }

    /// Resolve `atom` before the factory runs and re-resolve this atom
    /// whenever `atom` changes.
    pub fn reactive<U>(mut self, atom: &Atom<U>) -> Self {
        self.dependencies
            .push(Dependency::Reactive(atom.inner.clone()));
        self
    }

    /// Declare `atom` without resolving it up front.
    pub fn lazy<U>(mut self, atom: &Atom<U>) -> Self {
        self.dependencies.push(Dependency::Lazy(atom.inner.clone()));
        self
    }

    /// Fail resolution unless the scope provides `tag` or it has a default.
    pub fn require_tag<U: Clone + 'static>(mut self, tag: &Tag<U>) -> Self {
        self.dependencies.push(Dependency::Tag {
            key: tag.key(),
            label: tag.label(),
            has_default: tag.has_default(),
        });
        self
    }

    /// Attach a metadata tag to the definition.
    pub fn tag<U: Clone + 'static>(mut self, tag: &Tag<U>, value: U) -> Self {
        self.tags.set(tag, value);
        self
    }

    /// Finish the definition with its factory.
    pub fn build<T, F, Fut>(self, factory: F) -> Atom<T>
    where
        T: Clone + 'static,
        F: Fn(AtomContext) -> Fut + 'static,
        Fut: Future<Output = Result<T, BoxError>> + 'static,
    {
        let factory: ErasedFactory = Rc::new(move |ctx: AtomContext| {
            factory(ctx)
                .map(|result| result.map(|value| Rc::new(value) as AnyValue))
                .boxed_local()
        });

        Atom {
            inner: AtomRef {
                def: Rc::new(AtomDef {
                    id: AtomId::new(),
                    name: self.name,
                    factory,
                    dependencies: self.dependencies,
                    tags: self.tags,
                }),
            },
            _marker: PhantomData,
        }
    }
}
