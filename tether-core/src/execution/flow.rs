//! Flow definitions.

use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures_util::future::{FutureExt, LocalBoxFuture};

use crate::atom::{Atom, AtomRef};
use crate::error::BoxError;
use crate::tag::{Tag, TagStore};

use super::ExecutionContext;

type FlowBody<I, O> = Rc<dyn Fn(ExecutionContext, I) -> LocalBoxFuture<'static, Result<O, BoxError>>>;

struct FlowDef<I, O> {
    name: String,
    dependencies: Vec<AtomRef>,
    tags: TagStore,
    body: FlowBody<I, O>,
}

/// A short-lived computation taking `I` and producing `O`.
///
/// Declared atoms are resolved concurrently before the body runs; the body
/// reads them through [`ExecutionContext::dep`].
///
/// ```rust,ignore
/// let checkout = Flow::builder("checkout")
///     .dep(&payments)
///     .build({
///         let payments = payments.clone();
///         move |ctx, order: Order| {
///             let payments = payments.clone();
///             async move {
///                 let client = ctx.dep(&payments)?;
///                 Ok(client.charge(order).await?)
///             }
///         }
///     });
/// ```
pub struct Flow<I, O> {
    def: Rc<FlowDef<I, O>>,
}

impl<I, O> Flow<I, O>
where
    I: 'static,
    O: 'static,
{
    /// Define a flow with no declared dependencies.
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(ExecutionContext, I) -> Fut + 'static,
        Fut: Future<Output = Result<O, BoxError>> + 'static,
    {
        FlowBuilder::new(name).build(body)
    }
}

impl Flow<(), ()> {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(name)
    }
}

impl<I, O> Flow<I, O> {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn dependencies(&self) -> &[AtomRef] {
        &self.def.dependencies
    }

    pub fn tags(&self) -> &TagStore {
        &self.def.tags
    }

    pub(crate) fn invoke(
        &self,
        ctx: ExecutionContext,
        input: I,
    ) -> LocalBoxFuture<'static, Result<O, BoxError>> {
        (self.def.body)(ctx, input)
    }
}

impl<I, O> Clone for Flow<I, O> {
    fn clone(&self) -> Self {
        Self {
            def: Rc::clone(&self.def),
        }
    }
}

impl<I, O> fmt::Debug for Flow<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.def.name)
            .field(
                "dependencies",
                &self
                    .def
                    .dependencies
                    .iter()
                    .map(AtomRef::name)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder for flow definitions.
pub struct FlowBuilder {
    name: String,
    dependencies: Vec<AtomRef>,
    tags: TagStore,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            tags: TagStore::new(),
        }
    }

    /// Resolve `atom` before the body runs.
    pub fn dep<U>(mut self, atom: &Atom<U>) -> Self
    where
        U: Clone + 'static,
    {
        self.dependencies.push(atom.erased().clone());
        self
    }

    /// Attach a metadata tag, visible to extensions through
    /// [`ExecTarget::Flow`](crate::ExecTarget::Flow).
    pub fn tag<U: Clone + 'static>(mut self, tag: &Tag<U>, value: U) -> Self {
        self.tags.set(tag, value);
        self
    }

    pub fn build<I, O, F, Fut>(self, body: F) -> Flow<I, O>
    where
        I: 'static,
        O: 'static,
        F: Fn(ExecutionContext, I) -> Fut + 'static,
        Fut: Future<Output = Result<O, BoxError>> + 'static,
    {
        let body: FlowBody<I, O> =
            Rc::new(move |ctx: ExecutionContext, input: I| body(ctx, input).boxed_local());
        Flow {
            def: Rc::new(FlowDef {
                name: self.name,
                dependencies: self.dependencies,
                tags: self.tags,
                body,
            }),
        }
    }
}

