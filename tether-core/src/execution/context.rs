//! Execution Context
//!
//! The hierarchical lifecycle boundary flows run in. See the module docs of
//! [`crate::execution`] for the state machine.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures_util::future::{join_all, try_join_all, FutureExt, LocalBoxFuture, Shared};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{CloseMode, ContextStatus, Flow, Settled};
use crate::atom::{Atom, AtomRef};
use crate::error::{BoxError, Error, Result};
use crate::extension::{ExecFuture, ExecTarget};
use crate::id::{ContextId, ListenerId};
use crate::reactive::Subscription;
use crate::scope::state::{run_cleanup, CleanupFn};
use crate::scope::Scope;
use crate::tag::{Tag, TagStore};

type ExecBody<O> = Box<dyn FnOnce(ExecutionContext) -> LocalBoxFuture<'static, Result<O, BoxError>>>;
type StateListener = Rc<dyn Fn(ContextStatus, ContextStatus)>;

struct ContextInner {
    id: ContextId,
    name: String,
    scope: Scope,
    parent: Option<ExecutionContext>,
    data: RefCell<TagStore>,
    status: Cell<ContextStatus>,
    cancel: CancellationToken,
    in_flight: Cell<usize>,
    idle: Notify,
    children: RefCell<Vec<Weak<ContextInner>>>,
    cleanups: RefCell<Vec<CleanupFn>>,
    error: RefCell<Option<Error>>,
    close: RefCell<Option<CloseHandle>>,
    listeners: RefCell<Vec<(ListenerId, StateListener)>>,
}

/// A node in the execution tree.
///
/// Cloning is cheap; clones refer to the same context.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Rc<ContextInner>,
}

/// Counts one execution as in flight for as long as it lives.
struct InFlight<'a> {
    inner: &'a ContextInner,
}

impl<'a> InFlight<'a> {
    fn enter(inner: &'a ContextInner) -> Self {
        inner.in_flight.set(inner.in_flight.get() + 1);
        Self { inner }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let remaining = self.inner.in_flight.get().saturating_sub(1);
        self.inner.in_flight.set(remaining);
        if remaining == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl ExecutionContext {
    pub(crate) fn root(scope: Scope) -> Self {
        Self::build("root".to_string(), scope, None, CancellationToken::new())
    }

    fn build(
        name: String,
        scope: Scope,
        parent: Option<ExecutionContext>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                id: ContextId::new(),
                name,
                scope,
                parent,
                data: RefCell::new(TagStore::new()),
                status: Cell::new(ContextStatus::Active),
                cancel,
                in_flight: Cell::new(0),
                idle: Notify::new(),
                children: RefCell::new(Vec::new()),
                cleanups: RefCell::new(Vec::new()),
                error: RefCell::new(None),
                close: RefCell::new(None),
                listeners: RefCell::new(Vec::new()),
            }),
        }
    }

    fn child(&self, name: &str) -> ExecutionContext {
        let child = Self::build(
            name.to_string(),
            self.inner.scope.clone(),
            Some(self.clone()),
            self.inner.cancel.child_token(),
        );
        let mut children = self.inner.children.borrow_mut();
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Rc::downgrade(&child.inner));
        child
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    pub fn parent(&self) -> Option<&ExecutionContext> {
        self.inner.parent.as_ref()
    }

    pub fn status(&self) -> ContextStatus {
        self.inner.status.get()
    }

    /// The first error recorded by an execution in this context.
    pub fn error(&self) -> Option<Error> {
        self.inner.error.borrow().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Token for cooperative cancellation checks inside long bodies.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.inner.status.get() {
            ContextStatus::Active => Ok(()),
            status => Err(Error::ExecutionContextClosed {
                context: self.inner.name.clone(),
                status,
            }),
        }
    }

    fn record_error(&self, err: Error) {
        let mut slot = self.inner.error.borrow_mut();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Run a flow in a fresh child context.
    ///
    /// The flow's declared atoms are resolved concurrently first. The child
    /// is closed gracefully, running its cleanups, before this returns.
    pub async fn exec<I, O>(&self, flow: &Flow<I, O>, input: I) -> Result<O>
    where
        I: 'static,
        O: 'static,
    {
        let target = ExecTarget::Flow {
            name: flow.name().to_string(),
            tags: flow.tags().clone(),
        };
        let dependencies = flow.dependencies().to_vec();
        let flow = flow.clone();
        self.execute(
            target,
            dependencies,
            Box::new(move |ctx| flow.invoke(ctx, input)),
        )
        .await
    }

    /// Run an ad-hoc closure with the same lifecycle as [`exec`](Self::exec).
    pub async fn run<F, Fut, O>(&self, name: impl Into<String>, body: F) -> Result<O>
    where
        F: FnOnce(ExecutionContext) -> Fut + 'static,
        Fut: Future<Output = Result<O, BoxError>> + 'static,
        O: 'static,
    {
        let target = ExecTarget::Function { name: name.into() };
        self.execute(
            target,
            Vec::new(),
            Box::new(move |ctx| body(ctx).boxed_local()),
        )
        .await
    }

    async fn execute<O: 'static>(
        &self,
        target: ExecTarget,
        dependencies: Vec<AtomRef>,
        body: ExecBody<O>,
    ) -> Result<O> {
        self.ensure_active()?;
        let _in_flight = InFlight::enter(&self.inner);
        let child = self.child(target.name());
        tracing::debug!(context = %self.inner.name, target = target.name(), "executing");

        let scope = self.inner.scope.clone();
        let name = target.name().to_string();
        let body_ctx = child.clone();
        let next: ExecFuture = async move {
            scope.drain_unstarted().await;
            let resolved = join_all(dependencies.iter().map(|dep| scope.resolve_in(dep, &[]))).await;
            for result in resolved {
                result?;
            }
            let value = body(body_ctx)
                .await
                .map_err(|err| Error::flow(&name, err))?;
            Ok(Box::new(value) as Box<dyn Any>)
        }
        .boxed_local();

        let wrapped = self.inner.scope.wrap_exec(next, &target, &child);
        let cancelled = child.inner.cancel.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancelled.cancelled() => Err(Error::ExecutionAborted {
                context: child.inner.name.clone(),
            }),
            result = wrapped => result,
        };

        if let Err(err) = &outcome {
            tracing::debug!(context = %child.inner.name, error = %err, "execution failed");
            child.record_error(err.clone());
        }
        child.close().await;

        outcome?
            .downcast::<O>()
            .map(|value| *value)
            .map_err(|_| Error::TypeMismatch {
                atom: target.name().to_string(),
            })
    }

    /// Await every future, failing fast on the first error.
    pub async fn parallel<T, Fut, It>(&self, futures: It) -> Result<Vec<T>>
    where
        It: IntoIterator<Item = Fut>,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_active()?;
        let _in_flight = InFlight::enter(&self.inner);
        try_join_all(futures).await
    }

    /// Await every future and collect all outcomes.
    pub async fn parallel_settled<T, Fut, It>(&self, futures: It) -> Result<Settled<T>>
    where
        It: IntoIterator<Item = Fut>,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_active()?;
        let _in_flight = InFlight::enter(&self.inner);
        Ok(Settled {
            results: join_all(futures).await,
        })
    }

    /// Value of an atom resolved in this context's scope.
    pub fn dep<T: Clone + 'static>(&self, atom: &Atom<T>) -> Result<T> {
        self.inner
            .scope
            .get(atom)?
            .ok_or_else(|| Error::NotResolved {
                atom: atom.name().to_string(),
            })
    }

    pub async fn resolve<T: Clone + 'static>(&self, atom: &Atom<T>) -> Result<T> {
        self.inner.scope.resolve(atom).await
    }

    // ------------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------------

    /// Close gracefully.
    pub fn close(&self) -> CloseHandle {
        self.close_with(CloseMode::Graceful)
    }

    /// Close with the given mode.
    ///
    /// Every call returns the same handle. An abort request still cancels
    /// in-flight work even when a graceful close is already under way.
    ///
    /// The close starts immediately and finishes in place when nothing is
    /// in flight. Otherwise it completes while the handle is awaited.
    pub fn close_with(&self, mode: CloseMode) -> CloseHandle {
        if mode == CloseMode::Abort {
            self.inner.cancel.cancel();
        }
        if let Some(handle) = self.inner.close.borrow().as_ref() {
            return handle.clone();
        }

        let weak = Rc::downgrade(&self.inner);
        let handle = CloseHandle {
            future: async move {
                if let Some(inner) = weak.upgrade() {
                    ExecutionContext { inner }.finish_close(mode).await;
                }
            }
            .boxed_local()
            .shared(),
        };
        *self.inner.close.borrow_mut() = Some(handle.clone());
        self.transition(ContextStatus::Closing);

        // An idle context with synchronous cleanups closes right here, so a
        // dropped handle does not leave it stuck in `closing`.
        let _ = handle.future.clone().now_or_never();
        handle
    }

    async fn finish_close(&self, mode: CloseMode) {
        tracing::debug!(context = %self.inner.name, ?mode, "closing context");
        match mode {
            CloseMode::Abort => {
                self.close_children(mode).await;
                self.wait_idle().await;
            }
            CloseMode::Graceful => {
                self.wait_idle().await;
                self.close_children(mode).await;
            }
        }

        let cleanups = std::mem::take(&mut *self.inner.cleanups.borrow_mut());
        for cleanup in cleanups.into_iter().rev() {
            run_cleanup(&self.inner.name, cleanup).await;
        }
        self.transition(ContextStatus::Closed);
        tracing::debug!(context = %self.inner.name, "context closed");
    }

    async fn close_children(&self, mode: CloseMode) {
        let children: Vec<ExecutionContext> = self
            .inner
            .children
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| ExecutionContext { inner })
            .collect();
        for child in children {
            child.close_with(mode).await;
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.in_flight.get() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Register a cleanup run when this context closes. Cleanups run newest
    /// first; failures are logged.
    pub fn on_close<F>(&self, cleanup: F)
    where
        F: FnOnce() + 'static,
    {
        self.on_close_async(move || async move {
            cleanup();
            Ok(())
        });
    }

    pub fn on_close_async<F, Fut>(&self, cleanup: F)
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + 'static,
    {
        self.inner
            .cleanups
            .borrow_mut()
            .push(Box::new(move || cleanup().boxed_local()));
    }

    /// Observe status transitions as `(from, to)`.
    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ContextStatus, ContextStatus) + 'static,
    {
        let id = ListenerId::new();
        self.inner
            .listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));

        let weak = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.borrow_mut().retain(|(entry, _)| *entry != id);
            }
        })
    }

    fn transition(&self, to: ContextStatus) {
        let from = self.inner.status.replace(to);
        if from == to {
            return;
        }
        tracing::trace!(context = %self.inner.name, %from, %to, "context status changed");
        let listeners: Vec<StateListener> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in listeners {
            listener(from, to);
        }
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    /// Store a value on this context only.
    pub fn set<T: Clone + 'static>(&self, tag: &Tag<T>, value: T) {
        self.inner.data.borrow_mut().set(tag, value);
    }

    /// Read a value from this context only, falling back to the tag default.
    pub fn get<T: Clone + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        self.inner.data.borrow().get(tag)
    }

    pub fn contains<T>(&self, tag: &Tag<T>) -> bool {
        self.inner.data.borrow().contains(tag)
    }

    pub fn remove<T: Clone + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        self.inner.data.borrow_mut().remove(tag)
    }

    /// Look the value up here, then in each ancestor, then fall back to the
    /// tag default.
    pub fn seek<T: Clone + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        let mut current = Some(self);
        while let Some(ctx) = current {
            let data = ctx.inner.data.borrow();
            if data.contains(tag) {
                return data.get(tag);
            }
            current = ctx.parent();
        }
        tag.default_value().cloned()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.inner.status.get())
            .field("in_flight", &self.inner.in_flight.get())
            .finish()
    }
}

/// Completes once the context is closed. Cloned for every `close` call.
#[must_use = "a close waiting on in-flight work only progresses while the handle is awaited"]
#[derive(Clone)]
pub struct CloseHandle {
    future: Shared<LocalBoxFuture<'static, ()>>,
}

impl CloseHandle {
    /// Whether the close has fully completed.
    pub fn is_settled(&self) -> bool {
        self.future.peek().is_some()
    }
}

impl Future for CloseHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.future).poll(cx)
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle")
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn run_local<F: Future>(future: F) -> F::Output {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        tokio::task::LocalSet::new().block_on(&runtime, future)
    }

    #[test]
    fn run_returns_the_body_value() {
        run_local(async {
            let ctx = Scope::new().create_context().unwrap();
            let value = ctx.run("sum", |_| async { Ok(2 + 2) }).await.unwrap();
            assert_eq!(value, 4);
            assert_eq!(ctx.status(), ContextStatus::Active);
        });
    }

    #[test]
    fn child_cleanups_run_before_exec_returns() {
        run_local(async {
            let ctx = Scope::new().create_context().unwrap();
            let log = Rc::new(RefCell::new(Vec::new()));

            let inner_log = Rc::clone(&log);
            ctx.run("work", move |child| async move {
                let first = Rc::clone(&inner_log);
                child.on_close(move || first.borrow_mut().push("first"));
                let second = Rc::clone(&inner_log);
                child.on_close(move || second.borrow_mut().push("second"));
                Ok(())
            })
            .await
            .unwrap();

            assert_eq!(*log.borrow(), vec!["second", "first"]);
        });
    }

    #[test]
    fn closed_context_rejects_work() {
        run_local(async {
            let ctx = Scope::new().create_context().unwrap();
            ctx.close().await;

            let err = ctx.run("late", |_| async { Ok(()) }).await.unwrap_err();
            assert!(matches!(
                err,
                Error::ExecutionContextClosed {
                    status: ContextStatus::Closed,
                    ..
                }
            ));
        });
    }

    #[test]
    fn seek_walks_ancestors() {
        run_local(async {
            let request_id = Tag::<u32>::new("request-id");
            let ctx = Scope::new().create_context().unwrap();
            ctx.set(&request_id, 7);

            let tag = request_id.clone();
            let (own, sought) = ctx
                .run("child", move |child| async move { Ok((child.get(&tag), child.seek(&tag))) })
                .await
                .unwrap();

            assert_eq!(own, None);
            assert_eq!(sought, Some(7));
        });
    }

    #[test]
    fn state_changes_are_reported() {
        run_local(async {
            let ctx = Scope::new().create_context().unwrap();
            let seen = Rc::new(RefCell::new(Vec::new()));
            let log = Rc::clone(&seen);
            let _subscription = ctx.on_state_change(move |from, to| log.borrow_mut().push((from, to)));

            ctx.close().await;

            assert_eq!(
                *seen.borrow(),
                vec![
                    (ContextStatus::Active, ContextStatus::Closing),
                    (ContextStatus::Closing, ContextStatus::Closed),
                ]
            );
        });
    }

    #[test]
    fn idle_context_closes_without_awaiting_the_handle() {
        run_local(async {
            let ctx = Scope::new().create_context().unwrap();
            let ran = Rc::new(Cell::new(false));
            let flag = Rc::clone(&ran);
            ctx.on_close(move || flag.set(true));

            let _ = ctx.close();

            assert_eq!(ctx.status(), ContextStatus::Closed);
            assert!(ran.get());
        });
    }

    #[test]
    fn graceful_close_waits_for_in_flight_work() {
        run_local(async {
            let ctx = Scope::new().create_context().unwrap();
            let done = Rc::new(Cell::new(false));

            let worker = {
                let ctx = ctx.clone();
                let done = Rc::clone(&done);
                tokio::task::spawn_local(async move {
                    ctx.run("slow", move |_| async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        done.set(true);
                        Ok(())
                    })
                    .await
                })
            };
            tokio::task::yield_now().await;

            ctx.close().await;
            assert!(done.get());
            assert!(worker.await.unwrap().is_ok());
        });
    }
}
