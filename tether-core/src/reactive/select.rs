//! Select
//!
//! Fine-grained derived subscriptions. A selection applies a selector to an
//! atom's value and caches the result. Subscribers are notified only when a
//! later resolution produces a derived value the equality function reports
//! as different.
//!
//! # Upstream lifetime
//!
//! The handle does not listen to the atom until it has a subscriber. The
//! first `subscribe` attaches a listener to the controller (refreshing the
//! cached derived value silently), and dropping the last subscription
//! detaches it again.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::scope::AtomStatus;

use super::{Controller, ControllerEvent, Subscription};

type Listen = Box<dyn Fn(Rc<dyn Fn()>) -> Result<Subscription>>;

struct SelectInner<S> {
    /// Derive from the atom's current value, `None` if it has none.
    compute: Box<dyn Fn() -> Option<S>>,
    eq: Box<dyn Fn(&S, &S) -> bool>,
    current: RefCell<S>,
    subscribers: RefCell<IndexMap<u64, Rc<dyn Fn(&S)>>>,
    next_subscriber: Cell<u64>,
    upstream: RefCell<Option<Subscription>>,
    listen: Listen,
}

impl<S: Clone + 'static> SelectInner<S> {
    fn refresh_silently(&self) {
        if let Some(next) = (self.compute)() {
            *self.current.borrow_mut() = next;
        }
    }

    fn on_upstream_change(&self) {
        let Some(next) = (self.compute)() else {
            return;
        };
        let unchanged = {
            let current = self.current.borrow();
            (self.eq)(&*current, &next)
        };
        if unchanged {
            return;
        }

        *self.current.borrow_mut() = next.clone();
        let subscribers: Vec<Rc<dyn Fn(&S)>> =
            self.subscribers.borrow().values().cloned().collect();
        for subscriber in subscribers {
            subscriber(&next);
        }
    }

    fn remove(&self, id: u64) {
        let emptied = {
            let mut subscribers = self.subscribers.borrow_mut();
            subscribers.shift_remove(&id).is_some() && subscribers.is_empty()
        };
        if emptied {
            let upstream = self.upstream.borrow_mut().take();
            drop(upstream);
        }
    }
}

/// A derived, equality-filtered view of one atom.
///
/// Cloning shares the cached value and subscriber set. Separate
/// `select` calls produce independent handles.
pub struct SelectHandle<S> {
    inner: Rc<SelectInner<S>>,
}

impl<S> SelectHandle<S>
where
    S: Clone + 'static,
{
    pub(crate) fn new<T, F, E>(controller: Controller<T>, selector: F, eq: E) -> Result<Self>
    where
        T: Clone + 'static,
        F: Fn(&T) -> S + 'static,
        E: Fn(&S, &S) -> bool + 'static,
    {
        if controller.state() != AtomStatus::Resolved {
            return Err(Error::NotResolved {
                atom: controller.atom().name().to_string(),
            });
        }
        let initial = selector(&controller.get()?);

        let reader = controller.clone();
        let compute = Box::new(move || reader.get().ok().map(|value| selector(&value)));
        let listen: Listen =
            Box::new(move |callback| controller.on(ControllerEvent::Resolved, move || callback()));

        Ok(Self {
            inner: Rc::new(SelectInner {
                compute,
                eq: Box::new(eq),
                current: RefCell::new(initial),
                subscribers: RefCell::new(IndexMap::new()),
                next_subscriber: Cell::new(0),
                upstream: RefCell::new(None),
                listen,
            }),
        })
    }

    /// The most recent derived value.
    pub fn get(&self) -> S {
        self.inner.current.borrow().clone()
    }

    /// Listen for changes of the derived value.
    ///
    /// The listener is not called on registration, only when a later
    /// resolution produces a different derived value.
    pub fn subscribe<F>(&self, listener: F) -> Result<Subscription>
    where
        F: Fn(&S) + 'static,
    {
        if self.inner.upstream.borrow().is_none() {
            self.inner.refresh_silently();
            let weak: Weak<SelectInner<S>> = Rc::downgrade(&self.inner);
            let upstream = (self.inner.listen)(Rc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_upstream_change();
                }
            }))?;
            *self.inner.upstream.borrow_mut() = Some(upstream);
        }

        let id = self.inner.next_subscriber.get();
        self.inner.next_subscriber.set(id + 1);
        self.inner
            .subscribers
            .borrow_mut()
            .insert(id, Rc::new(listener));

        let weak = Rc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(id);
            }
        }))
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }

    /// Whether the handle currently listens to the atom.
    pub fn is_attached(&self) -> bool {
        self.inner.upstream.borrow().is_some()
    }
}

impl<S> Clone for SelectHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for SelectHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectHandle")
            .field("current", &*self.inner.current.borrow())
            .field("subscribers", &self.inner.subscribers.borrow().len())
            .finish()
    }
}
