//! Reactive Surface
//!
//! Read-side handles over scope state.
//!
//! # Controllers
//!
//! A [`Controller`] is a stateless `(scope, atom)` pair. Any number of
//! controllers for the same pair observe the same executor state. Through a
//! controller you can read the current value synchronously, resolve,
//! invalidate, replace the value with `set`/`update`, and subscribe to
//! status transitions.
//!
//! # Selections
//!
//! A [`SelectHandle`] derives a smaller value from an atom and only notifies
//! its subscribers when the derived value actually changes according to an
//! equality function. The upstream subscription is reference counted: it is
//! attached for the first subscriber and dropped with the last one.
//!
//! # Subscriptions
//!
//! Every listener registration returns a [`Subscription`]. Dropping it, or
//! calling [`Subscription::unsubscribe`], removes the listener.

mod controller;
mod select;
mod subscription;

pub use controller::{Controller, ControllerEvent};
pub use select::SelectHandle;
pub use subscription::Subscription;
