//! Identifier types.
//!
//! Atoms, execution contexts, and listeners each get a unique ID when they
//! are created. IDs are only compared and hashed; they carry no ordering
//! meaning beyond "created earlier".

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Generate a new unique ID.
            ///
            /// Uses an atomic counter so IDs stay unique across threads, even
            /// though the runtime itself is single-threaded.
            pub fn new() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(0);
                Self(COUNTER.fetch_add(1, Ordering::Relaxed))
            }

            /// Get the raw ID value.
            pub fn raw(&self) -> u64 {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Unique identifier for an atom definition.
    ///
    /// Executor state inside a scope is keyed by this ID, so the same atom
    /// can be resolved independently by any number of scopes.
    AtomId,
    "atom"
);

define_id!(
    /// Unique identifier for an execution context.
    ContextId,
    "ctx"
);

define_id!(
    /// Unique identifier for a registered listener.
    ListenerId,
    "listener"
);
