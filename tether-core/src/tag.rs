//! Tags
//!
//! A [`Tag`] is a typed key. Tags are used in three places:
//!
//! - ambient configuration handed to a scope at creation time,
//! - metadata attached to atom and flow definitions,
//! - request-scoped data stored on an execution context.
//!
//! Values live in a [`TagStore`], a small type-erased map keyed by
//! [`TagKey`]. Reads go through the typed [`Tag`], so a value can only be
//! read back as the type it was written with.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use crate::error::{Error, Result};

/// Untyped identity of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagKey(u64);

impl TagKey {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A typed key with a human-readable label and an optional default.
pub struct Tag<T> {
    key: TagKey,
    label: &'static str,
    default: Option<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Tag<T>
where
    T: Clone + 'static,
{
    /// Create a tag with no default value.
    pub fn new(label: &'static str) -> Self {
        Self {
            key: TagKey::new(),
            label,
            default: None,
            _marker: PhantomData,
        }
    }

    /// Create a tag that falls back to `default` when no value is stored.
    pub fn with_default(label: &'static str, default: T) -> Self {
        Self {
            key: TagKey::new(),
            label,
            default: Some(default),
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> TagKey {
        self.key
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn default_value(&self) -> Option<&T> {
        self.default.as_ref()
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

impl<T: Clone> Clone for Tag<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            label: self.label,
            default: self.default.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Tag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("label", &self.label)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

#[derive(Clone)]
struct TagEntry {
    label: &'static str,
    value: Rc<dyn Any>,
}

/// Type-erased storage for tagged values.
///
/// Insertion order is preserved so labels can be listed deterministically.
#[derive(Clone, Default)]
pub struct TagStore {
    entries: IndexMap<TagKey, TagEntry>,
}

impl TagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous value for the same tag.
    pub fn set<T: Clone + 'static>(&mut self, tag: &Tag<T>, value: T) {
        self.entries.insert(
            tag.key,
            TagEntry {
                label: tag.label,
                value: Rc::new(value),
            },
        );
    }

    /// Read the stored value, falling back to the tag's default.
    pub fn get<T: Clone + 'static>(&self, tag: &Tag<T>) -> Option<T> {
        self.entries
            .get(&tag.key)
            .and_then(|entry| entry.value.downcast_ref::<T>().cloned())
            .or_else(|| tag.default.clone())
    }

    /// Read the value, failing with [`Error::TagNotFound`] when neither a
    /// value nor a default exists.
    pub fn require<T: Clone + 'static>(&self, tag: &Tag<T>) -> Result<T> {
        self.get(tag).ok_or_else(|| Error::TagNotFound {
            label: tag.label.to_string(),
        })
    }

    /// Whether a value was explicitly stored. Defaults do not count.
    pub fn contains<T>(&self, tag: &Tag<T>) -> bool {
        self.entries.contains_key(&tag.key)
    }

    pub(crate) fn contains_key(&self, key: TagKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Remove and return the stored value.
    pub fn remove<T: Clone + 'static>(&mut self, tag: &Tag<T>) -> Option<T> {
        self.entries
            .shift_remove(&tag.key)
            .and_then(|entry| entry.value.downcast_ref::<T>().cloned())
    }

    /// Labels of every stored entry, in insertion order.
    pub fn labels(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.values().map(|entry| entry.label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for TagStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.labels()).finish()
    }
}
