//! Scope Configuration
//!
//! A [`ScopeConfig`] is built once and consumed when the scope is created.
//! It carries everything a scope needs up front: presets, extensions, and
//! ambient tags. There is no global configuration store.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::atom::{AnyValue, Atom, AtomRef};
use crate::extension::Extension;
use crate::id::AtomId;
use crate::tag::{Tag, TagStore};

/// What a preset substitutes for an atom.
#[derive(Clone)]
pub(crate) enum PresetTarget {
    /// Resolve to this value without running any factory.
    Value(AnyValue),
    /// Resolve with another definition's dependencies and factory.
    Atom(AtomRef),
}

/// Substitutes an atom's factory within one scope.
///
/// Presets are how tests isolate a unit: swap a database atom for an
/// in-memory value, or a client atom for a stub definition.
///
/// ```rust,ignore
/// let scope = create_scope(
///     ScopeConfig::new()
///         .preset(Preset::value(&config, Config::testing()))
///         .preset(Preset::atom(&client, &stub_client)),
/// );
/// ```
#[derive(Clone)]
pub struct Preset {
    target: AtomId,
    substitute: PresetTarget,
}

impl Preset {
    /// Resolve `atom` to `value`.
    pub fn value<T: Clone + 'static>(atom: &Atom<T>, value: T) -> Self {
        Self {
            target: atom.id(),
            substitute: PresetTarget::Value(Rc::new(value)),
        }
    }

    /// Resolve `atom` using `replacement`'s definition.
    pub fn atom<T: Clone + 'static>(atom: &Atom<T>, replacement: &Atom<T>) -> Self {
        Self {
            target: atom.id(),
            substitute: PresetTarget::Atom(replacement.erased().clone()),
        }
    }

    pub fn target(&self) -> AtomId {
        self.target
    }
}

impl fmt::Debug for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.substitute {
            PresetTarget::Value(_) => "value",
            PresetTarget::Atom(_) => "atom",
        };
        f.debug_struct("Preset")
            .field("target", &self.target)
            .field("kind", &kind)
            .finish()
    }
}

/// Everything a scope is created with.
#[derive(Default)]
pub struct ScopeConfig {
    pub(crate) name: Option<String>,
    pub(crate) presets: Vec<Preset>,
    pub(crate) extensions: Vec<Rc<dyn Extension>>,
    pub(crate) tags: TagStore,
}

impl ScopeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used in log events.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a preset. A later preset for the same atom wins.
    pub fn preset(mut self, preset: Preset) -> Self {
        self.presets.push(preset);
        self
    }

    /// Register an extension. Extensions wrap in registration order: the
    /// first one registered is the outermost.
    pub fn extension<E: Extension + 'static>(mut self, extension: E) -> Self {
        self.extensions.push(Rc::new(extension));
        self
    }

    /// Register an already shared extension.
    pub fn shared_extension(mut self, extension: Rc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Provide an ambient tag value.
    pub fn tag<T: Clone + 'static>(mut self, tag: &Tag<T>, value: T) -> Self {
        self.tags.set(tag, value);
        self
    }

    pub(crate) fn preset_map(&self) -> HashMap<AtomId, PresetTarget> {
        self.presets
            .iter()
            .map(|preset| (preset.target, preset.substitute.clone()))
            .collect()
    }
}

impl fmt::Debug for ScopeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeConfig")
            .field("name", &self.name)
            .field("presets", &self.presets)
            .field(
                "extensions",
                &self.extensions.iter().map(|ext| ext.name()).collect::<Vec<_>>(),
            )
            .field("tags", &self.tags)
            .finish()
    }
}
