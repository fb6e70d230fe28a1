//! Serializable views of scope state, for tooling that inspects a running
//! scope without touching it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::state::{AtomStatus, ExecutorState};
use crate::id::AtomId;

/// Point-in-time view of one atom inside a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomSnapshot {
    pub name: String,
    pub status: AtomStatus,
    /// Names of atoms that re-resolve when this one changes.
    pub dependents: Vec<String>,
    pub cleanups: usize,
    pub listeners: usize,
}

/// Point-in-time view of a whole scope, atoms in first-touch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    pub scope: String,
    pub atoms: Vec<AtomSnapshot>,
}

impl ScopeSnapshot {
    pub(crate) fn capture(scope: &str, states: &IndexMap<AtomId, ExecutorState>) -> Self {
        let atoms = states
            .values()
            .map(|state| AtomSnapshot {
                name: state.atom.name().to_string(),
                status: state.status,
                dependents: state
                    .dependents
                    .iter()
                    .filter_map(|id| states.get(id))
                    .map(|dependent| dependent.atom.name().to_string())
                    .collect(),
                cleanups: state.cleanups.len(),
                listeners: state.listeners.len(),
            })
            .collect();

        Self {
            scope: scope.to_string(),
            atoms,
        }
    }

    /// Look up an atom by name.
    pub fn atom(&self, name: &str) -> Option<&AtomSnapshot> {
        self.atoms.iter().find(|atom| atom.name == name)
    }
}
