//! Field-level comparison of two states.

use lineage_types::{FieldKey, State, StateValue};
use serde::{Deserialize, Serialize};

/// A single field change between two states.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum FieldChange {
    Added {
        field: FieldKey,
        value: StateValue,
    },
    Removed {
        field: FieldKey,
        value: StateValue,
    },
    Modified {
        field: FieldKey,
        old: StateValue,
        new: StateValue,
    },
}

impl FieldChange {
    pub fn field(&self) -> &FieldKey {
        match self {
            Self::Added { field, .. } | Self::Removed { field, .. } | Self::Modified { field, .. } => {
                field
            }
        }
    }
}

/// The changes that turn one state into another, in key order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDiff {
    pub changes: Vec<FieldChange>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn additions(&self) -> usize {
        self.count(|c| matches!(c, FieldChange::Added { .. }))
    }

    pub fn removals(&self) -> usize {
        self.count(|c| matches!(c, FieldChange::Removed { .. }))
    }

    pub fn modifications(&self) -> usize {
        self.count(|c| matches!(c, FieldChange::Modified { .. }))
    }

    fn count(&self, pred: impl Fn(&FieldChange) -> bool) -> usize {
        self.changes.iter().filter(|c| pred(c)).count()
    }
}

/// Compute the field changes from `old` to `new`.
pub fn diff_states(old: &State, new: &State) -> StateDiff {
    let mut keys = old.keys();
    keys.extend(new.keys());

    let changes = keys
        .into_iter()
        .filter_map(|field| match (old.get(&field), new.get(&field)) {
            (Some(a), Some(b)) if a != b => Some(FieldChange::Modified {
                old: a.clone(),
                new: b.clone(),
                field,
            }),
            (Some(a), None) => Some(FieldChange::Removed {
                value: a.clone(),
                field,
            }),
            (None, Some(b)) => Some(FieldChange::Added {
                value: b.clone(),
                field,
            }),
            _ => None,
        })
        .collect();

    StateDiff { changes }
}
