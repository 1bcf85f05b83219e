use std::fmt;

use serde::{Deserialize, Serialize};

/// Key namespaces of the lineage store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Namespace {
    /// Line records, keyed by line id.
    Lines,
    /// Parent → child index, keyed `{parent}/{child}`.
    Children,
    /// Snapshots, keyed `{line}/{seq:020}`.
    Snapshots,
    /// Atomic `u64` counters.
    Counters,
    /// Merge records, keyed `{target}/{merge_id}`.
    Merges,
    /// Idempotency records for fork and merge retries.
    Idempotency,
}

impl Namespace {
    pub const ALL: [Namespace; 6] = [
        Self::Lines,
        Self::Children,
        Self::Snapshots,
        Self::Counters,
        Self::Merges,
        Self::Idempotency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lines => "lines",
            Self::Children => "children",
            Self::Snapshots => "snapshots",
            Self::Counters => "counters",
            Self::Merges => "merges",
            Self::Idempotency => "idempotency",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
