//! State-level merge algorithms.
//!
//! Every key in `base ∪ target ∪ source` is decided independently. A key
//! missing from a state compares as "absent", so a key added on only one
//! side merges cleanly and a key removed on only one side stays removed.

use lineage_types::{FieldKey, State, StateValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MergeError;
use crate::resolver::{resolve_checked, ConflictInput, ConflictResolver};

/// A field that changed on both sides, with the value the resolver chose.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub field: FieldKey,
    pub target_value: Option<StateValue>,
    pub source_value: Option<StateValue>,
    pub resolved_value: Option<StateValue>,
}

/// The merged state and the conflicts resolved along the way, in key order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub state: State,
    pub conflicts: Vec<Conflict>,
}

impl MergeOutcome {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// The source state replaces the target. Never records conflicts.
pub fn overwrite(source: &State) -> MergeOutcome {
    MergeOutcome {
        state: source.clone(),
        conflicts: Vec::new(),
    }
}

/// Three-way merge of `target` and `source` against their common ancestor.
///
/// For each key:
/// - equal on both sides: keep it
/// - only the source changed it: take the source value
/// - only the target changed it: take the target value
/// - both changed it differently: ask `resolver`
///
/// A resolver error or a non-deterministic answer aborts the whole merge;
/// nothing partial is returned.
pub fn three_way(
    base: &State,
    target: &State,
    source: &State,
    resolver: &dyn ConflictResolver,
) -> Result<MergeOutcome, MergeError> {
    let mut keys = base.keys();
    keys.extend(target.keys());
    keys.extend(source.keys());

    let mut merged = State {
        version: base.version.max(target.version).max(source.version),
        ..State::default()
    };
    let mut conflicts = Vec::new();

    for key in keys {
        let b = base.get(&key);
        let t = target.get(&key);
        let s = source.get(&key);

        let value = if t == s {
            t.cloned()
        } else if t == b {
            s.cloned()
        } else if s == b {
            t.cloned()
        } else {
            let input = ConflictInput {
                field: &key,
                base_value: b,
                target_value: t,
                source_value: s,
            };
            let resolved = resolve_checked(resolver, &input)?;
            debug!(field = %key, resolver = resolver.name(), "conflict resolved");
            conflicts.push(Conflict {
                field: key.clone(),
                target_value: t.cloned(),
                source_value: s.cloned(),
                resolved_value: resolved.clone(),
            });
            resolved
        };

        if let Some(value) = value {
            merged.set(key, value);
        }
    }

    Ok(MergeOutcome {
        state: merged,
        conflicts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolveError;
    use crate::resolver::{FnResolver, SourceWins, TargetWins};
    use proptest::prelude::*;

    fn st(pairs: &[(&str, i64)]) -> State {
        State::from_pairs(pairs.iter().map(|(k, v)| (*k, *v)))
    }

    #[test]
    fn non_overlapping_changes_merge_cleanly() {
        let base = st(&[("x", 1), ("y", 2)]);
        let target = st(&[("x", 3), ("y", 2)]);
        let source = st(&[("x", 1), ("y", 2), ("z", 5)]);
        let out = three_way(&base, &target, &source, &SourceWins).unwrap();
        assert_eq!(out.state, st(&[("x", 3), ("y", 2), ("z", 5)]));
        assert!(out.is_clean());
    }

    #[test]
    fn divergent_field_conflicts() {
        let base = st(&[("x", 1), ("y", 2)]);
        let target = st(&[("x", 3), ("y", 2)]);
        let source = st(&[("x", 9), ("y", 2)]);

        let out = three_way(&base, &target, &source, &SourceWins).unwrap();
        assert_eq!(out.state.field("x"), Some(&StateValue::Int(9)));
        assert_eq!(out.conflicts.len(), 1);
        let conflict = &out.conflicts[0];
        assert_eq!(conflict.field, FieldKey::field("x"));
        assert_eq!(conflict.target_value, Some(StateValue::Int(3)));
        assert_eq!(conflict.source_value, Some(StateValue::Int(9)));
        assert_eq!(conflict.resolved_value, Some(StateValue::Int(9)));

        let out = three_way(&base, &target, &source, &TargetWins).unwrap();
        assert_eq!(out.state.field("x"), Some(&StateValue::Int(3)));
    }

    #[test]
    fn one_sided_removal_sticks() {
        let base = st(&[("x", 1), ("y", 2)]);
        let target = st(&[("x", 1)]);
        let source = st(&[("x", 1), ("y", 2)]);
        let out = three_way(&base, &target, &source, &SourceWins).unwrap();
        assert_eq!(out.state, st(&[("x", 1)]));
        assert!(out.is_clean());
    }

    #[test]
    fn removal_against_change_conflicts() {
        let base = st(&[("y", 2)]);
        let target = st(&[]);
        let source = st(&[("y", 7)]);
        let out = three_way(&base, &target, &source, &TargetWins).unwrap();
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].target_value, None);
        assert_eq!(out.conflicts[0].resolved_value, None);
        assert!(out.state.field("y").is_none());
    }

    #[test]
    fn both_added_differently_conflicts() {
        let base = st(&[]);
        let target = st(&[("k", 1)]);
        let source = st(&[("k", 2)]);
        let out = three_way(&base, &target, &source, &SourceWins).unwrap();
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.state, st(&[("k", 2)]));
    }

    #[test]
    fn type_change_is_a_conflict() {
        let base = st(&[("v", 1)]);
        let target = State::new().with("v", "one");
        let source = State::new().with("v", 1.5);
        let out = three_way(&base, &target, &source, &SourceWins).unwrap();
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.state.field("v"), Some(&StateValue::Float(1.5)));
    }

    #[test]
    fn equality_is_structural() {
        let nested = |n: i64| {
            StateValue::from(serde_json::json!({ "a": [1, 2, { "b": n }] }))
        };
        let base = State::new().with("cfg", nested(0));
        let target = State::new().with("cfg", nested(1));
        let source = State::new().with("cfg", nested(1));
        let out = three_way(&base, &target, &source, &SourceWins).unwrap();
        assert!(out.is_clean());
        assert_eq!(out.state.field("cfg"), Some(&nested(1)));
    }

    #[test]
    fn extra_bucket_is_merged_too() {
        let mut base = State::new();
        base.set(FieldKey::extra("legacy"), StateValue::Int(1));
        let target = base.clone();
        let mut source = base.clone();
        source.set(FieldKey::extra("legacy"), StateValue::Int(2));
        let out = three_way(&base, &target, &source, &SourceWins).unwrap();
        assert_eq!(
            out.state.get(&FieldKey::extra("legacy")),
            Some(&StateValue::Int(2))
        );
    }

    #[test]
    fn version_is_the_newest_input() {
        let base = State { version: 1, ..st(&[]) };
        let target = State { version: 3, ..st(&[]) };
        let source = State { version: 2, ..st(&[]) };
        let out = three_way(&base, &target, &source, &SourceWins).unwrap();
        assert_eq!(out.state.version, 3);
    }

    #[test]
    fn failing_resolver_aborts() {
        let base = st(&[("x", 1), ("y", 1)]);
        let target = st(&[("x", 2), ("y", 2)]);
        let source = st(&[("x", 3), ("y", 3)]);
        let resolver = FnResolver::new("refuse_y", |c| {
            if c.field.name == "y" {
                Err(ResolveError::Declined("y is sacred".into()))
            } else {
                Ok(c.source_value.cloned())
            }
        });
        let err = three_way(&base, &target, &source, &resolver).unwrap_err();
        assert!(matches!(err, MergeError::ConflictResolution { ref field, .. } if field.name == "y"));
    }

    #[test]
    fn overwrite_copies_source() {
        let source = st(&[("a", 1)]);
        let out = overwrite(&source);
        assert_eq!(out.state, source);
        assert!(out.is_clean());
    }

    fn arb_state() -> impl Strategy<Value = State> {
        proptest::collection::btree_map(
            prop_oneof![Just("a"), Just("b"), Just("c"), Just("d")],
            0i64..3,
            0..4,
        )
        .prop_map(|m| State::from_pairs(m))
    }

    proptest! {
        #[test]
        fn merging_identical_states_is_identity(s in arb_state()) {
            let out = three_way(&s, &s, &s, &SourceWins).unwrap();
            prop_assert_eq!(out.state, s);
            prop_assert!(out.conflicts.is_empty());
        }

        #[test]
        fn unchanged_target_takes_source(base in arb_state(), source in arb_state()) {
            let out = three_way(&base, &base, &source, &TargetWins).unwrap();
            prop_assert_eq!(out.state, source);
            prop_assert!(out.conflicts.is_empty());
        }

        #[test]
        fn unchanged_source_keeps_target(base in arb_state(), target in arb_state()) {
            let out = three_way(&base, &target, &base, &SourceWins).unwrap();
            prop_assert_eq!(out.state, target);
            prop_assert!(out.conflicts.is_empty());
        }

        #[test]
        fn clean_merges_are_symmetric(
            base in arb_state(),
            target in arb_state(),
            source in arb_state(),
        ) {
            let forward = three_way(&base, &target, &source, &SourceWins).unwrap();
            let backward = three_way(&base, &source, &target, &SourceWins).unwrap();
            prop_assert_eq!(forward.conflicts.len(), backward.conflicts.len());
            if forward.conflicts.is_empty() {
                prop_assert_eq!(forward.state, backward.state);
            }
        }

        #[test]
        fn source_wins_and_target_wins_agree_off_conflicts(
            base in arb_state(),
            target in arb_state(),
            source in arb_state(),
        ) {
            let a = three_way(&base, &target, &source, &SourceWins).unwrap();
            let b = three_way(&base, &target, &source, &TargetWins).unwrap();
            let conflicted: Vec<FieldKey> = a.conflicts.iter().map(|c| c.field.clone()).collect();
            for key in a.state.keys().union(&b.state.keys()) {
                if !conflicted.contains(key) {
                    prop_assert_eq!(a.state.get(key), b.state.get(key));
                }
            }
        }

        #[test]
        fn overwrite_round_trips(s in arb_state()) {
            prop_assert_eq!(overwrite(&s).state, s);
        }
    }
}
