use std::fmt;

use lineage_types::{FieldKey, StateValue};

use crate::error::{MergeError, ResolveError};

/// A field that diverged on both sides of a three-way merge.
///
/// `None` means the field is absent on that side.
#[derive(Clone, Copy, Debug)]
pub struct ConflictInput<'a> {
    pub field: &'a FieldKey,
    pub base_value: Option<&'a StateValue>,
    pub target_value: Option<&'a StateValue>,
    pub source_value: Option<&'a StateValue>,
}

/// Policy that picks a value for a conflicting field.
///
/// Implementations must be pure: the same input always yields the same
/// output, with no I/O and no hidden state, so merges can be replayed for
/// audit. Returning `Ok(None)` removes the field from the merged state.
pub trait ConflictResolver: Send + Sync {
    /// Stable name recorded alongside merges.
    fn name(&self) -> &str;

    fn resolve(&self, conflict: &ConflictInput<'_>) -> Result<Option<StateValue>, ResolveError>;

    /// Built-in resolvers are known to be pure and skip the determinism
    /// check in [`resolve_checked`].
    fn is_builtin(&self) -> bool {
        false
    }
}

/// The source value wins every conflict. This is the default policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct SourceWins;

impl ConflictResolver for SourceWins {
    fn name(&self) -> &str {
        "source_wins"
    }

    fn resolve(&self, conflict: &ConflictInput<'_>) -> Result<Option<StateValue>, ResolveError> {
        Ok(conflict.source_value.cloned())
    }

    fn is_builtin(&self) -> bool {
        true
    }
}

/// The target value wins every conflict.
#[derive(Clone, Copy, Debug, Default)]
pub struct TargetWins;

impl ConflictResolver for TargetWins {
    fn name(&self) -> &str {
        "target_wins"
    }

    fn resolve(&self, conflict: &ConflictInput<'_>) -> Result<Option<StateValue>, ResolveError> {
        Ok(conflict.target_value.cloned())
    }

    fn is_builtin(&self) -> bool {
        true
    }
}

type ResolveFn =
    dyn Fn(&ConflictInput<'_>) -> Result<Option<StateValue>, ResolveError> + Send + Sync;

/// A caller-supplied resolution function.
pub struct FnResolver {
    name: String,
    f: Box<ResolveFn>,
}

impl FnResolver {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ConflictInput<'_>) -> Result<Option<StateValue>, ResolveError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl fmt::Debug for FnResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnResolver").field("name", &self.name).finish()
    }
}

impl ConflictResolver for FnResolver {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, conflict: &ConflictInput<'_>) -> Result<Option<StateValue>, ResolveError> {
        (self.f)(conflict)
    }
}

/// Resolve one conflict, rejecting errors and non-deterministic answers.
///
/// Non-builtin resolvers are asked twice; differing answers fail the merge.
pub fn resolve_checked(
    resolver: &dyn ConflictResolver,
    conflict: &ConflictInput<'_>,
) -> Result<Option<StateValue>, MergeError> {
    let fail = |source: ResolveError| MergeError::ConflictResolution {
        field: conflict.field.clone(),
        resolver: resolver.name().to_string(),
        source,
    };

    let first = resolver.resolve(conflict).map_err(fail)?;
    if !resolver.is_builtin() {
        let second = resolver.resolve(conflict).map_err(fail)?;
        if first != second {
            return Err(fail(ResolveError::NonDeterministic));
        }
    }
    Ok(first)
}

/// Look up a built-in resolver by name (`source`, `source_wins`, `target`,
/// `target_wins`).
pub fn builtin(name: &str) -> Option<Box<dyn ConflictResolver>> {
    match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "source" | "source_wins" => Some(Box::new(SourceWins)),
        "target" | "target_wins" => Some(Box::new(TargetWins)),
        _ => None,
    }
}
