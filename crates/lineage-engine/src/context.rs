use std::time::Duration;

use lineage_types::IdempotencyKey;
use tokio::time::Instant;

/// Per-call options: a deadline and an optional idempotency key.
///
/// With no deadline the engine applies
/// [`EngineConfig::default_timeout`](crate::EngineConfig::default_timeout)
/// from the moment the call starts.
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    pub deadline: Option<Instant>,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    pub(crate) fn deadline_or(&self, default_timeout: Duration) -> Instant {
        self.deadline
            .unwrap_or_else(|| Instant::now() + default_timeout)
    }
}
