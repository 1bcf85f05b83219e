use std::collections::HashMap;
use std::sync::Arc;

use lineage_types::LineId;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Once the table grows past this many entries, idle locks are dropped.
const PRUNE_THRESHOLD: usize = 1024;

/// In-process mutual exclusion per line.
///
/// Operations touching several lines lock them in ascending id order, so two
/// merges over the same pair of lines can never deadlock.
#[derive(Debug, Default)]
pub struct LineLocks {
    table: Mutex<HashMap<LineId, Arc<Mutex<()>>>>,
}

/// Held locks. Dropping it releases every line.
#[derive(Debug)]
pub struct LineGuard {
    lines: Vec<LineId>,
    _held: Vec<OwnedMutexGuard<()>>,
}

impl LineGuard {
    pub fn lines(&self) -> &[LineId] {
        &self.lines
    }
}

impl LineLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every line in `ids`, giving up at `deadline`.
    pub async fn lock(
        &self,
        ids: &[LineId],
        deadline: Instant,
        operation: &'static str,
    ) -> EngineResult<LineGuard> {
        let mut lines = ids.to_vec();
        lines.sort();
        lines.dedup();

        let mut held = Vec::with_capacity(lines.len());
        for id in &lines {
            let mutex = self.handle(*id).await;
            match tokio::time::timeout_at(deadline, mutex.lock_owned()).await {
                Ok(guard) => held.push(guard),
                Err(_) => {
                    debug!(line = %id, operation, "lock wait hit the deadline");
                    return Err(EngineError::Timeout { operation });
                }
            }
        }
        Ok(LineGuard { lines, _held: held })
    }

    /// Number of lines with a lock entry.
    pub async fn tracked(&self) -> usize {
        self.table.lock().await.len()
    }

    async fn handle(&self, id: LineId) -> Arc<Mutex<()>> {
        let mut table = self.table.lock().await;
        if table.len() >= PRUNE_THRESHOLD {
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(table.entry(id).or_default())
    }
}
