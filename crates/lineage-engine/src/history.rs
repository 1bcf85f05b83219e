//! Lineage history hooks.
//!
//! The engine reports committed changes to a [`HistoryRecorder`] after the
//! fact. Recorder failures are logged and never undo or fail the operation.

use async_trait::async_trait;
use lineage_types::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Line,
    Merge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Forked,
    StatusChanged,
    Merged,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Forked => "forked",
            Self::StatusChanged => "status_changed",
            Self::Merged => "merged",
        }
    }
}

/// One committed change, as reported to a recorder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub action: HistoryAction,
    pub details: serde_json::Value,
    pub recorded_at: Timestamp,
}

impl HistoryEntry {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl ToString,
        action: HistoryAction,
        details: serde_json::Value,
    ) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            entity_type,
            action,
            details,
            recorded_at: lineage_types::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("history recorder failed: {0}")]
pub struct HistoryError(pub String);

/// Sink for lineage history.
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    async fn record(&self, entry: HistoryEntry) -> Result<(), HistoryError>;
}

/// Discards every entry.
pub struct NoopHistory;

#[async_trait]
impl HistoryRecorder for NoopHistory {
    async fn record(&self, _entry: HistoryEntry) -> Result<(), HistoryError> {
        Ok(())
    }
}

/// Emits each entry as an `info!` event.
pub struct TracingHistory;

#[async_trait]
impl HistoryRecorder for TracingHistory {
    async fn record(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        info!(
            entity = %entry.entity_id,
            entity_type = ?entry.entity_type,
            action = entry.action.as_str(),
            details = %entry.details,
            "lineage history"
        );
        Ok(())
    }
}

/// Keeps entries in memory.
#[derive(Default)]
pub struct MemoryHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl HistoryRecorder for MemoryHistory {
    async fn record(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: HistoryAction) -> HistoryEntry {
        HistoryEntry::new(
            EntityType::Line,
            "line-1",
            action,
            serde_json::json!({ "k": 1 }),
        )
    }

    #[tokio::test]
    async fn noop_accepts_everything() {
        assert!(NoopHistory.record(entry(HistoryAction::Created)).await.is_ok());
        assert!(TracingHistory.record(entry(HistoryAction::Merged)).await.is_ok());
    }

    #[tokio::test]
    async fn memory_keeps_order() {
        let history = MemoryHistory::new();
        history.record(entry(HistoryAction::Created)).await.unwrap();
        history.record(entry(HistoryAction::Forked)).await.unwrap();
        let entries = history.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, HistoryAction::Created);
        assert_eq!(entries[1].action, HistoryAction::Forked);
    }

    #[test]
    fn entry_serializes_snake_case() {
        let json = serde_json::to_value(entry(HistoryAction::StatusChanged)).unwrap();
        assert_eq!(json["action"], "status_changed");
        assert_eq!(json["entity_type"], "line");
    }
}
