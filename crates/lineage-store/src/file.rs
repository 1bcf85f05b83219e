//! File-backed store: an append-only write-ahead log replayed into memory.
//!
//! Every applied batch becomes exactly one log frame, so a batch is durable
//! as a unit or not at all. On-disk format:
//!
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (bincode-serialized LogRecord)]
//! ```
//!
//! On open the log is replayed front to back. The first frame that is torn
//! or fails its CRC ends the log: it and everything after it are truncated.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::{decode_counter, WriteBatch, WriteOp};
use crate::error::{StoreError, StoreResult};
use crate::memory::{commit_resolved, resolve_ops, scan_map, KeyMap};
use crate::namespace::Namespace;
use crate::traits::KvStore;

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Flush/sync strategy for the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every batch (safest, highest latency).
    EveryWrite,
    /// Rely on OS page-cache buffering (fastest, least durable).
    #[default]
    OsDefault,
}

/// Configuration for [`FileKvStore`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStoreConfig {
    pub sync_mode: SyncMode,
    /// Truncate a torn or corrupt tail on open. When `false`, opening a log
    /// with an invalid frame fails with [`StoreError::Corrupt`].
    pub truncate_corrupt_tail: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::default(),
            truncate_corrupt_tail: true,
        }
    }
}

/// One frame of the log: the resolved puts/deletes of one batch.
#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    ops: Vec<WriteOp>,
}

struct LogWriter {
    file: File,
    offset: u64,
}

/// Durable key/value store over a single write-ahead log file.
pub struct FileKvStore {
    path: PathBuf,
    config: FileStoreConfig,
    writer: Mutex<LogWriter>,
    index: RwLock<KeyMap>,
}

impl FileKvStore {
    /// Open (or create) the log at `path` and replay it.
    pub fn open(path: impl AsRef<Path>, config: FileStoreConfig) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let Replayed {
            index,
            valid_len,
            frames,
            stop,
        } = replay(&raw);

        if let Some(reason) = stop {
            if !config.truncate_corrupt_tail {
                return Err(StoreError::Corrupt {
                    offset: valid_len,
                    reason,
                });
            }
            warn!(
                path = %path.display(),
                valid_len,
                file_len = raw.len(),
                %reason,
                "discarding invalid log tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        info!(path = %path.display(), frames, keys = index.len(), "opened lineage log");

        Ok(Self {
            path,
            config,
            writer: Mutex::new(LogWriter {
                file,
                offset: valid_len,
            }),
            index: RwLock::new(index),
        })
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log in bytes.
    pub fn log_len(&self) -> StoreResult<u64> {
        let w = self
            .writer
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        Ok(w.offset)
    }

    /// Rewrite the log as a single frame holding the current contents.
    ///
    /// The new log is written beside the old one and renamed over it, so a
    /// crash mid-compaction leaves the old log intact.
    pub fn compact(&self) -> StoreResult<()> {
        let mut w = self
            .writer
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        let index = self
            .index
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;

        let record = LogRecord {
            ops: index
                .iter()
                .map(|((ns, key), value)| WriteOp::Put {
                    ns: *ns,
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        };
        let frame = encode_frame(&record)?;

        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            if !record.ops.is_empty() {
                tmp.write_all(&frame)?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        let offset = file.metadata()?.len();
        let before = w.offset;
        *w = LogWriter { file, offset };

        info!(before, after = offset, "compacted lineage log");
        Ok(())
    }

    fn append_frame(&self, w: &mut LogWriter, frame: &[u8]) -> StoreResult<()> {
        let start = w.offset;
        let result = w.file.write_all(frame).and_then(|()| {
            w.file.flush()?;
            if self.config.sync_mode == SyncMode::EveryWrite {
                w.file.sync_data()?;
            }
            Ok(())
        });

        if let Err(e) = result {
            // Drop any partially written bytes so the next frame starts clean.
            if let Err(trunc) = w.file.set_len(start) {
                warn!(offset = start, error = %trunc, "failed to truncate torn frame");
            }
            return Err(e.into());
        }

        w.offset += frame.len() as u64;
        debug!(offset = start, len = frame.len(), "log append");
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, ns: Namespace, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let index = self
            .index
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        Ok(index.get(&(ns, key.to_string())).cloned())
    }

    fn scan(&self, ns: Namespace, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let index = self
            .index
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        Ok(scan_map(&index, ns, prefix))
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        self.apply_logged(batch).map(|_| ())
    }

    fn increment(&self, ns: Namespace, key: &str, by: u64) -> StoreResult<u64> {
        let mut batch = WriteBatch::new();
        batch.increment(ns, key, by);
        let resolved = self.apply_logged(batch)?;
        match resolved.last() {
            Some(WriteOp::Put { value, .. }) => decode_counter(ns, key, Some(value.as_slice())),
            _ => Ok(0),
        }
    }
}

impl FileKvStore {
    /// Validate, log, then publish a batch. Returns the resolved ops.
    fn apply_logged(&self, batch: WriteBatch) -> StoreResult<Vec<WriteOp>> {
        // The writer lock serializes batches; the index lock is only held
        // long enough to validate and, after the frame is durable, to publish.
        let mut w = self
            .writer
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;

        let resolved = {
            let index = self
                .index
                .read()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            batch.check_guards(|ns, key| index.get(&(ns, key.to_string())).cloned())?;
            resolve_ops(&index, batch.into_ops())?
        };
        if resolved.is_empty() {
            return Ok(resolved);
        }

        let record = LogRecord { ops: resolved };
        let frame = encode_frame(&record)?;
        self.append_frame(&mut w, &frame)?;

        let mut index = self
            .index
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        commit_resolved(&mut index, record.ops.clone());
        Ok(record.ops)
    }
}

impl std::fmt::Debug for FileKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKvStore")
            .field("path", &self.path)
            .finish()
    }
}

fn encode_frame(record: &LogRecord) -> StoreResult<Vec<u8>> {
    let payload =
        bincode::serialize(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let length = u32::try_from(payload.len()).map_err(|_| {
        StoreError::Serialization(format!("frame of {} bytes is too large", payload.len()))
    })?;
    let crc = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

struct Replayed {
    index: KeyMap,
    valid_len: u64,
    frames: usize,
    /// Why replay stopped before the end of the file, if it did.
    stop: Option<String>,
}

fn replay(raw: &[u8]) -> Replayed {
    let mut index = BTreeMap::new();
    let mut offset = 0usize;
    let mut frames = 0usize;
    let mut stop = None;

    while offset < raw.len() {
        if offset + HEADER_SIZE > raw.len() {
            stop = Some("truncated frame header".to_string());
            break;
        }
        let header = &raw[offset..offset + HEADER_SIZE];
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let start = offset + HEADER_SIZE;
        if length == 0 || start + length > raw.len() {
            stop = Some(format!("torn frame of {length} bytes"));
            break;
        }

        let payload = &raw[start..start + length];
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            stop = Some(format!(
                "CRC mismatch: expected {expected_crc:#010x}, got {actual_crc:#010x}"
            ));
            break;
        }

        match bincode::deserialize::<LogRecord>(payload) {
            Ok(record) => commit_resolved(&mut index, record.ops),
            Err(e) => {
                stop = Some(format!("undecodable frame: {e}"));
                break;
            }
        }

        frames += 1;
        offset = start + length;
    }

    Replayed {
        index,
        valid_len: offset as u64,
        frames,
        stop,
    }
}
