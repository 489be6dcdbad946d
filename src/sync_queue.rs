// src/sync_queue.rs
//! Durable log of mutations waiting for the remote store.
//!
//! The replayer that drains this queue lives outside the crate; here we only
//! append entries and read them back for optimistic local reflection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::local_store::{keys, write_json, LocalStorage, StorageError};
use crate::records::{generate_id, RecordCategory};
use crate::remote::parse_public_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    SaveRecord,
    UpdateRecord,
    DeleteRecord,
    UploadImage,
    DeleteImage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MutationKind,
    pub payload: Value,
    pub identity: String,
    pub category: RecordCategory,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDeletePayload {
    pub bucket: String,
    /// Object path inside the bucket, already percent-decoded.
    pub path: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUploadPayload {
    pub bucket: String,
    pub path: String,
    pub content_type: String,
    /// Standard base64 of the raw image bytes.
    pub data_base64: String,
    /// URL the record already references; valid once the upload replays.
    pub url: String,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Queue payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Queue lock poisoned")]
    Lock,
}

/// Append side of the offline replayer.
pub trait SyncQueueSink: Send + Sync {
    fn add_to_sync_queue(
        &self,
        kind: MutationKind,
        payload: Value,
        identity: &str,
        category: RecordCategory,
    ) -> Result<(), QueueError>;

    /// Removes queued saves and updates of a record the remote store now
    /// holds in its latest state. Returns how many entries were dropped.
    fn supersede_record_writes(
        &self,
        identity: &str,
        category: RecordCategory,
    ) -> Result<usize, QueueError>;
}

/// Queue persisted as one JSON array under [`keys::SYNC_QUEUE`].
pub struct LocalSyncQueue {
    storage: Arc<dyn LocalStorage>,
    clock: Arc<dyn Clock>,
    // Serialises read-modify-write of the stored array.
    write_lock: Mutex<()>,
}

impl LocalSyncQueue {
    pub fn new(storage: Arc<dyn LocalStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Stored elements as they are, including ones this crate cannot type.
    fn read_raw(&self) -> Result<Vec<Value>, QueueError> {
        let Some(raw) = self.storage.get_item(keys::SYNC_QUEUE)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(values)) => Ok(values),
            _ => {
                // Keep the unreadable content for manual recovery before starting over.
                let backup = format!(
                    "{}_unreadable_{}",
                    keys::SYNC_QUEUE,
                    self.clock.now().timestamp_millis()
                );
                self.storage.set_item(&backup, &raw)?;
                warn!("Sync queue content is not a list, moved it to '{}'", backup);
                Ok(Vec::new())
            }
        }
    }

    fn typed(value: &Value) -> Option<QueueEntry> {
        match serde_json::from_value::<QueueEntry>(value.clone()) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(
                    "Sync queue entry not in the expected shape, leaving it for the replayer: {}",
                    e
                );
                None
            }
        }
    }

    /// All entries in append order. An unreadable queue reads as empty.
    pub fn entries(&self) -> Vec<QueueEntry> {
        let values = match self.storage.get_item(keys::SYNC_QUEUE) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<Value>>(&raw) {
                Ok(values) => values,
                Err(e) => {
                    warn!("Sync queue content is not a list, ignoring it: {}", e);
                    return Vec::new();
                }
            },
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("Failed to read sync queue: {}", e);
                return Vec::new();
            }
        };
        values.iter().filter_map(Self::typed).collect()
    }

    pub fn entries_for(&self, category: RecordCategory) -> Vec<QueueEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.category == category)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops an entry once the replayer has applied it.
    pub fn acknowledge(&self, entry_id: &str) -> Result<bool, QueueError> {
        let _guard = self.write_lock.lock().map_err(|_| QueueError::Lock)?;
        let mut values = self.read_raw()?;
        let before = values.len();
        values.retain(|value| value.get("id").and_then(Value::as_str) != Some(entry_id));
        let removed = values.len() != before;
        if removed {
            write_json(self.storage.as_ref(), keys::SYNC_QUEUE, &values)?;
            debug!("Acknowledged sync queue entry {}", entry_id);
        }
        Ok(removed)
    }
}

impl SyncQueueSink for LocalSyncQueue {
    fn add_to_sync_queue(
        &self,
        kind: MutationKind,
        payload: Value,
        identity: &str,
        category: RecordCategory,
    ) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().map_err(|_| QueueError::Lock)?;
        let mut values = self.read_raw()?;

        // Deleting the same object twice is a no-op for the replayer, so keep one entry.
        if kind == MutationKind::DeleteImage
            && values.iter().filter_map(Self::typed).any(|entry| {
                entry.kind == kind && entry.identity == identity && entry.payload == payload
            })
        {
            debug!("Image delete for {} already queued, skipping", identity);
            return Ok(());
        }

        let now = self.clock.now();
        let entry = QueueEntry {
            id: generate_id("sync", now),
            kind,
            payload,
            identity: identity.to_string(),
            category,
            queued_at: now,
        };
        values.push(serde_json::to_value(&entry)?);
        write_json(self.storage.as_ref(), keys::SYNC_QUEUE, &values)?;
        info!(
            "Queued {:?} for {:?} {} ({} pending)",
            kind,
            category,
            identity,
            values.len()
        );
        Ok(())
    }

    fn supersede_record_writes(
        &self,
        identity: &str,
        category: RecordCategory,
    ) -> Result<usize, QueueError> {
        let _guard = self.write_lock.lock().map_err(|_| QueueError::Lock)?;
        let mut values = self.read_raw()?;
        let before = values.len();
        values.retain(|value| {
            !Self::typed(value).map_or(false, |entry| {
                matches!(entry.kind, MutationKind::SaveRecord | MutationKind::UpdateRecord)
                    && entry.identity == identity
                    && entry.category == category
            })
        });
        let dropped = before - values.len();
        if dropped > 0 {
            write_json(self.storage.as_ref(), keys::SYNC_QUEUE, &values)?;
            info!(
                "Dropped {} pending writes of {:?} {} after it synced",
                dropped, category, identity
            );
        }
        Ok(dropped)
    }
}

// --- Image change detection ---

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageDiff {
    /// False only when both lists are identical position by position.
    pub changed: bool,
    /// In the old list but not the new one, compared by value.
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

pub fn diff_images(old: &[String], new: &[String]) -> ImageDiff {
    if old.len() == new.len() && old.iter().zip(new).all(|(a, b)| a == b) {
        return ImageDiff::default();
    }

    let new_set: HashSet<&String> = new.iter().collect();
    let old_set: HashSet<&String> = old.iter().collect();
    let mut seen = HashSet::new();
    let removed = old
        .iter()
        .filter(|url| !new_set.contains(url) && seen.insert(url.as_str()))
        .cloned()
        .collect();
    let added = new
        .iter()
        .filter(|url| !old_set.contains(url))
        .cloned()
        .collect();

    ImageDiff {
        changed: true,
        removed,
        added,
    }
}

/// One replayable delete per removed image. URLs that are not public storage
/// URLs fall back to `default_bucket` with the raw value as path.
pub fn image_delete_payloads(removed: &[String], default_bucket: &str) -> Vec<ImageDeletePayload> {
    removed
        .iter()
        .map(|url| match parse_public_url(url) {
            Some(location) => ImageDeletePayload {
                bucket: location.bucket,
                path: location.path,
                url: url.clone(),
            },
            None => {
                warn!(
                    "Image reference '{}' is not a public storage URL, deleting it from {}",
                    url, default_bucket
                );
                ImageDeletePayload {
                    bucket: default_bucket.to_string(),
                    path: url.clone(),
                    url: url.clone(),
                }
            }
        })
        .collect()
}
