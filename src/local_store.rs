// src/local_store.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const DEFAULT_STORAGE_DIR: &str = "./ledger_cache";

/// Logical key layout of the device-local store.
pub mod keys {
    pub const OFFLINE_WORK_RECORDS: &str = "offline_work_records";
    pub const WORK_RECORDS_PREFIX: &str = "work_records_";

    // Ascending trust: later entries win on identity collisions.
    pub const OFFLINE_SETTLEMENT_RECORDS: &str = "offline_settlement_records";
    pub const SETTLEMENT_RECORDS_CACHE: &str = "settlement_records_cache";
    pub const SETTLEMENT_RECORDS: &str = "settlementRecords";

    pub const EMPLOYEES: &str = "employees";
    pub const PROJECTS_PREFIX: &str = "projects_";
    pub const SYNC_QUEUE: &str = "offline_sync_queue";

    pub fn work_records(user_id: &str) -> String {
        format!("{}{}", WORK_RECORDS_PREFIX, user_id)
    }

    pub fn projects(user_id: &str) -> String {
        format!("{}{}", PROJECTS_PREFIX, user_id)
    }

    pub fn attendance_shadow(record_id: &str) -> String {
        format!("attendance_data_{}", record_id)
    }

    pub fn settlement_shadow(settlement_id: &str) -> String {
        format!("settlement_data_{}", settlement_id)
    }

    pub fn attendance_sources(user_id: &str) -> Vec<String> {
        vec![OFFLINE_WORK_RECORDS.to_string(), work_records(user_id)]
    }

    pub fn settlement_sources() -> Vec<String> {
        vec![
            OFFLINE_SETTLEMENT_RECORDS.to_string(),
            SETTLEMENT_RECORDS_CACHE.to_string(),
            SETTLEMENT_RECORDS.to_string(),
        ]
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Storage quota exceeded writing '{key}' ({needed} bytes, {available} available)")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },
    #[error("Storage lock poisoned: {0}")]
    Lock(String),
    #[error("System time error: {0}")]
    Time(String),
}

fn io_context<S: Into<String>>(source: std::io::Error, context: S) -> StorageError {
    StorageError::Io {
        source,
        context: context.into(),
    }
}

/// String key/value store with `localStorage` semantics.
pub trait LocalStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

pub fn write_json<T: Serialize + ?Sized>(
    storage: &dyn LocalStorage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    storage.set_item(key, &raw)
}

// --- In-memory storage ---

#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that refuses writes once the total stored bytes would exceed `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.items
            .lock()
            .map_err(|e| StorageError::Lock(e.to_string()))
    }
}

impl LocalStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.lock()?;
        if let Some(quota) = self.quota_bytes {
            let used: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = key.len() + value.len();
            if used + needed > quota {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self.lock()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

// --- File-backed storage ---

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMetadata {
    key: String,
    last_updated_unix_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    metadata: EntryMetadata,
    value: String,
}

/// One JSON envelope file per key inside `dir`. The original key is kept in
/// the envelope so `keys()` survives the file-name sanitising.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
    write_lock: std::sync::Arc<Mutex<()>>,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                io_context(e, format!("Failed to create storage directory: {:?}", dir))
            })?;
            info!("Created local storage directory {:?}", dir);
        }
        Ok(Self {
            dir,
            write_lock: std::sync::Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name_for_key(key: &str) -> String {
        let mut name = key.replace(|c: char| !c.is_ascii_alphanumeric() && c != '_', "_");
        const MAX_KEY_LEN: usize = 100;
        if name.len() > MAX_KEY_LEN || name != key {
            // Sanitising is lossy, so disambiguate with a hash of the raw key.
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(key.as_bytes());
            let hash = hasher.finalize();
            let prefix: String = name.chars().take(MAX_KEY_LEN / 2).collect();
            name = format!("{}_{}", prefix, hex::encode(&hash[..8]));
        }
        format!("{}.json", name)
    }

    fn path_for_key(&self, key: &str) -> PathBuf {
        self.dir.join(Self::file_name_for_key(key))
    }

    fn read_entry(path: &Path) -> Result<Option<StoredEntry>, StorageError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| io_context(e, format!("Failed to read storage file: {:?}", path)))?;
        match serde_json::from_str::<StoredEntry>(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(
                    "Failed to deserialize storage file {:?}: {}. Removing corrupt file.",
                    path, e
                );
                if let Err(remove_err) = fs::remove_file(path) {
                    error!(
                        "Failed to remove corrupt storage file {:?}: {}",
                        path, remove_err
                    );
                }
                Ok(None)
            }
        }
    }
}

impl LocalStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for_key(key);
        if !path.exists() {
            debug!("Storage miss for key: {}", key);
            return Ok(None);
        }
        Ok(Self::read_entry(&path)?
            .filter(|entry| entry.metadata.key == key)
            .map(|entry| entry.value))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| StorageError::Lock(e.to_string()))?;
        let path = self.path_for_key(key);
        let entry = StoredEntry {
            metadata: EntryMetadata {
                key: key.to_string(),
                last_updated_unix_secs: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_err(|e| StorageError::Time(e.to_string()))?
                    .as_secs(),
            },
            value: value.to_string(),
        };
        let json_string = serde_json::to_string(&entry)?;

        // Write-then-rename so a crash never leaves a half-written entry.
        let tmp_path = path.with_extension("json.tmp");
        let mut file = File::create(&tmp_path)
            .map_err(|e| io_context(e, format!("Failed to create storage file: {:?}", tmp_path)))?;
        file.write_all(json_string.as_bytes())
            .map_err(|e| io_context(e, format!("Failed to write storage file: {:?}", tmp_path)))?;
        file.sync_all()
            .map_err(|e| io_context(e, format!("Failed to flush storage file: {:?}", tmp_path)))?;
        fs::rename(&tmp_path, &path)
            .map_err(|e| io_context(e, format!("Failed to replace storage file: {:?}", path)))?;
        debug!("Saved storage entry for key: {}", key);
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for_key(key);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| io_context(e, format!("Failed to remove storage file: {:?}", path)))?;
            debug!("Removed storage entry for key: {}", key);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            io_context(e, format!("Failed to read storage directory: {:?}", self.dir))
        })?;
        let mut keys = Vec::new();
        for entry_result in entries {
            let entry = entry_result.map_err(|e| io_context(e, "Failed to read directory entry"))?;
            let path = entry.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
                if let Some(stored) = Self::read_entry(&path)? {
                    keys.push(stored.metadata.key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
