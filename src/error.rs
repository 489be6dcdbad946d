// src/error.rs
use serde::Serialize;
use thiserror::Error;

use crate::local_store::StorageError;
use crate::records::ValidationError;
use crate::remote::RemoteError;
use crate::sync_queue::QueueError;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("Local storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Sync queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Record could not be encoded or decoded: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Record could not be persisted anywhere: local={local}, queue={queue}")]
    Unpersisted { local: String, queue: String },
}

/// Outcome of a top-level record operation. Never thrown, always returned,
/// so callers can render a notice without unwinding.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when the remote write failed and the change only lives locally
    /// (cache and/or sync queue) until it is replayed.
    pub saved_locally: bool,
}

impl<T> OperationResult<T> {
    pub fn synced(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            saved_locally: false,
        }
    }

    pub fn local(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            saved_locally: true,
        }
    }

    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            saved_locally: false,
        }
    }
}
