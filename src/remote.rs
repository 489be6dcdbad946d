// src/remote.rs

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

pub const ATTENDANCE_TABLE: &str = "attendance_records";
pub const SETTLEMENT_TABLE: &str = "settlement_records";
pub const DEFAULT_IMAGE_BUCKET: &str = "work-images";
pub const DEFAULT_SETTLEMENT_IMAGE_BUCKET: &str = "settlement-images";

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Remote store unreachable")]
    Unreachable,
    #[error("Remote store error: Status={status}, Message='{message}'")]
    Api { status: StatusCode, message: String },
    #[error("Remote lock poisoned")]
    Lock,
}

impl RemoteError {
    /// Storage conflicts on upload mean the object is already there.
    pub fn is_already_exists(&self) -> bool {
        match self {
            RemoteError::Api { status, message } => {
                *status == StatusCode::CONFLICT || message.contains("already exists")
            }
            _ => false,
        }
    }
}

/// `column = value` filter for update/delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMatch {
    pub column: String,
    pub value: String,
}

impl RowMatch {
    pub fn new(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    fn matches(&self, row: &Value) -> bool {
        row.get(&self.column).and_then(Value::as_str) == Some(self.value.as_str())
    }
}

#[async_trait]
pub trait RemoteRecordStore: Send + Sync {
    async fn insert(&self, table: &str, row: Value) -> Result<Value, RemoteError>;
    async fn update(
        &self,
        table: &str,
        matcher: &RowMatch,
        patch: Value,
    ) -> Result<Vec<Value>, RemoteError>;
    async fn delete(&self, table: &str, matcher: &RowMatch) -> Result<(), RemoteError>;
    async fn remove_objects(&self, bucket: &str, paths: &[String]) -> Result<(), RemoteError>;
}

#[async_trait]
pub trait ImageStorage: Send + Sync {
    /// Uploads and returns the public URL. Re-uploading an existing object succeeds.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, RemoteError>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

// --- Public URL helpers ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub path: String,
}

static PUBLIC_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://[^/]+/storage/v1/object/public/([^/?#]+)/([^?#]+)")
        .unwrap_or_else(|e| panic!("invalid public url pattern: {}", e))
});

/// `https://<host>/storage/v1/object/public/<bucket>/<url-encoded-path>`
pub fn build_public_url(base_url: &str, bucket: &str, path: &str) -> String {
    let encoded_path: Vec<String> = path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!(
        "{}/storage/v1/object/public/{}/{}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(bucket),
        encoded_path.join("/")
    )
}

/// Inverse of [`build_public_url`], with the path percent-decoded.
pub fn parse_public_url(url: &str) -> Option<ObjectLocation> {
    let captures = PUBLIC_URL_RE.captures(url)?;
    let bucket = urlencoding::decode(captures.get(1)?.as_str()).ok()?.into_owned();
    let path = urlencoding::decode(captures.get(2)?.as_str()).ok()?.into_owned();
    Some(ObjectLocation { bucket, path })
}

// --- REST implementation ---

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

#[derive(Clone)]
pub struct RestRemoteStore {
    config: RemoteConfig,
    http_client: Client,
}

impl RestRemoteStore {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        Url::parse(&config.base_url)?;
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    fn build_request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        self.http_client
            .request(method, url)
            .header("apikey", &self.config.api_key)
            .header(AUTHORIZATION, format!("Bearer {}", self.config.api_key))
            .header(ACCEPT, "application/json")
    }

    async fn send(&self, request: RequestBuilder, context_msg: &str) -> Result<String, RemoteError> {
        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                warn!("{}: remote store unreachable: {}", context_msg, e);
                RemoteError::Unreachable
            } else {
                RemoteError::Request(e)
            }
        })?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            debug!("{} succeeded with status {}", context_msg, status);
            Ok(body)
        } else {
            error!(
                "{} failed. Status: {}, Body: {}",
                context_msg, status, body
            );
            Err(RemoteError::Api {
                status,
                message: body,
            })
        }
    }

    async fn send_and_deserialize<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        context_msg: &str,
    ) -> Result<T, RemoteError> {
        let body = self.send(request, context_msg).await?;
        Ok(serde_json::from_str(&body)?)
    }

    fn filter_query(matcher: &RowMatch) -> [(String, String); 1] {
        [(matcher.column.clone(), format!("eq.{}", matcher.value))]
    }
}

#[async_trait]
impl RemoteRecordStore for RestRemoteStore {
    async fn insert(&self, table: &str, row: Value) -> Result<Value, RemoteError> {
        let request = self
            .build_request(Method::POST, &format!("/rest/v1/{}", table))
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "return=representation")
            .json(&row);
        let mut rows: Vec<Value> = self
            .send_and_deserialize(request, &format!("Insert into {}", table))
            .await?;
        Ok(rows.pop().unwrap_or(row))
    }

    async fn update(
        &self,
        table: &str,
        matcher: &RowMatch,
        patch: Value,
    ) -> Result<Vec<Value>, RemoteError> {
        let request = self
            .build_request(Method::PATCH, &format!("/rest/v1/{}", table))
            .query(&Self::filter_query(matcher))
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "return=representation")
            .json(&patch);
        self.send_and_deserialize(request, &format!("Update {}", table))
            .await
    }

    async fn delete(&self, table: &str, matcher: &RowMatch) -> Result<(), RemoteError> {
        let request = self
            .build_request(Method::DELETE, &format!("/rest/v1/{}", table))
            .query(&Self::filter_query(matcher));
        self.send(request, &format!("Delete from {}", table)).await?;
        Ok(())
    }

    async fn remove_objects(&self, bucket: &str, paths: &[String]) -> Result<(), RemoteError> {
        if paths.is_empty() {
            return Ok(());
        }
        let request = self
            .build_request(
                Method::DELETE,
                &format!("/storage/v1/object/{}", urlencoding::encode(bucket)),
            )
            .header(CONTENT_TYPE, "application/json")
            .json(&serde_json::json!({ "prefixes": paths }));
        self.send(request, &format!("Remove {} objects from {}", paths.len(), bucket))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ImageStorage for RestRemoteStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, RemoteError> {
        let encoded_path: Vec<String> = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        let request = self
            .build_request(
                Method::POST,
                &format!(
                    "/storage/v1/object/{}/{}",
                    urlencoding::encode(bucket),
                    encoded_path.join("/")
                ),
            )
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes);
        match self.send(request, &format!("Upload {}/{}", bucket, path)).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {
                info!("Object {}/{} already exists, treating upload as done", bucket, path);
            }
            Err(e) => return Err(e),
        }
        Ok(self.public_url(bucket, path))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        build_public_url(&self.config.base_url, bucket, path)
    }
}

// --- In-memory implementation ---

/// Process-local stand-in for the remote store. Used when no remote is
/// configured and by tests, which can flip it unreachable.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    base_url: String,
    tables: Mutex<HashMap<String, Vec<Value>>>,
    objects: Mutex<HashSet<(String, String)>>,
    unreachable: AtomicBool,
}

impl InMemoryRemoteStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            ..Default::default()
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .map(|tables| tables.get(table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn has_object(&self, bucket: &str, path: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains(&(bucket.to_string(), path.to_string())))
            .unwrap_or(false)
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(RemoteError::Unreachable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteRecordStore for InMemoryRemoteStore {
    async fn insert(&self, table: &str, row: Value) -> Result<Value, RemoteError> {
        self.check_reachable()?;
        let mut tables = self.tables.lock().map_err(|_| RemoteError::Lock)?;
        tables.entry(table.to_string()).or_default().push(row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        matcher: &RowMatch,
        patch: Value,
    ) -> Result<Vec<Value>, RemoteError> {
        self.check_reachable()?;
        let mut tables = self.tables.lock().map_err(|_| RemoteError::Lock)?;
        let mut updated = Vec::new();
        if let Some(rows) = tables.get_mut(table) {
            for row in rows.iter_mut().filter(|row| matcher.matches(row)) {
                if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
                    for (key, value) in fields {
                        target.insert(key.clone(), value.clone());
                    }
                }
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, matcher: &RowMatch) -> Result<(), RemoteError> {
        self.check_reachable()?;
        let mut tables = self.tables.lock().map_err(|_| RemoteError::Lock)?;
        if let Some(rows) = tables.get_mut(table) {
            rows.retain(|row| !matcher.matches(row));
        }
        Ok(())
    }

    async fn remove_objects(&self, bucket: &str, paths: &[String]) -> Result<(), RemoteError> {
        self.check_reachable()?;
        let mut objects = self.objects.lock().map_err(|_| RemoteError::Lock)?;
        for path in paths {
            objects.remove(&(bucket.to_string(), path.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageStorage for InMemoryRemoteStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        _bytes: Bytes,
        _content_type: &str,
    ) -> Result<String, RemoteError> {
        self.check_reachable()?;
        self.objects
            .lock()
            .map_err(|_| RemoteError::Lock)?
            .insert((bucket.to_string(), path.to_string()));
        Ok(self.public_url(bucket, path))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        build_public_url(&self.base_url, bucket, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_public_url_round_trips_through_parse() {
        let url = build_public_url("https://demo.example.com/", "work-images", "p1/现场 01.jpg");
        assert_eq!(
            url,
            "https://demo.example.com/storage/v1/object/public/work-images/p1/%E7%8E%B0%E5%9C%BA%2001.jpg"
        );
        let location = parse_public_url(&url).unwrap();
        assert_eq!(location.bucket, "work-images");
        assert_eq!(location.path, "p1/现场 01.jpg");
    }

    #[test]
    fn test_non_storage_url_does_not_parse() {
        assert_eq!(parse_public_url("https://example.com/images/a.jpg"), None);
    }

    #[test]
    fn test_conflict_counts_as_already_exists() {
        let err = RemoteError::Api {
            status: StatusCode::CONFLICT,
            message: "Duplicate".to_string(),
        };
        assert!(err.is_already_exists());
        assert!(!RemoteError::Unreachable.is_already_exists());
    }

    #[tokio::test]
    async fn test_in_memory_store_applies_patch_and_delete() {
        let store = InMemoryRemoteStore::new("https://demo.example.com");
        store
            .insert(ATTENDANCE_TABLE, json!({"record_id": "r1", "regular_hours": "8"}))
            .await
            .unwrap();
        let updated = store
            .update(
                ATTENDANCE_TABLE,
                &RowMatch::new("record_id", "r1"),
                json!({"regular_hours": "9"}),
            )
            .await
            .unwrap();
        assert_eq!(updated[0]["regular_hours"], "9");

        store
            .delete(ATTENDANCE_TABLE, &RowMatch::new("record_id", "r1"))
            .await
            .unwrap();
        assert!(store.rows(ATTENDANCE_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_every_call() {
        let store = InMemoryRemoteStore::new("https://demo.example.com");
        store.set_reachable(false);
        let err = store.insert(SETTLEMENT_TABLE, json!({})).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unreachable));
        let err = store
            .upload("b", "p.jpg", Bytes::from_static(b"x"), "image/jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Unreachable));
    }
}
