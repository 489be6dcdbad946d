// src/record_service.rs
//! Save, update and delete of ledger records.
//!
//! Every write goes to the remote store first. When that fails for any reason
//! the record is written to the local cache and appended to the sync queue;
//! both are attempted even if the other fails. Only when neither sticks is the
//! operation reported as failed.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::aggregation::AggregatedEmployeeRecord;
use crate::clock::Clock;
use crate::error::{LedgerError, OperationResult};
use crate::local_store::{keys, LocalStorage};
use crate::reconciler::{QueryCache, ReconciledStore};
use crate::records::{
    generate_id, AttendanceRecord, LedgerRecord, SettlementRecord, ValidationError, AUDITED,
};
use crate::remote::{ImageStorage, RemoteRecordStore, RowMatch, ATTENDANCE_TABLE, SETTLEMENT_TABLE};
use crate::sync_queue::{
    diff_images, image_delete_payloads, ImageDiff, ImageUploadPayload, MutationKind, SyncQueueSink,
};

/// Per-kind details the service needs beyond [`LedgerRecord`].
pub trait ManagedRecord: LedgerRecord {
    const TABLE: &'static str;
    const ID_PREFIX: &'static str;

    fn shadow_key(identity: &str) -> String;
    fn images_mut(&mut self) -> &mut Vec<String>;
    /// Marks a record that so far only exists on this device.
    fn mark_pending(&mut self, _pending: bool) {}
    /// Keeps fields an update must never roll back.
    fn carry_forward(&mut self, _previous: &Self) {}
}

impl ManagedRecord for AttendanceRecord {
    const TABLE: &'static str = ATTENDANCE_TABLE;
    const ID_PREFIX: &'static str = "att";

    fn shadow_key(identity: &str) -> String {
        keys::attendance_shadow(identity)
    }

    fn images_mut(&mut self) -> &mut Vec<String> {
        &mut self.image_ids
    }

    fn mark_pending(&mut self, pending: bool) {
        self.is_local = pending.then_some(true);
    }
}

impl ManagedRecord for SettlementRecord {
    const TABLE: &'static str = SETTLEMENT_TABLE;
    const ID_PREFIX: &'static str = "stl";

    fn shadow_key(identity: &str) -> String {
        keys::settlement_shadow(identity)
    }

    fn images_mut(&mut self) -> &mut Vec<String> {
        &mut self.image_ids
    }

    fn carry_forward(&mut self, previous: &Self) {
        if previous.is_audited() && !self.is_audited() {
            debug!(
                "Keeping audit status of settlement {} on update",
                self.settlement_id
            );
            self.audit_status = previous.audit_status.clone();
        }
    }
}

/// A new attachment supplied with a save or update.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

/// Collaborators shared by both record services.
#[derive(Clone)]
pub struct ServiceContext {
    pub remote: Arc<dyn RemoteRecordStore>,
    pub images: Arc<dyn ImageStorage>,
    pub storage: Arc<dyn LocalStorage>,
    pub queue: Arc<dyn SyncQueueSink>,
    pub cache: Arc<QueryCache<Vec<AggregatedEmployeeRecord>>>,
    pub clock: Arc<dyn Clock>,
}

pub struct RecordService<T: ManagedRecord> {
    ctx: ServiceContext,
    store: Arc<ReconciledStore<T>>,
    bucket: String,
}

impl<T: ManagedRecord> RecordService<T> {
    pub fn new(ctx: ServiceContext, store: Arc<ReconciledStore<T>>, bucket: &str) -> Self {
        Self {
            ctx,
            store,
            bucket: bucket.to_string(),
        }
    }

    pub fn store(&self) -> &Arc<ReconciledStore<T>> {
        &self.store
    }

    fn now(&self) -> DateTime<Utc> {
        self.ctx.clock.now()
    }

    /// Builds a record from client input, filling identity and timestamps.
    pub fn prepare_new(&self, input: Value) -> Result<T, LedgerError> {
        let Value::Object(mut fields) = input else {
            return Err(ValidationError::InvalidValue {
                field: "body".to_string(),
                value: "expected a JSON object".to_string(),
            }
            .into());
        };
        let now = self.now();
        let has_identity = fields
            .get(T::IDENTITY_FIELD)
            .and_then(Value::as_str)
            .map_or(false, |id| !id.trim().is_empty());
        if !has_identity {
            fields.insert(
                T::IDENTITY_FIELD.to_string(),
                Value::String(generate_id(T::ID_PREFIX, now)),
            );
        }
        if !fields.contains_key("created_at") {
            fields.insert("created_at".to_string(), serde_json::to_value(now)?);
        }
        fields.insert("updated_at".to_string(), serde_json::to_value(now)?);
        Ok(serde_json::from_value(Value::Object(fields))?)
    }

    fn apply_patch(&self, previous: &T, patch: Value) -> Result<T, LedgerError> {
        let Value::Object(patch) = patch else {
            return Err(ValidationError::InvalidValue {
                field: "body".to_string(),
                value: "expected a JSON object".to_string(),
            }
            .into());
        };
        let mut fields = match serde_json::to_value(previous)? {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        for (key, value) in patch {
            if key == T::IDENTITY_FIELD || key == "created_at" {
                continue;
            }
            fields.insert(key, value);
        }
        fields.insert("updated_at".to_string(), serde_json::to_value(self.now())?);
        Ok(serde_json::from_value(Value::Object(fields))?)
    }

    // --- Side effects shared by all writes ---

    fn write_shadow(&self, record: &T) {
        let key = T::shadow_key(record.identity());
        match serde_json::to_string(record) {
            Ok(raw) => {
                if let Err(e) = self.ctx.storage.set_item(&key, &raw) {
                    warn!("Failed to write shadow entry {}: {}", key, e);
                }
            }
            Err(e) => warn!("Failed to encode shadow entry {}: {}", key, e),
        }
    }

    /// Mirrors a synced record into the cache and retires queued writes it
    /// replaces, so an older pending edit cannot shadow it.
    fn cache_synced(&self, record: &T) {
        if let Err(e) = self
            .ctx
            .queue
            .supersede_record_writes(record.identity(), T::CATEGORY)
        {
            warn!(
                "Pending writes of {} could not be retired and may shadow the synced state: {}",
                record.identity(),
                e
            );
        }
        if let Err(e) = self.store.upsert_local(record) {
            warn!(
                "Record {} reached the remote store but not the local cache: {}",
                record.identity(),
                e
            );
        }
    }

    fn after_write(&self, record: &T) {
        self.write_shadow(record);
        self.ctx
            .cache
            .invalidate_for(record.project_id(), record.record_date());
    }

    /// Local cache first, then the queue. Fails only when both fail.
    fn persist_offline(&self, record: &T, kind: MutationKind) -> Result<(), LedgerError> {
        let local = self.store.upsert_local(record);
        if let Err(e) = &local {
            error!(
                "Local cache write failed for {:?} {}, relying on the sync queue: {}",
                T::CATEGORY,
                record.identity(),
                e
            );
        }
        let queued = serde_json::to_value(record)
            .map_err(LedgerError::from)
            .and_then(|payload| {
                self.ctx
                    .queue
                    .add_to_sync_queue(kind, payload, record.identity(), T::CATEGORY)
                    .map_err(LedgerError::from)
            });
        if let Err(e) = &queued {
            error!(
                "Sync queue append failed for {:?} {}: {}",
                T::CATEGORY,
                record.identity(),
                e
            );
        }
        match (local, queued) {
            (Err(local), Err(queue)) => Err(LedgerError::Unpersisted {
                local: local.to_string(),
                queue: queue.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Uploads new attachments and appends their URLs. A failed upload still
    /// yields the deterministic URL and queues the bytes for replay.
    async fn attach_uploads(&self, record: &mut T, uploads: Vec<ImageUpload>) {
        let stamp = self.now().timestamp_millis();
        for (index, upload) in uploads.into_iter().enumerate() {
            let path = format!(
                "{}/{}_{}_{}",
                record.project_id(),
                stamp,
                index,
                upload.file_name.replace('/', "_")
            );
            let url = match self
                .ctx
                .images
                .upload(&self.bucket, &path, upload.bytes.clone(), &upload.content_type)
                .await
            {
                Ok(url) => url,
                Err(e) => {
                    warn!("Image upload {} failed, queueing it: {}", path, e);
                    let url = self.ctx.images.public_url(&self.bucket, &path);
                    let payload = ImageUploadPayload {
                        bucket: self.bucket.clone(),
                        path: path.clone(),
                        content_type: upload.content_type.clone(),
                        data_base64: BASE64_STANDARD.encode(&upload.bytes),
                        url: url.clone(),
                    };
                    let queued = serde_json::to_value(&payload)
                        .map_err(LedgerError::from)
                        .and_then(|payload| {
                            self.ctx
                                .queue
                                .add_to_sync_queue(
                                    MutationKind::UploadImage,
                                    payload,
                                    record.identity(),
                                    T::CATEGORY,
                                )
                                .map_err(LedgerError::from)
                        });
                    if let Err(e) = queued {
                        error!("Image {} could not be queued and will be missing: {}", path, e);
                    }
                    url
                }
            };
            record.images_mut().push(url);
        }
    }

    /// One queue entry per removed image, kept even when the remote is reachable.
    fn queue_image_deletes(&self, identity: &str, removed: &[String]) -> usize {
        let mut queued = 0;
        for payload in image_delete_payloads(removed, &self.bucket) {
            let result = serde_json::to_value(&payload)
                .map_err(LedgerError::from)
                .and_then(|value| {
                    self.ctx
                        .queue
                        .add_to_sync_queue(MutationKind::DeleteImage, value, identity, T::CATEGORY)
                        .map_err(LedgerError::from)
                });
            match result {
                Ok(()) => queued += 1,
                Err(e) => error!("Failed to queue delete of image {}: {}", payload.url, e),
            }
        }
        queued
    }

    // --- Operations ---

    pub async fn save(&self, record: T, uploads: Vec<ImageUpload>) -> OperationResult<T> {
        let identity = record.identity().to_string();
        match self.try_save(record, uploads).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Saving {:?} {} failed: {}", T::CATEGORY, identity, e);
                OperationResult::failed(e)
            }
        }
    }

    async fn try_save(
        &self,
        mut record: T,
        uploads: Vec<ImageUpload>,
    ) -> Result<OperationResult<T>, LedgerError> {
        record.validate()?;
        self.attach_uploads(&mut record, uploads).await;

        let row = serde_json::to_value(&record)?;
        match self.ctx.remote.insert(T::TABLE, row).await {
            Ok(_) => {
                record.mark_pending(false);
                self.cache_synced(&record);
                self.after_write(&record);
                info!("Saved {:?} {}", T::CATEGORY, record.identity());
                Ok(OperationResult::synced(record))
            }
            Err(e) => {
                warn!(
                    "Remote insert of {:?} {} failed, saving locally: {}",
                    T::CATEGORY,
                    record.identity(),
                    e
                );
                record.mark_pending(true);
                self.persist_offline(&record, MutationKind::SaveRecord)?;
                self.after_write(&record);
                Ok(OperationResult::local(record))
            }
        }
    }

    pub async fn update(
        &self,
        identity: &str,
        patch: Value,
        uploads: Vec<ImageUpload>,
    ) -> OperationResult<T> {
        match self.try_update(identity, patch, uploads).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Updating {:?} {} failed: {}", T::CATEGORY, identity, e);
                OperationResult::failed(e)
            }
        }
    }

    async fn try_update(
        &self,
        identity: &str,
        patch: Value,
        uploads: Vec<ImageUpload>,
    ) -> Result<OperationResult<T>, LedgerError> {
        let previous = self
            .store
            .find(identity)
            .ok_or_else(|| LedgerError::NotFound(identity.to_string()))?;
        let mut updated = self.apply_patch(&previous, patch)?;
        updated.carry_forward(&previous);
        updated.validate()?;
        self.attach_uploads(&mut updated, uploads).await;

        let diff: ImageDiff = diff_images(previous.image_ids(), updated.image_ids());
        let row = serde_json::to_value(&updated)?;
        let matcher = RowMatch::new(T::IDENTITY_FIELD, identity);
        let synced = match self.ctx.remote.update(T::TABLE, &matcher, row).await {
            Ok(rows) if !rows.is_empty() => true,
            Ok(_) => {
                warn!(
                    "Remote has no {:?} {} yet, keeping the update locally",
                    T::CATEGORY,
                    identity
                );
                false
            }
            Err(e) => {
                warn!(
                    "Remote update of {:?} {} failed, saving locally: {}",
                    T::CATEGORY,
                    identity,
                    e
                );
                false
            }
        };

        if synced {
            updated.mark_pending(false);
            self.cache_synced(&updated);
        } else {
            updated.mark_pending(true);
            self.persist_offline(&updated, MutationKind::UpdateRecord)?;
        }

        if diff.changed {
            let queued = self.queue_image_deletes(identity, &diff.removed);
            debug!(
                "Image list of {} changed: {} removed, {} added, {} deletes queued",
                identity,
                diff.removed.len(),
                diff.added.len(),
                queued
            );
        }

        if previous.project_id() != updated.project_id()
            || previous.record_date() != updated.record_date()
        {
            self.ctx
                .cache
                .invalidate_for(previous.project_id(), previous.record_date());
        }
        self.after_write(&updated);

        Ok(if synced {
            OperationResult::synced(updated)
        } else {
            OperationResult::local(updated)
        })
    }

    pub async fn delete(&self, identity: &str) -> OperationResult<String> {
        match self.try_delete(identity).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Deleting {:?} {} failed: {}", T::CATEGORY, identity, e);
                OperationResult::failed(e)
            }
        }
    }

    async fn try_delete(&self, identity: &str) -> Result<OperationResult<String>, LedgerError> {
        let previous = self
            .store
            .find(identity)
            .ok_or_else(|| LedgerError::NotFound(identity.to_string()))?;

        let matcher = RowMatch::new(T::IDENTITY_FIELD, identity);
        let remote_result = self.ctx.remote.delete(T::TABLE, &matcher).await;
        if let Err(e) = &remote_result {
            warn!(
                "Remote delete of {:?} {} failed, relying on the sync queue: {}",
                T::CATEGORY,
                identity,
                e
            );
        }

        // The queued delete also hides the record from any stale cache copy.
        let mut payload = Map::new();
        payload.insert(
            T::IDENTITY_FIELD.to_string(),
            Value::String(identity.to_string()),
        );
        let queued = self.ctx.queue.add_to_sync_queue(
            MutationKind::DeleteRecord,
            Value::Object(payload),
            identity,
            T::CATEGORY,
        );

        let local = self.store.remove_local(identity);
        if let Err(e) = &local {
            error!("Failed to remove {} from the local caches: {}", identity, e);
        }
        if let Err(e) = self.ctx.storage.remove_item(&T::shadow_key(identity)) {
            warn!("Failed to remove shadow entry of {}: {}", identity, e);
        }
        self.queue_image_deletes(identity, previous.image_ids());
        self.ctx
            .cache
            .invalidate_for(previous.project_id(), previous.record_date());

        match (remote_result, queued) {
            (Ok(()), Ok(())) => Ok(OperationResult::synced(identity.to_string())),
            (Ok(()), Err(e)) => {
                warn!("Deleted {} remotely but could not queue the delete: {}", identity, e);
                Ok(OperationResult::synced(identity.to_string()))
            }
            (Err(_), Ok(())) => Ok(OperationResult::local(identity.to_string())),
            (Err(_), Err(queue)) => Err(LedgerError::Unpersisted {
                local: match local {
                    Ok(count) => format!("removed {} cached copies", count),
                    Err(e) => e.to_string(),
                },
                queue: queue.to_string(),
            }),
        }
    }
}

impl RecordService<SettlementRecord> {
    /// Sets the audit flag. Once set, later updates never clear it.
    pub async fn mark_audited(&self, settlement_id: &str) -> OperationResult<SettlementRecord> {
        let mut patch = Map::new();
        patch.insert(
            "audit_status".to_string(),
            Value::String(AUDITED.to_string()),
        );
        self.update(settlement_id, Value::Object(patch), Vec::new())
            .await
    }
}
