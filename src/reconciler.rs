// src/reconciler.rs
//! Merges the redundant local caches of one record kind into a single list.
//!
//! Sources are listed lowest trust first. A later source always overwrites an
//! earlier one for the same identity, whatever the wall-clock write times were,
//! and the pending sync queue is applied last so unsynced writes are visible.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::aggregation::{DateFilter, TypeFilter};
use crate::clock::Clock;
use crate::local_store::{write_json, LocalStorage, StorageError};
use crate::records::LedgerRecord;
use crate::sync_queue::{LocalSyncQueue, MutationKind};

pub struct ReconciledStore<T: LedgerRecord> {
    storage: Arc<dyn LocalStorage>,
    queue: Arc<LocalSyncQueue>,
    sources: Vec<String>,
    _record: PhantomData<fn() -> T>,
}

/// Identity-keyed rows in first-seen order.
#[derive(Default)]
struct MergedRows {
    order: Vec<String>,
    rows: HashMap<String, Value>,
}

impl MergedRows {
    fn overwrite(&mut self, identity: String, row: Value) {
        if !self.rows.contains_key(&identity) {
            self.order.push(identity.clone());
        }
        self.rows.insert(identity, row);
    }

    fn patch(&mut self, identity: String, patch: Value) {
        if let (Some(Value::Object(existing)), Value::Object(fields)) =
            (self.rows.get_mut(&identity), &patch)
        {
            merge_fields(existing, fields);
            return;
        }
        self.overwrite(identity, patch);
    }

    fn remove(&mut self, identity: &str) {
        self.rows.remove(identity);
    }

    fn into_records<T: LedgerRecord>(mut self) -> Vec<T> {
        let mut records = Vec::with_capacity(self.rows.len());
        for identity in self.order {
            // Removed-then-readded identities appear twice in `order`.
            let Some(row) = self.rows.remove(&identity) else {
                continue;
            };
            match serde_json::from_value::<T>(row) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping {:?} row {} that does not match the record shape: {}",
                    T::CATEGORY,
                    identity,
                    e
                ),
            }
        }
        records
    }
}

fn identity_of<T: LedgerRecord>(row: &Value) -> Option<String> {
    match row.get(T::IDENTITY_FIELD)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl<T: LedgerRecord> ReconciledStore<T> {
    pub fn new(
        storage: Arc<dyn LocalStorage>,
        queue: Arc<LocalSyncQueue>,
        sources: Vec<String>,
    ) -> Self {
        Self {
            storage,
            queue,
            sources,
            _record: PhantomData,
        }
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Reads one source leniently. Lists are taken as-is, date-keyed maps of
    /// lists are flattened, anything else is logged and skipped.
    fn read_source(&self, key: &str) -> Vec<Value> {
        let raw = match self.storage.get_item(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("Failed to read local source '{}', skipping it: {}", key, e);
                return Vec::new();
            }
        };
        let parsed: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("Local source '{}' is not valid JSON, skipping it: {}", key, e);
                return Vec::new();
            }
        };
        match parsed {
            Value::Array(rows) => rows,
            Value::Object(groups) => groups
                .into_iter()
                .flat_map(|(date, group)| match group {
                    Value::Array(rows) => rows,
                    _ => {
                        warn!("Local source '{}' group '{}' is not a list, skipping it", key, date);
                        Vec::new()
                    }
                })
                .collect(),
            other => {
                warn!(
                    "Local source '{}' holds neither a list nor a date map ({}), skipping it",
                    key,
                    json_kind(&other)
                );
                Vec::new()
            }
        }
    }

    /// Every record known locally. Never fails: unreadable sources are skipped.
    pub fn load_all(&self) -> Vec<T> {
        let mut merged = MergedRows::default();
        for source in &self.sources {
            for row in self.read_source(source) {
                match identity_of::<T>(&row) {
                    Some(identity) => merged.overwrite(identity, row),
                    None => warn!(
                        "Row in '{}' has no {}, skipping it",
                        source,
                        T::IDENTITY_FIELD
                    ),
                }
            }
        }

        for entry in self.queue.entries_for(T::CATEGORY) {
            match entry.kind {
                MutationKind::SaveRecord => merged.overwrite(entry.identity, entry.payload),
                MutationKind::UpdateRecord => merged.patch(entry.identity, entry.payload),
                MutationKind::DeleteRecord => merged.remove(&entry.identity),
                MutationKind::UploadImage | MutationKind::DeleteImage => {}
            }
        }

        let records = merged.into_records::<T>();
        debug!("Reconciled {} {:?} records", records.len(), T::CATEGORY);
        records
    }

    pub fn load_scope(&self, project_id: &str, date_filter: &DateFilter) -> Vec<T> {
        self.load_all()
            .into_iter()
            .filter(|record| {
                record.project_id() == project_id && date_filter.contains(record.record_date())
            })
            .collect()
    }

    /// Lookup by identity. Always reads through, so edit flows see records
    /// outside any cached query scope.
    pub fn find(&self, identity: &str) -> Option<T> {
        self.load_all()
            .into_iter()
            .find(|record| record.identity() == identity)
    }

    /// Writes the record into the most trusted source. A date-keyed source is
    /// rewritten as a flat list.
    pub fn upsert_local(&self, record: &T) -> Result<(), StorageError> {
        let Some(target) = self.sources.last() else {
            return Ok(());
        };
        let mut rows = self.read_source(target);
        rows.retain(|row| identity_of::<T>(row).as_deref() != Some(record.identity()));
        rows.push(serde_json::to_value(record)?);
        write_json(self.storage.as_ref(), target, &rows)?;
        debug!("Cached {:?} {} in '{}'", T::CATEGORY, record.identity(), target);
        Ok(())
    }

    /// Removes the identity from every source. Keeps going after a failing
    /// source and reports the first error.
    pub fn remove_local(&self, identity: &str) -> Result<usize, StorageError> {
        let mut removed = 0;
        let mut first_error = None;
        for source in &self.sources {
            let mut rows = self.read_source(source);
            let before = rows.len();
            rows.retain(|row| identity_of::<T>(row).as_deref() != Some(identity));
            if rows.len() == before {
                continue;
            }
            match write_json(self.storage.as_ref(), source, &rows) {
                Ok(()) => removed += before - rows.len(),
                Err(e) => {
                    warn!("Failed to remove {} from '{}': {}", identity, source, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// --- Short-lived query results ---

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub project_id: String,
    pub date: DateFilter,
    pub record_type: TypeFilter,
}

impl QueryKey {
    pub fn new(project_id: &str, date: DateFilter, record_type: TypeFilter) -> Self {
        Self {
            project_id: project_id.to_string(),
            date,
            record_type,
        }
    }
}

/// TTL cache of query results. Writers must invalidate the scope they touch.
pub struct QueryCache<V: Clone> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState<V>>,
}

struct CacheState<V> {
    /// Bumped by every invalidation; a result computed across a bump is stale.
    generation: u64,
    entries: HashMap<QueryKey, (DateTime<Utc>, V)>,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            state: Mutex::new(CacheState {
                generation: 0,
                entries: HashMap::new(),
            }),
        }
    }

    pub fn get(&self, key: &QueryKey) -> Option<V> {
        let now = self.clock.now();
        let mut state = self.state.lock().ok()?;
        match state.entries.get(key) {
            Some((stored_at, value)) if now - *stored_at < self.ttl => {
                debug!("Query cache hit for {:?}", key);
                Some(value.clone())
            }
            Some(_) => {
                state.entries.remove(key);
                debug!("Query cache entry expired for {:?}", key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: QueryKey, value: V) {
        let now = self.clock.now();
        match self.state.lock() {
            Ok(mut state) => {
                state.entries.insert(key, (now, value));
            }
            Err(e) => warn!("Query cache lock poisoned, result not cached: {}", e),
        }
    }

    fn generation(&self) -> Option<u64> {
        self.state.lock().ok().map(|state| state.generation)
    }

    /// Cached value unless `bypass` is set; bypassed results are not stored.
    /// A result is only stored when no invalidation ran while it was computed.
    pub fn get_or_compute<F: FnOnce() -> V>(&self, key: QueryKey, bypass: bool, compute: F) -> V {
        if bypass {
            return compute();
        }
        if let Some(value) = self.get(&key) {
            return value;
        }
        let started = self.generation();
        let value = compute();
        let now = self.clock.now();
        match self.state.lock() {
            Ok(mut state) if started == Some(state.generation) => {
                state.entries.insert(key, (now, value.clone()));
            }
            Ok(_) => debug!(
                "Cache invalidated while computing {:?}, result not stored",
                key
            ),
            Err(e) => warn!("Query cache lock poisoned, result not cached: {}", e),
        }
        value
    }

    /// Drops every entry of the project whose date scope covers `date`.
    pub fn invalidate_for(&self, project_id: &str, date: NaiveDate) {
        if let Ok(mut state) = self.state.lock() {
            state.generation += 1;
            let before = state.entries.len();
            state
                .entries
                .retain(|key, _| !(key.project_id == project_id && key.date.contains(date)));
            let dropped = before - state.entries.len();
            if dropped > 0 {
                info!(
                    "Invalidated {} cached queries for project {} on {}",
                    dropped, project_id, date
                );
            }
        }
    }

    pub fn invalidate_project(&self, project_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.generation += 1;
            state.entries.retain(|key, _| key.project_id != project_id);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.generation += 1;
            state.entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shallow field merge used when folding a queued patch into a full row.
fn merge_fields(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        base.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::local_store::{keys, MemoryStorage};
    use crate::records::{RecordCategory, SettlementRecord};
    use crate::sync_queue::SyncQueueSink;
    use serde_json::json;

    fn settlement_row(id: &str, amount: &str, date: &str) -> Value {
        json!({
            "settlement_id": id,
            "project_id": "p1",
            "employee_id": "e1",
            "record_date": date,
            "record_type": "借支",
            "amount": amount,
            "created_at": "2024-05-01T08:00:00Z",
            "updated_at": "2024-05-01T08:00:00Z"
        })
    }

    fn setup() -> (
        ReconciledStore<SettlementRecord>,
        Arc<MemoryStorage>,
        Arc<LocalSyncQueue>,
    ) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new("2024-05-01 09:00:00"));
        let queue = Arc::new(LocalSyncQueue::new(storage.clone(), clock));
        let store = ReconciledStore::new(storage.clone(), queue.clone(), keys::settlement_sources());
        (store, storage, queue)
    }

    fn put(storage: &MemoryStorage, key: &str, value: Value) {
        storage.set_item(key, &value.to_string()).unwrap();
    }

    #[test]
    fn test_higher_priority_source_wins_regardless_of_write_order() {
        let (store, storage, _) = setup();
        // Most trusted store written first, least trusted last.
        put(&storage, keys::SETTLEMENT_RECORDS, json!([settlement_row("s1", "300", "2024-05-01")]));
        put(&storage, keys::SETTLEMENT_RECORDS_CACHE, json!([settlement_row("s1", "200", "2024-05-01")]));
        put(&storage, keys::OFFLINE_SETTLEMENT_RECORDS, json!([settlement_row("s1", "100", "2024-05-01")]));

        let records = store.load_all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount.to_string(), "300");
    }

    #[test]
    fn test_date_keyed_source_is_flattened() {
        let (store, storage, _) = setup();
        put(
            &storage,
            keys::SETTLEMENT_RECORDS_CACHE,
            json!({
                "2024-05-01": [settlement_row("s1", "100", "2024-05-01")],
                "2024-05-02": [settlement_row("s2", "50", "2024-05-02"), settlement_row("s3", "20", "2024-05-02")]
            }),
        );
        assert_eq!(store.load_all().len(), 3);
    }

    #[test]
    fn test_anomalous_source_is_skipped() {
        let (store, storage, _) = setup();
        put(&storage, keys::OFFLINE_SETTLEMENT_RECORDS, json!(42));
        storage.set_item(keys::SETTLEMENT_RECORDS_CACHE, "{not json").unwrap();
        put(&storage, keys::SETTLEMENT_RECORDS, json!([settlement_row("s1", "100", "2024-05-01"), {"foo": 1}]));

        let records = store.load_all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].settlement_id, "s1");
    }

    #[test]
    fn test_queued_save_and_delete_are_reflected() {
        let (store, storage, queue) = setup();
        put(&storage, keys::SETTLEMENT_RECORDS, json!([settlement_row("s1", "100", "2024-05-01")]));
        queue
            .add_to_sync_queue(
                MutationKind::SaveRecord,
                settlement_row("s2", "70", "2024-05-03"),
                "s2",
                RecordCategory::Settlement,
            )
            .unwrap();
        queue
            .add_to_sync_queue(
                MutationKind::DeleteRecord,
                json!({"settlement_id": "s1"}),
                "s1",
                RecordCategory::Settlement,
            )
            .unwrap();

        let ids: Vec<String> = store.load_all().into_iter().map(|r| r.settlement_id).collect();
        assert_eq!(ids, vec!["s2".to_string()]);
    }

    #[test]
    fn test_queued_update_patches_cached_row() {
        let (store, storage, queue) = setup();
        put(&storage, keys::SETTLEMENT_RECORDS, json!([settlement_row("s1", "100", "2024-05-01")]));
        queue
            .add_to_sync_queue(
                MutationKind::UpdateRecord,
                json!({"settlement_id": "s1", "amount": "150"}),
                "s1",
                RecordCategory::Settlement,
            )
            .unwrap();

        let record = store.find("s1").unwrap();
        assert_eq!(record.amount.to_string(), "150");
        assert_eq!(record.project_id, "p1");
    }

    #[test]
    fn test_upsert_and_remove_local() {
        let (store, storage, _) = setup();
        put(&storage, keys::OFFLINE_SETTLEMENT_RECORDS, json!([settlement_row("s1", "100", "2024-05-01")]));

        let mut record = store.find("s1").unwrap();
        record.amount = rust_decimal_macros::dec!(999);
        store.upsert_local(&record).unwrap();
        assert_eq!(store.find("s1").unwrap().amount, rust_decimal_macros::dec!(999));

        assert_eq!(store.remove_local("s1").unwrap(), 2);
        assert!(store.load_all().is_empty());
    }

    #[test]
    fn test_load_scope_filters_project_and_date() {
        let (store, storage, _) = setup();
        let mut other_project = settlement_row("s3", "1", "2024-05-01");
        other_project["project_id"] = json!("p2");
        put(
            &storage,
            keys::SETTLEMENT_RECORDS,
            json!([
                settlement_row("s1", "100", "2024-05-01"),
                settlement_row("s2", "100", "2024-05-09"),
                other_project
            ]),
        );
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let scoped = store.load_scope("p1", &DateFilter::Day(day));
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].settlement_id, "s1");
        assert_eq!(store.load_scope("p1", &DateFilter::All).len(), 2);
    }

    #[test]
    fn test_query_cache_expires_and_invalidates_by_scope() {
        let clock = Arc::new(ManualClock::new("2024-05-01 09:00:00"));
        let cache: QueryCache<u32> = QueryCache::new(Duration::milliseconds(5000), clock.clone());
        let may = QueryKey::new(
            "p1",
            DateFilter::Range {
                from: NaiveDate::from_ymd_opt(2024, 5, 1),
                to: NaiveDate::from_ymd_opt(2024, 5, 31),
            },
            TypeFilter::All,
        );
        let june = QueryKey::new(
            "p1",
            DateFilter::Day(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()),
            TypeFilter::All,
        );
        cache.put(may.clone(), 1);
        cache.put(june.clone(), 2);

        cache.invalidate_for("p1", NaiveDate::from_ymd_opt(2024, 5, 10).unwrap());
        assert_eq!(cache.get(&may), None);
        assert_eq!(cache.get(&june), Some(2));

        clock.advance(Duration::seconds(6));
        assert_eq!(cache.get(&june), None);
    }

    #[test]
    fn test_query_cache_bypass_does_not_store() {
        let clock = Arc::new(ManualClock::new("2024-05-01 09:00:00"));
        let cache: QueryCache<u32> = QueryCache::new(Duration::milliseconds(5000), clock);
        let key = QueryKey::new("p1", DateFilter::All, TypeFilter::All);
        assert_eq!(cache.get_or_compute(key.clone(), true, || 7), 7);
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_compute(key.clone(), false, || 8), 8);
        assert_eq!(cache.get_or_compute(key, false, || 9), 8);
    }

    #[test]
    fn test_query_cache_drops_result_computed_across_invalidation() {
        let clock = Arc::new(ManualClock::new("2024-05-01 09:00:00"));
        let cache: Arc<QueryCache<u32>> =
            Arc::new(QueryCache::new(Duration::milliseconds(5000), clock));
        let key = QueryKey::new("p1", DateFilter::All, TypeFilter::All);

        let writer = cache.clone();
        let value = cache.get_or_compute(key.clone(), false, || {
            writer.invalidate_for("p1", NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
            1
        });
        assert_eq!(value, 1);
        assert_eq!(cache.get(&key), None);

        // Without a concurrent write the next result is stored as usual.
        assert_eq!(cache.get_or_compute(key.clone(), false, || 2), 2);
        assert_eq!(cache.get(&key), Some(2));
    }
}
