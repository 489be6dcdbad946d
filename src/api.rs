// src/api.rs
//! JSON HTTP surface over the ledger views and record operations.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use bytes::Bytes;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::aggregation::{AggregatedEmployeeRecord, AggregationEngine, AggregationFilters, DateFilter, TypeFilter};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::directory::{EmployeeIndex, ProjectCache};
use crate::error::{LedgerError, OperationResult};
use crate::export::{worker_csv_string, ExportError};
use crate::local_store::{keys, LocalStorage};
use crate::reconciler::{QueryCache, ReconciledStore};
use crate::record_service::{ImageUpload, ManagedRecord, RecordService, ServiceContext};
use crate::records::{AttendanceRecord, Category, LedgerRecord, SettlementRecord};
use crate::remote::{ImageStorage, RemoteRecordStore, DEFAULT_IMAGE_BUCKET, DEFAULT_SETTLEMENT_IMAGE_BUCKET};
use crate::status::{EmployeeStatusManager, LocalEmployeeStatusManager, SettlementGate, StatusChange};
use crate::sync_queue::LocalSyncQueue;
use crate::trigger::AggregationTrigger;
use crate::views::{flow_view, total_view, unsettled_view, worker_view};

// --- Errors ---

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Export failed: {0}")]
    Export(#[from] ExportError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Ledger(LedgerError::Validation(_) | LedgerError::Json(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Ledger(LedgerError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Ledger(_) | ApiError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            debug!("Request rejected: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

// --- State ---

/// Knobs needed to assemble the ledger, independent of how they were loaded.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub user_id: String,
    pub image_bucket: String,
    pub settlement_image_bucket: String,
    pub query_cache_ttl: chrono::Duration,
    pub debounce: std::time::Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            user_id: "local".to_string(),
            image_bucket: DEFAULT_IMAGE_BUCKET.to_string(),
            settlement_image_bucket: DEFAULT_SETTLEMENT_IMAGE_BUCKET.to_string(),
            query_cache_ttl: chrono::Duration::milliseconds(5000),
            debounce: std::time::Duration::from_millis(300),
        }
    }
}

impl From<&AppConfig> for LedgerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            user_id: config.user_id.clone(),
            image_bucket: config.image_bucket.clone(),
            settlement_image_bucket: config.settlement_image_bucket.clone(),
            query_cache_ttl: config.query_cache_ttl(),
            debounce: config.debounce(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AggregationEngine>,
    pub employees: Arc<EmployeeIndex>,
    pub projects: Arc<ProjectCache>,
    pub attendance: Arc<RecordService<AttendanceRecord>>,
    pub settlements: Arc<RecordService<SettlementRecord>>,
    pub gate: Arc<SettlementGate>,
    pub queue: Arc<LocalSyncQueue>,
    pub trigger: AggregationTrigger,
}

impl AppState {
    /// Wires every component over one local storage and one remote backend.
    pub fn build(
        storage: Arc<dyn LocalStorage>,
        remote: Arc<dyn RemoteRecordStore>,
        images: Arc<dyn ImageStorage>,
        clock: Arc<dyn Clock>,
        settings: &LedgerSettings,
    ) -> Self {
        let employees = Arc::new(EmployeeIndex::new(storage.clone()));
        let manager: Arc<dyn EmployeeStatusManager> =
            Arc::new(LocalEmployeeStatusManager::new(employees.clone()));
        Self::build_with_manager(storage, remote, images, clock, settings, employees, manager)
    }

    pub fn build_with_manager(
        storage: Arc<dyn LocalStorage>,
        remote: Arc<dyn RemoteRecordStore>,
        images: Arc<dyn ImageStorage>,
        clock: Arc<dyn Clock>,
        settings: &LedgerSettings,
        employees: Arc<EmployeeIndex>,
        manager: Arc<dyn EmployeeStatusManager>,
    ) -> Self {
        let queue = Arc::new(LocalSyncQueue::new(storage.clone(), clock.clone()));
        let cache = Arc::new(QueryCache::new(settings.query_cache_ttl, clock.clone()));
        let projects = Arc::new(ProjectCache::new(storage.clone(), &settings.user_id));

        let attendance_store = Arc::new(ReconciledStore::new(
            storage.clone(),
            queue.clone(),
            keys::attendance_sources(&settings.user_id),
        ));
        let settlement_store = Arc::new(ReconciledStore::new(
            storage.clone(),
            queue.clone(),
            keys::settlement_sources(),
        ));

        let ctx = ServiceContext {
            remote,
            images,
            storage,
            queue: queue.clone(),
            cache: cache.clone(),
            clock,
        };
        let attendance = Arc::new(RecordService::new(
            ctx.clone(),
            attendance_store.clone(),
            &settings.image_bucket,
        ));
        let settlements = Arc::new(RecordService::new(
            ctx,
            settlement_store.clone(),
            &settings.settlement_image_bucket,
        ));

        let engine = Arc::new(AggregationEngine::new(
            attendance_store,
            settlement_store,
            employees.clone(),
            projects.clone(),
            cache,
        ));
        let gate = Arc::new(SettlementGate::new(manager, engine.clone(), employees.clone()));

        Self {
            engine,
            employees,
            projects,
            attendance,
            settlements,
            gate,
            queue,
            trigger: AggregationTrigger::new(settings.debounce),
        }
    }

    /// Re-aggregates a project in the background once writes quiet down.
    fn schedule_refresh(&self, project_id: &str) {
        let engine = self.engine.clone();
        let filters = AggregationFilters::project(project_id);
        let _ = self.trigger.trigger(move || {
            let rows = engine.aggregate(&filters);
            debug!("Refreshed {} ledger rows for {}", rows.len(), filters.project_id);
            rows.len()
        });
    }
}

// --- Requests ---

#[derive(Debug, Default, Deserialize)]
pub struct ViewQuery {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
    #[serde(default, rename = "type")]
    pub record_type: Option<String>,
    /// Bypasses the query cache while a record is being edited.
    #[serde(default)]
    pub edit: bool,
}

impl ViewQuery {
    fn filters(&self, project_id: &str) -> Result<AggregationFilters, ApiError> {
        let record_type = match self.record_type.as_deref().map(str::trim) {
            None | Some("") | Some("all") => TypeFilter::All,
            Some(value) => TypeFilter::Only(
                Category::parse(value)
                    .ok_or_else(|| ApiError::BadRequest(format!("Unknown record type '{}'", value)))?,
            ),
        };
        Ok(AggregationFilters {
            project_id: project_id.to_string(),
            date: DateFilter::from_parts(self.date, self.from, self.to),
            record_type,
        })
    }
}

fn default_content_type() -> String {
    "image/jpeg".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ImageInput {
    pub file_name: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub data_base64: String,
}

/// Record fields plus any new attachments.
#[derive(Debug, Deserialize)]
pub struct RecordInput {
    #[serde(default)]
    pub images: Vec<ImageInput>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RecordInput {
    fn into_parts(self) -> Result<(Value, Vec<ImageUpload>), ApiError> {
        let uploads = self
            .images
            .into_iter()
            .map(|image| {
                let bytes = BASE64_STANDARD.decode(image.data_base64.trim()).map_err(|e| {
                    ApiError::BadRequest(format!("Image {} is not valid base64: {}", image.file_name, e))
                })?;
                Ok(ImageUpload {
                    file_name: image.file_name,
                    content_type: image.content_type,
                    bytes: Bytes::from(bytes),
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()?;
        Ok((Value::Object(self.fields), uploads))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SettleRequest {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Serialize)]
struct ServerStatus {
    status: &'static str,
    pending_sync: usize,
    timestamp: String,
}

// --- Helpers ---

fn operation_response<T: Serialize>(result: OperationResult<T>, success_status: StatusCode) -> Response {
    let status = if !result.success {
        StatusCode::UNPROCESSABLE_ENTITY
    } else if result.saved_locally {
        StatusCode::ACCEPTED
    } else {
        success_status
    };
    (status, Json(result)).into_response()
}

fn status_change_response(change: StatusChange) -> Response {
    let status = if change.success {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(change)).into_response()
}

fn rows_for(state: &AppState, project_id: &str, query: &ViewQuery) -> Result<Vec<AggregatedEmployeeRecord>, ApiError> {
    let filters = query.filters(project_id)?;
    Ok(if query.edit {
        state.engine.aggregate_fresh(&filters)
    } else {
        state.engine.aggregate(&filters)
    })
}

async fn create_record<T: ManagedRecord>(
    state: &AppState,
    service: &RecordService<T>,
    input: RecordInput,
) -> Result<Response, ApiError> {
    let (fields, uploads) = input.into_parts()?;
    let record = service.prepare_new(fields)?;
    let result = service.save(record, uploads).await;
    if let Some(saved) = &result.data {
        info!("Created {:?} {}", T::CATEGORY, saved.identity());
        state.schedule_refresh(saved.project_id());
    }
    Ok(operation_response(result, StatusCode::CREATED))
}

async fn update_record<T: ManagedRecord>(
    state: &AppState,
    service: &RecordService<T>,
    id: &str,
    input: RecordInput,
) -> Result<Response, ApiError> {
    if service.store().find(id).is_none() {
        return Err(ApiError::NotFound(format!("{:?} {}", T::CATEGORY, id)));
    }
    let (patch, uploads) = input.into_parts()?;
    let result = service.update(id, patch, uploads).await;
    if let Some(updated) = &result.data {
        state.schedule_refresh(updated.project_id());
    }
    Ok(operation_response(result, StatusCode::OK))
}

async fn delete_record<T: ManagedRecord>(
    state: &AppState,
    service: &RecordService<T>,
    id: &str,
) -> Result<Response, ApiError> {
    let existing = service
        .store()
        .find(id)
        .ok_or_else(|| ApiError::NotFound(format!("{:?} {}", T::CATEGORY, id)))?;
    let result = service.delete(id).await;
    if result.success {
        state.schedule_refresh(existing.project_id());
    }
    Ok(operation_response(result, StatusCode::OK))
}

// --- Handlers ---

async fn server_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(ServerStatus {
        status: "ok",
        pending_sync: state.queue.len(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn workers(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ViewQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = rows_for(&state, &project_id, &query)?;
    Ok(Json(worker_view(&rows)))
}

async fn workers_csv(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ViewQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = rows_for(&state, &project_id, &query)?;
    let csv = worker_csv_string(&worker_view(&rows), &total_view(&rows))?;
    Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv))
}

async fn total(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ViewQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = rows_for(&state, &project_id, &query)?;
    Ok(Json(total_view(&rows)))
}

async fn unsettled(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ViewQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = rows_for(&state, &project_id, &query)?;
    Ok(Json(unsettled_view(&rows)))
}

async fn flow(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ViewQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filters = query.filters(&project_id)?;
    let scoped = state.engine.scoped_records(&filters);
    Ok(Json(flow_view(&scoped, &state.employees.all())))
}

async fn create_attendance(
    State(state): State<AppState>,
    Json(input): Json<RecordInput>,
) -> Result<Response, ApiError> {
    create_record(&state, &state.attendance, input).await
}

async fn update_attendance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<RecordInput>,
) -> Result<Response, ApiError> {
    update_record(&state, &state.attendance, &id, input).await
}

async fn delete_attendance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    delete_record(&state, &state.attendance, &id).await
}

async fn create_settlement(
    State(state): State<AppState>,
    Json(input): Json<RecordInput>,
) -> Result<Response, ApiError> {
    create_record(&state, &state.settlements, input).await
}

async fn update_settlement(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<RecordInput>,
) -> Result<Response, ApiError> {
    update_record(&state, &state.settlements, &id, input).await
}

async fn delete_settlement(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    delete_record(&state, &state.settlements, &id).await
}

async fn audit_settlement(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if state.settlements.store().find(&id).is_none() {
        return Err(ApiError::NotFound(format!("Settlement {}", id)));
    }
    let result = state.settlements.mark_audited(&id).await;
    Ok(operation_response(result, StatusCode::OK))
}

async fn settle_employee(
    State(state): State<AppState>,
    Path(employee_id): Path<String>,
    Json(request): Json<SettleRequest>,
) -> Response {
    status_change_response(state.gate.settle(&employee_id, request.confirm).await)
}

async fn unsettle_employee(
    State(state): State<AppState>,
    Path(employee_id): Path<String>,
) -> Response {
    status_change_response(state.gate.unsettle(&employee_id).await)
}

async fn sync_queue(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.queue.entries())
}

pub fn router(state: AppState) -> Router {
    let project_routes = Router::new()
        .route("/{project_id}/workers", get(workers))
        .route("/{project_id}/workers.csv", get(workers_csv))
        .route("/{project_id}/total", get(total))
        .route("/{project_id}/unsettled", get(unsettled))
        .route("/{project_id}/flow", get(flow));

    Router::new()
        .route("/status", get(server_status))
        .nest("/api/projects", project_routes)
        .route("/api/attendance", post(create_attendance))
        .route("/api/attendance/{id}", put(update_attendance).delete(delete_attendance))
        .route("/api/settlements", post(create_settlement))
        .route("/api/settlements/{id}", put(update_settlement).delete(delete_settlement))
        .route("/api/settlements/{id}/audit", post(audit_settlement))
        .route("/api/employees/{employee_id}/settle", post(settle_employee))
        .route("/api/employees/{employee_id}/unsettle", post(unsettle_employee))
        .route("/api/sync-queue", get(sync_queue))
        .with_state(state)
}
