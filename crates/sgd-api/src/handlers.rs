// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thin HTTP handlers: deserialize, delegate to a core component, serialize.
//! No business logic lives here — see `sgd-render`, `sgd-ingest`, `sgd-queue`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Multipart, Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sgd_core::{BrandCanon, RenderRequest, SgdError};
use sgd_ingest::AssetSource;
use sgd_provider::ProviderTask;
use sgd_queue::QueueError;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

fn org_id(headers: &HeaderMap) -> String {
    headers
        .get("x-org-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("default")
        .to_string()
}

impl From<QueueError> for ApiError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::JobNotFound(id) => ApiError::not_found(format!("job {id} not found")),
            QueueError::JobTerminal(id) => {
                ApiError::new(StatusCode::BAD_REQUEST, "job_terminal", format!("job {id} already in a terminal state"))
            }
            QueueError::InvalidTransition(msg) => ApiError::new(StatusCode::BAD_REQUEST, "job_terminal", msg),
            QueueError::Cache(e) => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "cache_error", e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// render
// ---------------------------------------------------------------------------

pub async fn render(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RenderRequest>,
) -> Result<Json<sgd_core::RenderResult>, ApiError> {
    let request = request.validate_and_sanitize().map_err(ApiError::from)?;
    let result = state.render_pipeline.render(&org_id(&headers), request).await?;
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct AsyncRenderResponse {
    pub cached: bool,
    pub job_id: Option<Uuid>,
    pub content_hash: String,
    pub cached_result: Option<sgd_core::RenderResult>,
}

pub async fn render_async(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RenderRequest>,
) -> Result<Json<AsyncRenderResponse>, ApiError> {
    let request = request.validate_and_sanitize().map_err(ApiError::from)?;
    let job = sgd_render::RenderJob {
        org_id: org_id(&headers),
        request,
    };
    let payload = serde_json::to_value(&job).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let enqueued = state
        .queue
        .enqueue(payload)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "cache_error", e.to_string()))?;

    Ok(Json(AsyncRenderResponse {
        cached: enqueued.cached,
        job_id: enqueued.job_id,
        content_hash: enqueued.content_hash,
        cached_result: enqueued.cached_result,
    }))
}

pub async fn get_job(State(state): State<Arc<AppState>>, Path(job_id): Path<Uuid>) -> Result<Json<sgd_core::Job>, ApiError> {
    state
        .queue
        .status(job_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))
}

pub async fn cancel_job(State(state): State<Arc<AppState>>, Path(job_id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.queue.cancel(job_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn job_events_ws(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_job_events(state, job_id, socket))
}

async fn stream_job_events(state: Arc<AppState>, job_id: Uuid, mut socket: WebSocket) {
    let Some(mut rx) = state.queue.subscribe(job_id) else {
        let _ = socket
            .send(Message::text(json!({ "error": "job_not_found" }).to_string()))
            .await;
        return;
    };

    if let Some(current) = state.queue.status(job_id)
        && let Ok(text) = serde_json::to_string(&current)
        && socket.send(Message::text(text)).await.is_err()
    {
        return;
    }

    while let Ok(job) = rx.recv().await {
        let terminal = job.state.is_terminal();
        let Ok(text) = serde_json::to_string(&job) else { continue };
        if socket.send(Message::text(text)).await.is_err() {
            break;
        }
        if terminal {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AssetSourceDto {
    StorageKey { key: String },
    Url { url: String },
}

impl From<AssetSourceDto> for AssetSource {
    fn from(dto: AssetSourceDto) -> Self {
        match dto {
            AssetSourceDto::StorageKey { key } => AssetSource::StorageKey(key),
            AssetSourceDto::Url { url } => AssetSource::Url(url),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestRequestBody {
    pub project_id: String,
    pub assets: Vec<AssetSourceDto>,
}

impl From<sgd_ingest::IngestError> for ApiError {
    fn from(error: sgd_ingest::IngestError) -> Self {
        match &error {
            sgd_ingest::IngestError::SecurityThreat { .. } => {
                ApiError::new(StatusCode::BAD_REQUEST, "security_threat", error.to_string())
            }
            sgd_ingest::IngestError::DisallowedHost { .. } | sgd_ingest::IngestError::UnsupportedScheme { .. } => {
                ApiError::bad_request(error.to_string())
            }
            sgd_ingest::IngestError::Other(_) => ApiError::new(StatusCode::BAD_GATEWAY, "provider_error", error.to_string()),
        }
    }
}

pub async fn ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IngestRequestBody>,
) -> Result<Json<sgd_ingest::IngestOutcome>, ApiError> {
    let org = org_id(&headers);
    let idempotency_key = headers.get("idempotency-key").and_then(|v| v.to_str().ok());

    if let Some(key) = idempotency_key {
        let request_body = serde_json::to_vec(&json!({"project_id": &body.project_id})).unwrap_or_default();
        let cache_key = sgd_ingest::IngestPipeline::idempotency_key(key, &body.project_id, &request_body);
        if let Ok(Some(cached)) = state.cache.peek::<sgd_ingest::IngestOutcome>(&cache_key).await {
            return Ok(Json(cached));
        }

        let assets = body.assets.into_iter().map(AssetSource::from).collect();
        let outcome = state.ingest.ingest(&org, &body.project_id, assets).await?;
        let _ = state
            .cache
            .put(&cache_key, &outcome, sgd_ingest::IngestPipeline::idempotency_cache_ttl())
            .await;
        return Ok(Json(outcome));
    }

    let assets = body.assets.into_iter().map(AssetSource::from).collect();
    let outcome = state.ingest.ingest(&org, &body.project_id, assets).await?;
    Ok(Json(outcome))
}

pub async fn ingest_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<sgd_ingest::IngestOutcome>, ApiError> {
    let org = org_id(&headers);
    let mut project_id: Option<String> = None;
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::bad_request(e.to_string()))? {
        match field.name() {
            Some("project_id") => {
                project_id = Some(field.text().await.map_err(|e| ApiError::bad_request(e.to_string()))?);
            }
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload.bin").to_string();
                let bytes = field.bytes().await.map_err(|e| ApiError::bad_request(e.to_string()))?;
                upload = Some((filename, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let project_id = project_id.ok_or_else(|| ApiError::bad_request("missing `project_id` field"))?;
    let (filename, bytes) = upload.ok_or_else(|| ApiError::bad_request("missing `file` field"))?;

    let key = sgd_storage::object_key(&org, sgd_storage::StorageArea::Quarantine, &project_id, &filename);
    state
        .storage
        .put(&key, &bytes, "application/octet-stream")
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string()))?;

    let outcome = state
        .ingest
        .ingest(&org, &project_id, vec![AssetSource::StorageKey(key)])
        .await?;
    Ok(Json(outcome))
}

pub async fn canon_derive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IngestRequestBody>,
) -> Result<Json<Option<BrandCanon>>, ApiError> {
    let org = org_id(&headers);
    let assets = body.assets.into_iter().map(AssetSource::from).collect();
    let outcome = state.ingest.ingest(&org, &body.project_id, assets).await?;
    Ok(Json(outcome.canon))
}

pub async fn get_canon(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<String>,
) -> Result<Json<BrandCanon>, ApiError> {
    let key = sgd_cache::Cache::derive_key(&["canon", &org_id(&headers), &project_id]);
    state
        .cache
        .peek::<BrandCanon>(&key)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "cache_error", e))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no brand canon stored for project {project_id}")))
}

pub async fn put_canon(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<String>,
    Json(canon): Json<BrandCanon>,
) -> Result<StatusCode, ApiError> {
    canon.validate()?;
    let key = sgd_cache::Cache::derive_key(&["canon", &org_id(&headers), &project_id]);
    let ttl = Duration::from_secs(state.config.cache_ttls.canon_secs);
    state
        .cache
        .put(&key, &canon, ttl)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "cache_error", e))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// critique
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CritiqueRequestBody {
    pub instruction: String,
    pub asset_ref: String,
}

pub async fn critique(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CritiqueRequestBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let payload = json!({
        "messages": [{
            "role": "user",
            "content": format!(
                "Critique the asset `{}` against the instruction: {}. Respond with strict JSON {{passed, notes, externally_verified}}.",
                body.asset_ref, body.instruction
            ),
        }],
    });
    let (response, _record) = state
        .provider
        .execute(ProviderTask::Critic, payload)
        .await
        .map_err(|e| SgdError::ProviderError {
            task: "critic".to_string(),
            cause: e.to_string(),
        })?;
    Ok(Json(response.body))
}

// ---------------------------------------------------------------------------
// upload
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub storage_key: String,
    pub url: String,
    pub exif_removed: bool,
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let org = org_id(&headers);
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::bad_request(e.to_string()))? {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("upload.bin").to_string();
            let bytes = field.bytes().await.map_err(|e| ApiError::bad_request(e.to_string()))?;
            upload = Some((filename, bytes.to_vec()));
        }
    }
    let (filename, bytes) = upload.ok_or_else(|| ApiError::bad_request("missing `file` field"))?;

    let (scan, clean_bytes) = state.scanner.scan(&bytes, None, Some(&filename));
    if !scan.is_safe {
        let quarantine_key = sgd_storage::threat_quarantine_key(&org, &bytes);
        let _ = state.storage.put(&quarantine_key, &bytes, "application/octet-stream").await;
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "security_threat",
            format!("threats detected: {:?}", scan.threats),
        ));
    }

    let key = sgd_storage::object_key(&org, sgd_storage::StorageArea::Public, "uploads", &filename);
    state
        .storage
        .put(&key, &clean_bytes, &scan.actual_mime)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string()))?;
    let signed = state
        .storage
        .sign(&key, sgd_storage::SIGNED_URL_TTL)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string()))?;

    Ok(Json(UploadResponse {
        storage_key: key,
        url: signed.url,
        exif_removed: scan.exif_removed,
    }))
}

// ---------------------------------------------------------------------------
// health / metrics
// ---------------------------------------------------------------------------

pub async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "status": "ok",
        "service": state.config.service_name,
        "environment": state.config.service_env,
        "uptime_seconds": uptime,
    }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active_workers = state.workers.active_count();
    let dead_letters = state.queue.dead_letters().len();
    let mut body = String::new();
    body.push_str(&format!("sgd_active_workers {active_workers}\n"));
    body.push_str(&format!("sgd_dead_letter_jobs {dead_letters}\n"));
    ([("content-type", "text/plain; version=0.0.4")], body)
}
