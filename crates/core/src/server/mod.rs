use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::fingerprint::Fingerprint;
use crate::job::{EnqueueResponse, InterruptResponse, QueueRequest, StatusResponse};
use crate::registry::JobRegistry;
use crate::workflow::{validate_workflow_name, WorkflowInfo};

const MAX_PROMPT_CHARS: usize = 1000;
const MIN_DIMENSION: u32 = 64;
const MAX_DIMENSION: u32 = 2048;
const MAX_PIXELS: u64 = 2048 * 2048;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Where the server is reachable; reported by the banner and `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    pub local_ip: String,
}

impl ServerInfo {
    pub fn address(&self) -> String {
        format!("http://{}:{}", self.local_ip, self.port)
    }
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: JobRegistry,
    server_info: ServerInfo,
    started_at: Instant,
}

impl AppState {
    pub fn new(registry: JobRegistry, server_info: ServerInfo) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                server_info,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.inner.server_info
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }
}

#[derive(Debug, Deserialize)]
pub struct InterruptRequest {
    pub prompt_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_images: u64,
    pub storage_used_mb: f64,
    pub server_status: String,
    pub uptime: String,
    pub server_address: String,
    pub in_flight_jobs: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/api/workflows", get(list_workflows))
        .route("/api/models", get(list_model_types))
        .route("/api/models/{model_type}", get(list_models))
        .route("/api/enqueue", post(enqueue))
        .route("/api/interrupt", post(interrupt))
        .route("/api/images/{prompt_id}", get(image_status))
        .route("/api/download/{prompt_id}", get(download))
        .route("/api/stats", get(stats))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn banner(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "message": "snuabar generation server",
        "status": "running",
        "endpoints": {
            "GET /api/workflows": "list available workflows",
            "GET /api/models": "list model folders on the execution host",
            "GET /api/models/{model_type}": "list models of one folder",
            "POST /api/enqueue": "submit a generation job",
            "POST /api/interrupt": "interrupt a running job",
            "GET /api/images/{prompt_id}": "poll job status",
            "GET /api/download/{prompt_id}": "download a finished artifact",
            "GET /api/stats": "server statistics"
        },
        "server_info": state.server_info(),
        "timestamp": Local::now().to_rfc3339(),
    }))
}

async fn list_workflows(State(state): State<AppState>) -> Json<Vec<WorkflowInfo>> {
    Json(state.registry().catalog().list())
}

async fn list_model_types(State(state): State<AppState>) -> Result<Json<Vec<String>>, AppError> {
    let types = state
        .registry()
        .host()
        .model_types()
        .await
        .map_err(upstream_error)?;
    Ok(Json(types))
}

async fn list_models(
    State(state): State<AppState>,
    Path(model_type): Path<String>,
) -> Result<Json<Vec<String>>, AppError> {
    let models = state
        .registry()
        .host()
        .models(&model_type)
        .await
        .map_err(upstream_error)?;
    Ok(Json(models))
}

async fn enqueue(
    State(state): State<AppState>,
    Json(payload): Json<QueueRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    validate_request(&payload)?;
    info!(workflow = %payload.workflow, "Enqueue request received");

    let response = state
        .registry()
        .enqueue(payload)
        .await
        .map_err(upstream_error)?;
    Ok(Json(response))
}

async fn interrupt(
    State(state): State<AppState>,
    Json(payload): Json<InterruptRequest>,
) -> Result<Json<InterruptResponse>, AppError> {
    let prompt_id = parse_prompt_id(&payload.prompt_id)?;
    let response = state
        .registry()
        .interrupt(&prompt_id)
        .await
        .map_err(upstream_error)?;
    Ok(Json(response))
}

async fn image_status(
    State(state): State<AppState>,
    Path(prompt_id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let prompt_id = parse_prompt_id(&prompt_id)?;
    let response = state
        .registry()
        .status(&prompt_id)
        .await
        .map_err(upstream_error)?;
    Ok(Json(response))
}

async fn download(
    State(state): State<AppState>,
    Path(prompt_id): Path<String>,
) -> Result<Response, AppError> {
    let prompt_id = parse_prompt_id(&prompt_id)?;
    let located = state
        .registry()
        .locate(&prompt_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no artifact for {prompt_id}")))?;
    let path = located
        .primary()
        .ok_or_else(|| AppError::NotFound(format!("no artifact for {prompt_id}")))?;

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open artifact {}", path.display()))?;
    let body = Body::from_stream(ReaderStream::new(file));

    let content_type = mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(located.kind.mime());
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        located.primary_name()
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    headers.insert(header::CONTENT_DISPOSITION, disposition);

    Ok((StatusCode::OK, headers, body).into_response())
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let storage = state.registry().locator().stats().await;
    let storage_used_mb = (storage.total_bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0;

    Json(StatsResponse {
        total_images: storage.total_images,
        storage_used_mb,
        server_status: "running".to_string(),
        uptime: format_uptime(state.uptime()),
        server_address: state.server_info().address(),
        in_flight_jobs: state.registry().in_flight_count(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

fn parse_prompt_id(raw: &str) -> Result<Fingerprint, AppError> {
    Fingerprint::parse(raw).map_err(|e| AppError::BadRequest(e.to_string()))
}

pub fn validate_request(request: &QueueRequest) -> Result<(), AppError> {
    validate_workflow_name(&request.workflow).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let prompt_chars = request.prompt.chars().count();
    if prompt_chars == 0 || prompt_chars > MAX_PROMPT_CHARS {
        return Err(AppError::BadRequest(format!(
            "prompt must be 1..={MAX_PROMPT_CHARS} characters, got {prompt_chars}"
        )));
    }

    for (name, value) in [("width", request.width), ("height", request.height)] {
        if let Some(value) = value {
            if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
                return Err(AppError::BadRequest(format!(
                    "{name} must be within {MIN_DIMENSION}..={MAX_DIMENSION}, got {value}"
                )));
            }
        }
    }

    if let (Some(width), Some(height)) = (request.width, request.height) {
        if u64::from(width) * u64::from(height) > MAX_PIXELS {
            return Err(AppError::BadRequest(format!(
                "image too large: {width}x{height}"
            )));
        }
    }

    Ok(())
}

/// `H:MM:SS`, hours unbounded.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn upstream_error(err: anyhow::Error) -> AppError {
    error!(error = %format!("{err:#}"), "Upstream call failed");
    AppError::Upstream(format!("{err:#}"))
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    Upstream(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}
