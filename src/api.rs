//! HTTP surface: analysis endpoints, progress polling and cache admin.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cache::{cache_key, CacheStats, ResponseCache};
use crate::config::Settings;
use crate::error::AnalysisError;
use crate::models::{
    AnalysisRequest, AnalysisRequestBody, CompareRequestBody, ComprehensiveRequestBody,
    InsightRequestBody, RecommendationRequestBody, StreamEvent,
};
use crate::progress::{ProgressRegistry, ProgressStatus, ProgressTracker};
use crate::report::{Degradation, StructuredReport};
use crate::tasks::{Analyzer, InsightKind};

/// Lets a client pick the task id so it can poll progress mid-request.
pub const TASK_ID_HEADER: &str = "x-task-id";
pub const CACHE_STATUS_HEADER: &str = "x-cache";

const STREAM_BUFFER: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub analyzer: Arc<Analyzer>,
    pub progress: Arc<ProgressRegistry>,
    pub cache: Arc<ResponseCache>,
}

impl AppState {
    pub fn new(analyzer: Analyzer, cache: ResponseCache) -> Self {
        Self {
            analyzer: Arc::new(analyzer),
            progress: Arc::new(ProgressRegistry::new()),
            cache: Arc::new(cache),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            Analyzer::from_settings(settings),
            ResponseCache::new(settings.cache.clone()),
        )
    }

    fn tracker(&self, headers: &HeaderMap) -> Result<Arc<ProgressTracker>, ApiError> {
        match requested_task_id(headers) {
            Some(task_id) => self
                .progress
                .create_with_id(task_id)
                .ok_or_else(|| ApiError::Conflict(format!("task id `{task_id}` is already in use"))),
            None => Ok(self.progress.create()),
        }
    }
}

fn requested_task_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(TASK_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Analysis(AnalysisError::Validation { .. }) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Analysis(AnalysisError::Configuration { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Analysis(AnalysisError::ProviderCall { .. }) => StatusCode::BAD_GATEWAY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
        }
    }

    fn code(&self) -> String {
        match self {
            Self::Analysis(err) => err.error_code(),
            Self::BadRequest(_) => "INVALID_REQUEST".to_string(),
            Self::NotFound(_) => "NOT_FOUND".to_string(),
            Self::Conflict(_) => "TASK_ID_CONFLICT".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(%status, "request failed: {self}");
        }
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/target/analyze", post(analyze).get(analyze_cached))
        .route("/api/target/analyze/stream", post(analyze_stream))
        .route("/api/analysis/sentiment", post(sentiment))
        .route("/api/analysis/context", post(context))
        .route("/api/analysis/tone", post(tone))
        .route("/api/analysis/comprehensive", post(comprehensive))
        .route("/api/analysis/compare", post(compare))
        .route("/api/recommend/keywords", post(recommend_keywords))
        .route("/api/progress/:task_id", get(progress))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/clear", delete(cache_clear))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

fn success(task_id: &str, data: impl serde::Serialize) -> Value {
    json!({
        "success": true,
        "task_id": task_id,
        "data": data,
    })
}

async fn run_analysis(
    state: &AppState,
    headers: &HeaderMap,
    request: &AnalysisRequest,
) -> Result<(String, StructuredReport), ApiError> {
    let tracker = state.tracker(headers)?;
    let task_id = tracker.task_id().to_string();
    let result = state
        .analyzer
        .perform_analysis(request, Some(tracker.as_ref()))
        .await;
    state.progress.remove(&task_id);
    Ok((task_id, result?))
}

#[instrument(skip(state, headers, body))]
async fn analyze(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AnalysisRequestBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let start_time = std::time::Instant::now();
    let Json(body) = body?;
    let request = body.validate()?;

    let (task_id, report) = run_analysis(&state, &headers, &request).await?;
    info!(%task_id, "analysis served in {:?}", start_time.elapsed());
    Ok(Json(success(&task_id, &report)))
}

fn bypasses_cache(headers: &HeaderMap) -> bool {
    headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            let v = v.to_ascii_lowercase();
            v.contains("no-cache") || v.contains("no-store")
        })
}

fn with_cache_status(payload: Value, status: &'static str) -> Response {
    let mut response = Json(payload).into_response();
    response.headers_mut().insert(
        HeaderName::from_static(CACHE_STATUS_HEADER),
        HeaderValue::from_static(status),
    );
    response
}

/// Query-string variant of `analyze`, served through the response cache.
/// Only the report is cached; every response carries its own task id.
/// Basic fallback reports are not cached so that a later request can reach
/// a provider again.
#[instrument(skip(state, headers, query))]
async fn analyze_cached(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    query: Result<Query<AnalysisRequestBody>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(body) = query?;
    let request = body.validate()?;

    let bypass = bypasses_cache(&headers);
    let key = cache_key("GET", &uri.to_string());
    if !bypass {
        if let Some(data) = state.cache.get(&key) {
            let task_id = requested_task_id(&headers)
                .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
            info!(%task_id, "serving cached analysis");
            return Ok(with_cache_status(success(&task_id, data), "HIT"));
        }
    }

    let (task_id, report) = run_analysis(&state, &headers, &request).await?;
    let payload = success(&task_id, &report);
    let cacheable = report.metadata().degradation != Some(Degradation::BasicFallback);
    if !bypass && cacheable {
        state.cache.insert(key, payload["data"].clone());
    }
    Ok(with_cache_status(payload, "MISS"))
}

#[instrument(skip(state, headers, body))]
async fn analyze_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AnalysisRequestBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let request = body.validate()?;

    let tracker = state.tracker(&headers)?;
    let task_id = tracker.task_id().to_string();
    let (tx, rx) = mpsc::channel::<StreamEvent>(STREAM_BUFFER);
    let analyzer = Arc::clone(&state.analyzer);
    let registry = Arc::clone(&state.progress);
    tokio::spawn(async move {
        analyzer
            .stream_analysis(&request, Some(tracker.as_ref()), tx)
            .await;
        registry.remove(tracker.task_id());
    });

    let lines = ReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(Bytes::from(event.to_ndjson())));
    let mut response = Body::from_stream(lines).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    if let Ok(value) = HeaderValue::from_str(&task_id) {
        headers.insert(HeaderName::from_static(TASK_ID_HEADER), value);
    }
    Ok(response)
}

fn data(data: Value) -> Json<Value> {
    Json(json!({"success": true, "data": data}))
}

async fn insight(
    state: &AppState,
    kind: InsightKind,
    body: Result<Json<InsightRequestBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let request = body.validate()?;
    Ok(data(state.analyzer.insight(kind, &request).await))
}

async fn sentiment(
    State(state): State<AppState>,
    body: Result<Json<InsightRequestBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    insight(&state, InsightKind::Sentiment, body).await
}

async fn context(
    State(state): State<AppState>,
    body: Result<Json<InsightRequestBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    insight(&state, InsightKind::Context, body).await
}

async fn tone(
    State(state): State<AppState>,
    body: Result<Json<InsightRequestBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    insight(&state, InsightKind::Tone, body).await
}

#[instrument(skip(state, body))]
async fn recommend_keywords(
    State(state): State<AppState>,
    body: Result<Json<RecommendationRequestBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let request = body.validate()?;
    Ok(data(state.analyzer.recommend_keywords(&request).await))
}

#[instrument(skip(state, body))]
async fn compare(
    State(state): State<AppState>,
    body: Result<Json<CompareRequestBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let request = body.validate()?;
    Ok(data(state.analyzer.compare(&request).await?))
}

#[instrument(skip(state, headers, body))]
async fn comprehensive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ComprehensiveRequestBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let (request, depth) = body.validate()?;

    let tracker = state.tracker(&headers)?;
    let task_id = tracker.task_id().to_string();
    let result = state
        .analyzer
        .comprehensive(&request, depth, Some(tracker.as_ref()))
        .await;
    state.progress.remove(&task_id);
    Ok(Json(success(&task_id, result?)))
}

async fn progress(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ProgressStatus>, ApiError> {
    state
        .progress
        .get(&task_id)
        .map(|tracker| Json(tracker.status()))
        .ok_or_else(|| ApiError::NotFound(format!("task `{task_id}`")))
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

#[instrument(skip(state))]
async fn cache_clear(State(state): State<AppState>) -> Json<Value> {
    let cleared_entries = state.cache.clear();
    let cleared_trackers = state.progress.clear();
    info!(cleared_entries, cleared_trackers, "cleared shared stores");
    Json(json!({
        "success": true,
        "cleared_entries": cleared_entries,
        "cleared_trackers": cleared_trackers,
    }))
}
