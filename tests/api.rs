use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use target_analyzer::api::{router, AppState};
use target_analyzer::cache::ResponseCache;
use target_analyzer::config::{AnalysisSettings, CacheSettings};
use target_analyzer::models::{ProviderKind, ProviderRole};
use target_analyzer::tasks::Analyzer;
use target_analyzer::tools::{BackendError, CompletionBackend, ModelCall, ProviderInvoker};

const REPORT: &str = r#"```json
{"executive_summary": "EV demand keeps growing. Charging access is the main worry.",
 "key_findings": {"primary_insights": ["charging"]},}
```"#;

struct CannedBackend {
    provider: ProviderKind,
    reply: Result<String, BackendError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl CannedBackend {
    fn new(provider: ProviderKind, reply: Result<String, BackendError>) -> Arc<Self> {
        Self::slow(provider, reply, Duration::ZERO)
    }

    fn slow(provider: ProviderKind, reply: Result<String, BackendError>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            provider,
            reply,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for CannedBackend {
    fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    async fn complete(&self, _call: &ModelCall<'_>) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.reply.clone()
    }
}

fn absent(kind: ProviderKind, role: ProviderRole) -> ProviderInvoker {
    ProviderInvoker::unconfigured(kind, role, format!("{} is not set", kind.env_key()))
}

fn app_with(primary: ProviderInvoker) -> Router {
    let analyzer = Analyzer::new(
        primary,
        absent(ProviderKind::Gemini, ProviderRole::Secondary),
        &AnalysisSettings::default(),
    );
    router(AppState::new(analyzer, ResponseCache::new(CacheSettings::default())))
}

fn unconfigured_app() -> Router {
    app_with(absent(ProviderKind::OpenAi, ProviderRole::Primary))
}

fn canned_app(backend: Arc<CannedBackend>) -> Router {
    app_with(ProviderInvoker::new(
        ProviderRole::Primary,
        backend,
        vec!["gpt-4o-mini".to_string()],
        Duration::from_secs(5),
    ))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let response = unconfigured_app().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn blank_keyword_is_rejected() {
    let response = unconfigured_app()
        .oneshot(post_json(
            "/api/target/analyze",
            json!({"target_keyword": "   ", "target_type": "keyword"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["error_code"], json!("VALIDATION_ERROR_TARGET_KEYWORD"));
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let request = Request::builder()
        .method("POST")
        .uri("/api/target/analyze")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = unconfigured_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error_code"], json!("INVALID_REQUEST"));
}

#[tokio::test]
async fn unconfigured_service_returns_basic_report() {
    let response = unconfigured_app()
        .oneshot(post_json(
            "/api/target/analyze",
            json!({"target_keyword": "X", "target_type": "audience"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["target_keyword"], json!("X"));
    assert_eq!(body["data"]["target_type"], json!("audience"));
    assert_eq!(body["data"]["metadata"]["degradation"], json!("basic_fallback"));
    assert!(body["task_id"].as_str().is_some());
}

#[tokio::test]
async fn repaired_provider_reply_is_normalized() {
    let backend = CannedBackend::new(ProviderKind::OpenAi, Ok(REPORT.to_string()));
    let response = canned_app(Arc::clone(&backend))
        .oneshot(post_json(
            "/api/target/analyze",
            json!({"target_keyword": "electric cars"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let data = body_json(response).await["data"].clone();
    assert_eq!(data["target_keyword"], json!("electric cars"));
    assert_eq!(
        data["executive_summary"],
        json!("EV demand keeps growing. Charging access is the main worry.")
    );
    assert_eq!(data["metadata"]["degradation"], json!("primary_only"));
    assert_eq!(data["metadata"]["models_used"], json!(["gpt-4o-mini"]));
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn rejected_sole_credential_is_service_unavailable() {
    let backend = CannedBackend::new(
        ProviderKind::OpenAi,
        Err(BackendError::Unauthorized("invalid api key".into())),
    );
    let response = canned_app(backend)
        .oneshot(post_json("/api/target/analyze", json!({"target_keyword": "ev"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error_code"], json!("CONFIGURATION_ERROR"));
}

#[tokio::test]
async fn get_is_served_from_cache_on_repeat() {
    let backend = CannedBackend::new(ProviderKind::OpenAi, Ok(REPORT.to_string()));
    let app = canned_app(Arc::clone(&backend));
    let uri = "/api/target/analyze?target_keyword=ev&target_type=keyword";

    let first = app.clone().oneshot(get(uri)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-cache"], "MISS");

    let first_task = body_json(first).await["task_id"].clone();

    let second = app.clone().oneshot(get(uri)).await.unwrap();
    assert_eq!(second.headers()["x-cache"], "HIT");
    assert_eq!(backend.calls(), 1);
    let second = body_json(second).await;
    assert_eq!(second["data"]["target_keyword"], json!("ev"));
    assert!(second["task_id"].as_str().is_some());
    assert_ne!(second["task_id"], first_task);

    let stats = body_json(app.oneshot(get("/api/cache/stats")).await.unwrap()).await;
    assert_eq!(stats["hits"], json!(1));
    assert_eq!(stats["total_entries"], json!(1));
}

#[tokio::test]
async fn no_cache_header_bypasses_cache() {
    let backend = CannedBackend::new(ProviderKind::OpenAi, Ok(REPORT.to_string()));
    let app = canned_app(Arc::clone(&backend));
    let uri = "/api/target/analyze?target_keyword=ev";
    let request = || {
        Request::builder()
            .uri(uri)
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::empty())
            .unwrap()
    };

    app.clone().oneshot(request()).await.unwrap();
    let second = app.oneshot(request()).await.unwrap();
    assert_eq!(second.headers()["x-cache"], "MISS");
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn fallback_reports_are_not_cached() {
    let app = unconfigured_app();
    let uri = "/api/target/analyze?target_keyword=ev";
    app.clone().oneshot(get(uri)).await.unwrap();
    let second = app.oneshot(get(uri)).await.unwrap();
    assert_eq!(second.headers()["x-cache"], "MISS");
}

#[tokio::test]
async fn cache_clear_reports_removed_entries() {
    let backend = CannedBackend::new(ProviderKind::OpenAi, Ok(REPORT.to_string()));
    let app = canned_app(backend);
    app.clone()
        .oneshot(get("/api/target/analyze?target_keyword=ev"))
        .await
        .unwrap();

    let request = Request::builder()
        .method("DELETE")
        .uri("/api/cache/clear")
        .body(Body::empty())
        .unwrap();
    let body = body_json(app.oneshot(request).await.unwrap()).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["cleared_entries"], json!(1));
}

#[tokio::test]
async fn stream_is_ndjson_ending_with_complete() {
    let backend = CannedBackend::new(ProviderKind::OpenAi, Ok(REPORT.to_string()));
    let response = canned_app(backend)
        .oneshot(post_json(
            "/api/target/analyze/stream",
            json!({"target_keyword": "ev", "target_type": "keyword"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-ndjson");
    assert!(response.headers().contains_key("x-task-id"));

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let events: Vec<Value> = String::from_utf8(bytes.to_vec())
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert!(events.iter().any(|e| e["type"] == "sentence"));
    let last = events.last().unwrap();
    assert_eq!(last["type"], "complete");
    assert_eq!(last["data"]["target_keyword"], "ev");
    let completes = events.iter().filter(|e| e["type"] == "complete").count();
    assert_eq!(completes, 1);
}

#[tokio::test]
async fn unknown_task_progress_is_not_found() {
    let response = unconfigured_app()
        .oneshot(get("/api/progress/does-not-exist"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error_code"], json!("NOT_FOUND"));
}

#[tokio::test]
async fn cache_hit_echoes_client_task_id() {
    let backend = CannedBackend::new(ProviderKind::OpenAi, Ok(REPORT.to_string()));
    let app = canned_app(backend);
    let uri = "/api/target/analyze?target_keyword=ev";
    app.clone().oneshot(get(uri)).await.unwrap();

    let request = Request::builder()
        .uri(uri)
        .header("x-task-id", "job-42")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-cache"], "HIT");
    assert_eq!(body_json(response).await["task_id"], json!("job-42"));
}

#[tokio::test]
async fn task_id_in_use_is_a_conflict() {
    let backend = CannedBackend::slow(
        ProviderKind::OpenAi,
        Ok(REPORT.to_string()),
        Duration::from_millis(300),
    );
    let app = canned_app(Arc::clone(&backend));
    let request = || {
        let mut request = post_json("/api/target/analyze", json!({"target_keyword": "ev"}));
        request
            .headers_mut()
            .insert("x-task-id", header::HeaderValue::from_static("job-1"));
        request
    };

    let running = tokio::spawn(app.clone().oneshot(request()));
    while backend.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let progress = app.clone().oneshot(get("/api/progress/job-1")).await.unwrap();
    assert_eq!(progress.status(), StatusCode::OK);

    let duplicate = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(duplicate).await["error_code"], json!("TASK_ID_CONFLICT"));

    let first = running.await.unwrap().unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(body_json(first).await["task_id"], json!("job-1"));
    assert_eq!(backend.calls(), 1);

    let again = app.oneshot(request()).await.unwrap();
    assert_eq!(again.status(), StatusCode::OK);
}

#[tokio::test]
async fn compare_needs_two_keywords() {
    let response = unconfigured_app()
        .oneshot(post_json("/api/analysis/compare", json!({"keywords": ["ev"]})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error_code"], json!("VALIDATION_ERROR_KEYWORDS"));
}

#[tokio::test]
async fn compare_returns_a_report_per_keyword() {
    let backend = CannedBackend::new(ProviderKind::OpenAi, Ok(REPORT.to_string()));
    let response = canned_app(Arc::clone(&backend))
        .oneshot(post_json(
            "/api/analysis/compare",
            json!({"keywords": ["ev", "hybrid", "ev"], "comparison_aspects": ["market"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let data = body_json(response).await["data"].clone();
    assert_eq!(data["keywords"], json!(["ev", "hybrid"]));
    assert_eq!(data["comparison_results"]["hybrid"]["target_keyword"], json!("hybrid"));
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn recommendations_without_provider_are_basic() {
    let response = unconfigured_app()
        .oneshot(post_json(
            "/api/recommend/keywords",
            json!({"target_keyword": "ev", "recommendation_type": "semantic", "max_results": 5}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let data = body_json(response).await["data"].clone();
    assert_eq!(data["related_keywords"]["semantic_similar"][0]["keyword"], json!("ev related 1"));
    assert_eq!(data["metadata"]["recommendation_type"], json!("semantic"));
    assert_eq!(data["metadata"]["is_fallback"], json!(true));
}

#[tokio::test]
async fn unknown_recommendation_type_is_rejected() {
    let response = unconfigured_app()
        .oneshot(post_json(
            "/api/recommend/keywords",
            json!({"target_keyword": "ev", "recommendation_type": "viral"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sentiment_route_wraps_reading() {
    let response = unconfigured_app()
        .oneshot(post_json("/api/analysis/sentiment", json!({"target_keyword": "ev"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["sentiment"]["score"], json!(50));
}

#[tokio::test]
async fn comprehensive_route_attaches_enrichment() {
    let response = unconfigured_app()
        .oneshot(post_json(
            "/api/analysis/comprehensive",
            json!({"target_keyword": "ev", "target_type": "keyword"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert!(body["task_id"].as_str().is_some());
    let data = &body["data"];
    assert_eq!(data["target_keyword"], json!("ev"));
    for section in ["sentiment", "context", "tone", "recommendations"] {
        assert!(data[section].is_object(), "missing {section}");
    }
    assert_eq!(data["analysis_depth"], json!("standard"));
}
