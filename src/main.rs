mod history;
mod http;
mod idempotency;
mod jobs;
mod ledger;
mod metrics;
mod models;
mod normalize;
mod pipeline;
mod provider;
mod resolver;
mod shopify;
#[cfg(test)]
mod testing;
mod workflows;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use idempotency::IdempotencyCache;
use jobs::{JobQueue, JobRequest};
use ledger::LedgerStore;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, FailedItem, OrderRow, PurchasedItem, QueueItem, Settings, TrackStatus,
    TrackingResult,
};
use pipeline::{Engine, Pacing, PipelineError, PipelineErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "trackmaster.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let store = Arc::new(LedgerStore::open(LedgerStore::from_env_dir()).await?);
    let engine = Engine::new(store, Pacing::from_env());
    let (queue, _worker) = JobQueue::spawn(engine.clone());
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    let state = AppState {
        engine,
        queue,
        openapi: Arc::new(load_openapi()),
        idempotency: IdempotencyCache::default(),
        prometheus_handle,
    };
    let app = build_router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "trackmaster.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    engine: Engine,
    queue: JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: IdempotencyCache,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/batches", post(create_batch))
        .route("/batches/csv", post(create_batch_csv))
        .route("/purchases", post(create_purchase))
        .route("/fulfillments", post(create_fulfillment))
        .route("/jobs/{id}", get(get_job_status))
        .route("/results", get(list_results))
        .route("/queue", get(list_queue))
        .route("/purchased", get(list_purchased))
        .route("/failed", get(list_failed))
        .route("/settings", get(get_settings).put(put_settings))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(serde_json::json!({"openapi":"3.0.3"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "trackmaster-rs",
    }))
}

async fn openapi_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json((*state.openapi).clone())
}

async fn swagger_ui() -> Response {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>TrackMaster API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    (
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(8 * 1024 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    rows: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct SelectionRequest {
    order_numbers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

/// Resolve tracking for an uploaded order export.
///
/// - Method: `POST`
/// - Path: `/batches`
/// - Body: `{ "rows": [ { "Name": "#1001", "Shipping Zip": "02134", ... } ] }`
/// - Response: `{ "job_id": "..." }`; poll `/jobs/{id}` for progress.
async fn create_batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/batches");
    let rows = payload.rows.into_iter().map(OrderRow::from_fields).collect();
    enqueue_batch(&state, rows).await
}

/// Same as `/batches`, taking the raw CSV export as the body.
async fn create_batch_csv(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/batches/csv");
    let rows = normalize::rows_from_csv(&body)
        .map_err(|err| PipelineError::invalid_input("csv", err.to_string()))?;
    enqueue_batch(&state, rows).await
}

async fn enqueue_batch(
    state: &AppState,
    rows: Vec<OrderRow>,
) -> Result<Json<EnqueueResponse>, AppError> {
    if rows.is_empty() {
        return Err(PipelineError::invalid_input("batch", "no rows provided").into());
    }
    info!(target = "trackmaster.api", rows = rows.len(), "batch_submitted");
    let id = state
        .queue
        .enqueue(JobRequest::Batch { rows })
        .await
        .map_err(|err| PipelineError::internal("enqueue", err.error))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

/// Buy full tracking numbers for selected orders. Honors `Idempotency-Key`.
async fn create_purchase(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SelectionRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/purchases");
    let order_numbers = non_empty_selection(payload)?;
    enqueue_selection(&state, &headers, JobRequest::Purchase { order_numbers }).await
}

/// Mark selected orders fulfilled on the storefront. Honors `Idempotency-Key`.
async fn create_fulfillment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SelectionRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/fulfillments");
    let order_numbers = non_empty_selection(payload)?;
    enqueue_selection(&state, &headers, JobRequest::Fulfill { order_numbers }).await
}

fn non_empty_selection(payload: SelectionRequest) -> Result<Vec<String>, AppError> {
    let order_numbers: Vec<String> = payload
        .order_numbers
        .into_iter()
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .collect();
    if order_numbers.is_empty() {
        return Err(PipelineError::invalid_input("selection", "no orders selected").into());
    }
    Ok(order_numbers)
}

async fn enqueue_selection(
    state: &AppState,
    headers: &HeaderMap,
    request: JobRequest,
) -> Result<Json<EnqueueResponse>, AppError> {
    let key = IdempotencyCache::key_from(headers);
    let queue = state.queue.clone();
    let id = state
        .idempotency
        .get_or_enqueue(key, || async move {
            queue
                .enqueue(request)
                .await
                .map_err(|err| PipelineError::internal("enqueue", err.error))
        })
        .await?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(PipelineError::invalid_input("jobs", "invalid_job_id").into());
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or_else(|| PipelineError::not_found("jobs", "not_found").into())
}

#[derive(Debug, Default, Deserialize)]
struct ResultsQuery {
    #[serde(default)]
    view: Option<String>,
}

/// Session results. `?view=console` hides orders held in the queue.
async fn list_results(
    State(state): State<AppState>,
    Query(query): Query<ResultsQuery>,
) -> Json<Vec<TrackingResult>> {
    let mut results = state.engine.results().await;
    if query.view.as_deref() == Some("console") {
        results.retain(|r| r.status != TrackStatus::Queued);
    }
    Json(results)
}

async fn list_queue(State(state): State<AppState>) -> Result<Json<Vec<QueueItem>>, AppError> {
    let items = state
        .engine
        .store()
        .queue()
        .await
        .map_err(|err| PipelineError::storage("queue", err))?;
    Ok(Json(items))
}

async fn list_purchased(
    State(state): State<AppState>,
) -> Result<Json<Vec<PurchasedItem>>, AppError> {
    let items = state
        .engine
        .store()
        .purchased()
        .await
        .map_err(|err| PipelineError::storage("purchased", err))?;
    Ok(Json(items))
}

async fn list_failed(State(state): State<AppState>) -> Result<Json<Vec<FailedItem>>, AppError> {
    let items = state
        .engine
        .store()
        .failed()
        .await
        .map_err(|err| PipelineError::storage("failed", err))?;
    Ok(Json(items))
}

async fn get_settings(State(state): State<AppState>) -> Result<Json<Settings>, AppError> {
    let settings = state
        .engine
        .store()
        .settings()
        .await
        .map_err(|err| PipelineError::storage("settings", err))?;
    Ok(Json(settings.redacted()))
}

async fn put_settings(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> Result<Json<Settings>, AppError> {
    if settings.limit == 0 {
        return Err(PipelineError::invalid_input("settings", "limit must be positive").into());
    }
    let stored = state
        .engine
        .store()
        .settings()
        .await
        .map_err(|err| PipelineError::storage("settings", err))?;
    let settings = settings.keep_secrets_from(&stored);
    state
        .engine
        .store()
        .save_settings(&settings)
        .await
        .map_err(|err| PipelineError::storage("settings", err))?;
    info!(target = "trackmaster.api", "settings_updated");
    Ok(Json(settings.redacted()))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_app(dir: &std::path::Path) -> Router {
        let store = Arc::new(LedgerStore::open(dir).await.unwrap());
        store.save_settings(&Settings::default()).await.unwrap();
        let engine = Engine::new(store, Pacing::none());
        let (queue, _worker) = JobQueue::spawn(engine.clone());
        build_router(AppState {
            engine,
            queue,
            openapi: Arc::new(load_openapi()),
            idempotency: IdempotencyCache::default(),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_service() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["service"], "trackmaster-rs");
    }

    #[tokio::test]
    async fn settings_round_trip_redacts_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/settings",
                json!({"api_key": "secret-key", "shopify_domain": "shop.myshopify.com", "days_for_queue": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/settings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["api_key"], "secr…");
        assert_eq!(body["days_for_queue"], 3);
        assert_eq!(body["days_for_warning"], 7);
        assert_eq!(body["limit"], 3000);
    }

    #[tokio::test]
    async fn saving_redacted_settings_keeps_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        app.clone()
            .oneshot(json_request("PUT", "/settings", json!({"api_key": "secret-key"})))
            .await
            .unwrap();
        let shown = body_json(
            app.clone()
                .oneshot(Request::get("/settings").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        let mut edited = shown.clone();
        edited["days_for_warning"] = json!(9);
        let response = app
            .oneshot(json_request("PUT", "/settings", edited))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stored = LedgerStore::open(dir.path()).await.unwrap().settings().await.unwrap();
        assert_eq!(stored.api_key, "secret-key");
        assert_eq!(stored.days_for_warning, 9);
    }

    #[tokio::test]
    async fn empty_selection_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let response = app
            .oneshot(json_request("POST", "/purchases", json!({"order_numbers": [" "]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "selection");
    }

    #[tokio::test]
    async fn idempotency_key_reuses_purchase_job() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/purchases")
                .header("content-type", "application/json")
                .header("Idempotency-Key", "run-1")
                .body(Body::from(json!({"order_numbers": ["#1"]}).to_string()))
                .unwrap()
        };
        let first = body_json(app.clone().oneshot(request()).await.unwrap()).await;
        let second = body_json(app.oneshot(request()).await.unwrap()).await;
        assert_eq!(first["job_id"], second["job_id"]);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let uri = format!("/jobs/{}", uuid::Uuid::new_v4());
        let response = app
            .clone()
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::get("/jobs/not-a-uuid").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn header_only_csv_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let response = app
            .oneshot(
                Request::post("/batches/csv")
                    .header("content-type", "text/csv")
                    .body(Body::from("Name,Shipping Zip,Created at\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "batch");
    }

    #[tokio::test]
    async fn ledgers_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        for uri in ["/queue", "/purchased", "/failed", "/results?view=console"] {
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
            assert_eq!(body_json(response).await, json!([]), "{uri}");
        }
    }
}
