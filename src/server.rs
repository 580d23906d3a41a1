use crate::error::PipelineError;
use crate::events::{Event, EventPublisher};
use crate::jobs::JobRegistry;
use crate::pipeline::Orchestrator;
use axum::{
    extract::{Path, Query},
    http::{Method, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json},
    routing::{get, post},
    Extension, Router,
};
use futures::Stream;
use hyper::Server;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<JobRegistry>,
    pub publisher: Arc<EventPublisher>,
    pub metrics: Option<PrometheusHandle>,
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "estate-pipeline",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn pipeline_start(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.start_pipeline())
}

async fn pipeline_stop(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.stop_pipeline())
}

async fn pipeline_status(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.snapshot())
}

fn error_response(e: PipelineError) -> (StatusCode, String) {
    let status = match e {
        PipelineError::UnknownJob(_) | PipelineError::UnknownSource(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

async fn job_start(
    Extension(state): Extension<Arc<AppState>>,
    Path(source): Path<String>,
) -> impl IntoResponse {
    match state.registry.submit(&source) {
        Ok(job_id) => Json(serde_json::json!({ "job_id": job_id })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn job_stop(
    Extension(state): Extension<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.stop(&job_id) {
        Ok(()) => Json(serde_json::json!({ "accepted": true })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn jobs_list(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn job_get(
    Extension(state): Extension<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&job_id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::NOT_FOUND, format!("unknown job: {job_id}")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    limit: Option<usize>,
}

async fn job_log(
    Extension(state): Extension<Arc<AppState>>,
    Path(job_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    match state.registry.tail(&job_id, query.limit.unwrap_or(100)) {
        Ok(lines) => Json(lines).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    cursor: Option<u64>,
}

/// Pull fallback for observers that cannot hold an SSE connection open.
async fn events_pull(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<Event>> {
    Json(state.publisher.events_since(query.cursor.unwrap_or(0)))
}

async fn events_stream(
    Extension(state): Extension<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.publisher.subscribe();
    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let sse = SseEvent::default().json_data(&event).ok()?;
        Some((Ok(sse), subscription))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn metrics_render(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

/// Create the HTTP server with all routes
pub fn create_server(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/pipeline/start", post(pipeline_start))
        .route("/pipeline/stop", post(pipeline_stop))
        .route("/pipeline/status", get(pipeline_status))
        .route("/jobs", get(jobs_list))
        .route("/jobs/:source/start", post(job_start))
        .route("/jobs/:id/stop", post(job_stop))
        .route("/jobs/:id", get(job_get))
        .route("/jobs/:id/log", get(job_log))
        .route("/events", get(events_pull))
        .route("/events/stream", get(events_stream))
        .route("/metrics", get(metrics_render))
        .layer(Extension(state))
        .layer(ServiceBuilder::new().layer(cors))
}

/// Start the HTTP server on the specified port
pub async fn start_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let app = create_server(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    println!("🚀 Control server running on http://localhost:{port}");
    println!("💚 Health check:    http://localhost:{port}/health");
    println!("📊 Pipeline status: http://localhost:{port}/pipeline/status");
    println!("📡 Event stream:    http://localhost:{port}/events/stream");

    Server::bind(&addr).serve(app.into_make_service()).await?;

    Ok(())
}
