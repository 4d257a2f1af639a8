//! HTTP endpoint server using Axum

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};

use crate::core::dispatcher::{Dispatcher, UpsertOutcome, UpsertRequest};
use crate::error::EngineError;
use crate::metrics::Metrics;
use crate::models::group::GroupSpec;
use crate::models::instance::{InstanceView, SessionConditions, StateTransition};
use crate::models::snapshot::IndicatorSnapshot;
use crate::services::feed::SnapshotSender;

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<RwLock<HealthStatus>>,
    pub metrics: Arc<Metrics>,
    pub start_time: Arc<Instant>,
    pub dispatcher: Arc<Dispatcher>,
    pub snapshots: SnapshotSender,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, metrics: Arc<Metrics>, snapshots: SnapshotSender) -> Self {
        Self {
            health: Arc::new(RwLock::new(HealthStatus::default())),
            metrics,
            start_time: Arc::new(Instant::now()),
            dispatcher,
            snapshots,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HealthStatus {
    pub status: String,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            EngineError::Configuration(e) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "error": e.to_string(), "field": e.field() }),
            ),
            EngineError::NotFound { .. } => {
                (StatusCode::NOT_FOUND, json!({ "error": self.to_string() }))
            }
            EngineError::InvalidTransition { .. } | EngineError::Fault(_) => {
                (StatusCode::CONFLICT, json!({ "error": self.to_string() }))
            }
        };
        (status, Json(body)).into_response()
    }
}

pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let health = state.health.read().await;
    let uptime_seconds = state.start_time.elapsed().as_secs();
    Ok(Json(json!({
        "status": health.status,
        "uptime_seconds": uptime_seconds,
        "service": "tripwire-condition-engine",
        "instances": state.dispatcher.len().await
    })))
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    state.metrics.export().map_err(|e| {
        error!(error = %e, "Failed to export metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Middleware to track HTTP request metrics
async fn metrics_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    state.metrics.http_requests_in_flight.inc();
    let response = next.run(request).await;
    let status = response.status();
    let duration = start.elapsed();
    state.metrics.http_requests_in_flight.dec();

    state.metrics.http_requests_total.inc();
    state
        .metrics
        .http_request_duration_seconds
        .observe(duration.as_secs_f64());

    if status.is_server_error() {
        error!(
            method = %method,
            path = %path,
            status = %status,
            duration_ms = duration.as_millis(),
            "HTTP request error"
        );
    }

    response
}

#[derive(Debug, Deserialize)]
struct SymbolQuery {
    symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceRequest {
    strategy_id: String,
    symbol: String,
    #[serde(default)]
    groups: Vec<GroupSpec>,
    #[serde(default)]
    reset: bool,
    #[serde(default)]
    arm: bool,
}

/// Condition state of every instance in a session
async fn session_conditions(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<SymbolQuery>,
) -> Json<SessionConditions> {
    Json(
        state
            .dispatcher
            .session_conditions(&session_id, params.symbol.as_deref())
            .await,
    )
}

/// Create or reconfigure an instance in a session
async fn upsert_instance(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<InstanceRequest>,
) -> Result<Json<UpsertOutcome>, EngineError> {
    let outcome = state
        .dispatcher
        .upsert(UpsertRequest {
            session_id,
            strategy_id: request.strategy_id,
            symbol: request.symbol,
            groups: request.groups,
            reset: request.reset,
            arm: request.arm,
        })
        .await?;
    Ok(Json(outcome))
}

async fn list_instances(
    State(state): State<AppState>,
    Query(params): Query<SymbolQuery>,
) -> Json<Vec<InstanceView>> {
    let instances = state.dispatcher.list(params.symbol.as_deref()).await;
    Json(instances.iter().map(|instance| instance.view()).collect())
}

async fn get_instance(
    State(state): State<AppState>,
    Path((strategy_id, symbol)): Path<(String, String)>,
) -> Result<Json<InstanceView>, EngineError> {
    state
        .dispatcher
        .get(&strategy_id, &symbol)
        .await
        .map(|instance| Json(instance.view()))
        .ok_or_else(|| EngineError::not_found(&strategy_id, &symbol))
}

async fn delete_instance(
    State(state): State<AppState>,
    Path((strategy_id, symbol)): Path<(String, String)>,
) -> Result<StatusCode, EngineError> {
    state.dispatcher.remove(&strategy_id, &symbol).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn arm_instance(
    State(state): State<AppState>,
    Path((strategy_id, symbol)): Path<(String, String)>,
) -> Result<Json<StateTransition>, EngineError> {
    Ok(Json(state.dispatcher.arm(&strategy_id, &symbol).await?))
}

async fn reset_instance(
    State(state): State<AppState>,
    Path((strategy_id, symbol)): Path<(String, String)>,
) -> Result<Json<StateTransition>, EngineError> {
    Ok(Json(state.dispatcher.reset(&strategy_id, &symbol).await?))
}

/// Queue a snapshot from the indicator provider
async fn submit_snapshot(
    State(state): State<AppState>,
    Json(snapshot): Json<IndicatorSnapshot>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    let symbol = snapshot.symbol.clone();
    state.snapshots.submit(snapshot).map_err(|e| {
        error!(symbol = %symbol, error = %e, "Rejected snapshot");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        )
    })?;
    Ok(StatusCode::ACCEPTED)
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/sessions/{session_id}/conditions", get(session_conditions))
        .route("/api/sessions/{session_id}/instances", put(upsert_instance))
        .route("/api/instances", get(list_instances))
        .route(
            "/api/instances/{strategy_id}/{symbol}",
            get(get_instance).delete(delete_instance),
        )
        .route("/api/instances/{strategy_id}/{symbol}/arm", post(arm_instance))
        .route("/api/instances/{strategy_id}/{symbol}/reset", post(reset_instance))
        .route("/api/snapshots", post(submit_snapshot))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    metrics_middleware,
                ))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

pub async fn start_server(port: u16, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!(port = port, "HTTP server listening on port {}", port);
    info!(
        "Metrics endpoint available at http://0.0.0.0:{}/metrics",
        port
    );
    axum::serve(listener, app).await?;

    Ok(())
}
