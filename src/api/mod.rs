//! HTTP API for wallet UI and transaction history consumers

use crate::config::ApiConfig;
use crate::error::{ErrorKind, PipelineError};
use crate::ledger::Ledger;
use crate::pipeline::TransactionPipeline;
use crate::tx::fees::MAX_HISTORY_WINDOW;
use crate::tx::{BuildOverrides, TransferRequest};
use crate::types::{Priority, SignedTransaction};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

const DEFAULT_HISTORY_WINDOW: u64 = 20;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<TransactionPipeline>,
}

pub fn router(pipeline: Arc<TransactionPipeline>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/fees/:ledger", get(get_fee_estimate))
        .route("/fees/:ledger/history", get(get_fee_history))
        .route("/transactions", get(list_in_flight))
        .route("/transactions/build", post(build_transaction))
        .route("/transactions/broadcast", post(broadcast_transaction))
        .route("/transactions/:hash", get(get_transaction))
        .route("/transactions/:hash/monitor", delete(stop_monitoring))
        .route("/monitoring", get(list_monitoring))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(AppState { pipeline })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, pipeline: Arc<TransactionPipeline>) -> Result<()> {
    let app = router(pipeline);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server on {}", addr))?;
    axum::serve(listener, app).await.context("API server stopped")?;

    Ok(())
}

/// Pipeline error rendered as JSON with a status derived from its kind
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::Input => StatusCode::BAD_REQUEST,
            ErrorKind::Resource => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Capability => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::State => StatusCode::NOT_FOUND,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: format!("{:?}", kind).to_lowercase(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - every configured ledger node answers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.pipeline.health_check().await;
    let ready = !health.is_empty() && health.iter().all(|(_, healthy)| *healthy);

    let response = ReadinessResponse {
        ready,
        ledgers: health
            .into_iter()
            .map(|(ledger, healthy)| LedgerHealth { ledger, healthy })
            .collect(),
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

#[derive(Debug, Deserialize)]
struct FeeQuery {
    #[serde(default)]
    priority: Priority,
}

async fn get_fee_estimate(
    State(state): State<AppState>,
    Path(ledger): Path<Ledger>,
    Query(query): Query<FeeQuery>,
) -> ApiResult<crate::types::FeeEstimate> {
    Ok(Json(
        state.pipeline.estimate_fee(ledger, query.priority).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    window: Option<u64>,
}

async fn get_fee_history(
    State(state): State<AppState>,
    Path(ledger): Path<Ledger>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<crate::tx::FeeStatistics> {
    let window = query
        .window
        .unwrap_or(DEFAULT_HISTORY_WINDOW)
        .clamp(1, MAX_HISTORY_WINDOW);
    Ok(Json(state.pipeline.fee_history(ledger, window).await?))
}

#[derive(Debug, Deserialize)]
struct BuildRequest {
    ledger: Ledger,
    from: String,
    to: String,
    amount: u128,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    overrides: BuildOverrides,
}

async fn build_transaction(
    State(state): State<AppState>,
    Json(request): Json<BuildRequest>,
) -> ApiResult<crate::types::UnsignedTransaction> {
    let transfer = TransferRequest::new(request.from, request.to, request.amount)
        .with_priority(request.priority)
        .with_overrides(request.overrides);
    Ok(Json(state.pipeline.build(request.ledger, &transfer).await?))
}

async fn broadcast_transaction(
    State(state): State<AppState>,
    Json(transaction): Json<SignedTransaction>,
) -> ApiResult<crate::types::BroadcastResult> {
    Ok(Json(state.pipeline.broadcast(transaction).await?))
}

async fn list_in_flight(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.in_flight())
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<crate::types::BroadcastResult> {
    Ok(Json(state.pipeline.get_status(&hash).await?))
}

async fn stop_monitoring(State(state): State<AppState>, Path(hash): Path<String>) -> StatusCode {
    if state.pipeline.stop_monitoring(&hash) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn list_monitoring(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.monitoring_tasks())
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    ledgers: Vec<LedgerHealth>,
}

#[derive(Serialize)]
struct LedgerHealth {
    ledger: Ledger,
    healthy: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: String,
    retryable: bool,
}
