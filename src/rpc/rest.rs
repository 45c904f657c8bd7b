//! Local REST surface.
//!
//! Read endpoints serve committed state straight from the KV store; the
//! only write path is `submit-tx`, which goes through mempool admission and
//! never touches the state machine directly.

use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info};

use crate::consensus::adapter::HealthFlags;
use crate::consensus::app::AccountView;
use crate::error::ChainError;
use crate::mempool::AdmissionController;
use crate::metrics::{inc, Metrics};
use crate::net::{MeshPublisher, TOPIC_TRANSACTIONS};
use crate::state::Account;
use crate::storage::ChainDb;
use crate::types::{Address, Hash32, Height, Transaction};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<ChainDb>,
    pub admission: Arc<AdmissionController>,
    pub metrics: Arc<Metrics>,
    pub health: Arc<HealthFlags>,
    /// Present when the mesh bridge is up; admitted transactions are
    /// re-broadcast to peers.
    pub publisher: Option<MeshPublisher>,
    pub chain_id: String,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/blocks/latest", get(latest_block))
        .route("/api/v1/blocks/:height", get(block_by_height))
        .route("/api/v1/transactions/:hash", get(transaction_by_hash))
        .route("/api/v1/accounts/:address", get(account_by_address))
        .route("/api/v1/submit-tx", post(submit_tx))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the root token cancels.
pub async fn serve(
    addr: String,
    state: ApiState,
    cancel: CancellationToken,
) -> Result<(), ChainError> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ChainError::Transient(format!("api bind {addr}: {e}")))?;
    info!(%addr, "REST API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ChainError::Transient(format!("api server: {e}")))
}

async fn health(State(state): State<ApiState>) -> Response {
    inc(&state.metrics.api_requests);
    let status = state.health.status();
    let height = state.db.latest_height().unwrap_or(0);
    let body = serde_json::json!({
        "status": status,
        "height": height,
        "mempool": state.admission.len(),
        "chain_id": state.chain_id,
    });
    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body)).into_response()
}

async fn metrics(State(state): State<ApiState>) -> Response {
    inc(&state.metrics.api_requests);
    Json(state.metrics.snapshot()).into_response()
}

async fn latest_block(State(state): State<ApiState>) -> Response {
    inc(&state.metrics.api_requests);
    match state.db.latest_block() {
        Ok(block) => Json(block).into_response(),
        Err(ChainError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, "no blocks committed").into_response()
        }
        Err(e) => internal(e),
    }
}

async fn block_by_height(
    State(state): State<ApiState>,
    Path(height): Path<String>,
) -> Response {
    inc(&state.metrics.api_requests);
    let Ok(height) = height.parse::<Height>() else {
        return (StatusCode::BAD_REQUEST, "invalid block height").into_response();
    };
    match state.db.block(height) {
        Ok(block) => Json(block).into_response(),
        Err(ChainError::NotFound(_)) => (StatusCode::NOT_FOUND, "block not found").into_response(),
        Err(e) => internal(e),
    }
}

async fn transaction_by_hash(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
) -> Response {
    inc(&state.metrics.api_requests);
    let Some(hash) = Hash32::from_hex(&hash) else {
        return (StatusCode::NOT_FOUND, "transaction not found").into_response();
    };
    match state.db.transaction(&hash) {
        Ok(tx) => Json(tx).into_response(),
        Err(ChainError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, "transaction not found").into_response()
        }
        Err(e) => internal(e),
    }
}

async fn account_by_address(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Response {
    inc(&state.metrics.api_requests);
    let Some(addr) = Address::from_hex(&address) else {
        return (StatusCode::BAD_REQUEST, "invalid address").into_response();
    };
    let account = match state.db.account_bytes(&addr) {
        Ok(Some(bytes)) => match serde_json::from_slice::<Account>(&bytes) {
            Ok(account) => account,
            Err(e) => return internal(ChainError::StorageCorrupt(e.to_string())),
        },
        Ok(None) => Account::default(),
        Err(e) => return internal(e),
    };
    Json(AccountView::new(addr, &account)).into_response()
}

async fn submit_tx(State(state): State<ApiState>, body: Result<Json<Transaction>, axum::extract::rejection::JsonRejection>) -> Response {
    inc(&state.metrics.api_requests);
    let Json(tx) = match body {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "success": false, "error": e.to_string() })),
            )
                .into_response();
        }
    };

    match state.admission.submit(tx.clone()) {
        Ok(hash) => {
            if let Some(publisher) = &state.publisher {
                match serde_json::to_value(&tx) {
                    Ok(value) => {
                        if let Err(e) = publisher.publish(TOPIC_TRANSACTIONS, value) {
                            debug!(error = %e, "tx rebroadcast dropped");
                        }
                    }
                    Err(e) => debug!(error = %e, "tx rebroadcast encode failed"),
                }
            }
            Json(serde_json::json!({ "success": true, "hash": hash })).into_response()
        }
        Err(e) if e.is_fatal() => internal(e),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn internal(e: ChainError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}
