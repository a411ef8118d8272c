//! HTTP handlers for the REST API

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::instrument;

use crate::controller::{ControllerState, SignalSnapshot, SignalType};

use super::dto::{ErrorResponse, HealthResponse, ReadyResponse, StatusResponse};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Liveness probe
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe. A standby replica is ready right away; the leader once
/// every signal that is not paused has completed a pass.
#[instrument(skip(state))]
pub async fn ready(State(state): State<Arc<ControllerState>>) -> (StatusCode, Json<ReadyResponse>) {
    let leader = state.is_leader.load(Ordering::Relaxed);
    let completed = state.snapshots().await;
    let overrides = state.overrides.read().await.clone();

    let ready = !leader
        || SignalType::ALL.iter().all(|signal| {
            overrides.signal_paused(*signal) || completed.iter().any(|s| s.signal == signal.as_str())
        });

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(ReadyResponse { ready, leader }))
}

/// Outcome of the last pass of every signal
#[instrument(skip(state))]
pub async fn status(State(state): State<Arc<ControllerState>>) -> Json<StatusResponse> {
    let overrides = state.overrides.read().await.clone();
    Json(StatusResponse {
        leader: state.is_leader.load(Ordering::Relaxed),
        dry_run: state.settings.dry_run,
        paused: SignalType::ALL
            .iter()
            .filter(|s| overrides.signal_paused(**s))
            .map(|s| s.as_str().to_string())
            .collect(),
        signals: state.snapshots().await,
    })
}

/// Outcome of the last pass of one signal
#[instrument(skip(state), fields(signal = %signal))]
pub async fn signal_status(
    State(state): State<Arc<ControllerState>>,
    Path(signal): Path<String>,
) -> Result<Json<SignalSnapshot>, ApiError> {
    if !SignalType::ALL.iter().any(|s| s.as_str() == signal) {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "unknown_signal",
                &format!("Unknown signal {signal:?}, expected one of log, trace, metric"),
            )),
        ));
    }

    state
        .snapshots()
        .await
        .into_iter()
        .find(|s| s.signal == signal)
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new(
                    "not_reconciled",
                    &format!("No {signal} pass has completed yet"),
                )),
            )
        })
}
