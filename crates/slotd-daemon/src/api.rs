//! Localhost control API.
//!
//! A thin HTTP skin over the orchestrator. The deploy handler holds
//! the pipeline for its full duration, so clients must tolerate
//! responses taking up to the health budget plus the drain budget plus
//! setup time.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use slotd_core::persist::STAGING_SLOT;

use crate::deploy::{self, DeployError};
use crate::state::Orchestrator;

/// `POST /deploy` request body.
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    /// Full commit hash to deploy.
    #[serde(default)]
    pub commit: String,
}

/// Envelope for `POST /deploy`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DeployResponse {
    /// Whether a promotion happened.
    pub success: bool,
    /// Slot basename now live.
    pub slot: String,
    /// Commit now live.
    pub commit: String,
    /// Commit that was live before, empty for the first deploy.
    pub previous_commit: String,
    /// Failure detail, omitted on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Envelope for `POST /rollback`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RollbackResponse {
    /// Whether the rollback promoted.
    pub success: bool,
    /// Slot basename now live.
    pub slot: String,
    /// Commit now live.
    pub commit: String,
    /// Failure detail, omitted on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Envelope for `GET /status`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Live slot basename, empty when nothing is live.
    pub live_slot: String,
    /// Live commit, empty when nothing is live.
    pub live_commit: String,
    /// Previous slot basename, empty when there is none.
    pub previous_slot: String,
    /// Previous commit, empty when there is none.
    pub previous_commit: String,
    /// Always `slot-staging`.
    pub staging_dir: String,
    /// RFC3339 time of the last promotion, empty before the first.
    pub last_deploy_time: String,
    /// Mirrors the live slot's `alive` flag.
    pub healthy: bool,
}

/// Build the control API router.
pub fn router(orch: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/deploy", post(handle_deploy))
        .route("/rollback", post(handle_rollback))
        .route("/status", get(handle_status))
        .with_state(orch)
}

async fn handle_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn handle_deploy(State(orch): State<Arc<Orchestrator>>, body: Bytes) -> Response {
    let commit = serde_json::from_slice::<DeployRequest>(&body)
        .map(|req| req.commit)
        .unwrap_or_default();
    if commit.is_empty() {
        return reply(
            StatusCode::BAD_REQUEST,
            DeployResponse {
                error: "missing commit".to_string(),
                ..DeployResponse::default()
            },
        );
    }

    match deploy::deploy(&orch, &commit).await {
        Ok(promotion) => reply(
            StatusCode::OK,
            DeployResponse {
                success: true,
                slot: promotion.slot,
                commit: promotion.commit,
                previous_commit: promotion.previous_commit,
                error: String::new(),
            },
        ),
        // The deploy was observed and rejected, not a control-plane
        // error: 200 with success=false, old state untouched.
        Err(DeployError::Unhealthy) => reply(StatusCode::OK, DeployResponse::default()),
        Err(err @ DeployError::Busy) => reply(
            StatusCode::CONFLICT,
            DeployResponse {
                error: err.to_string(),
                ..DeployResponse::default()
            },
        ),
        Err(err) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            DeployResponse {
                error: err.to_string(),
                ..DeployResponse::default()
            },
        ),
    }
}

async fn handle_rollback(State(orch): State<Arc<Orchestrator>>) -> Response {
    match deploy::rollback(&orch).await {
        Ok(promotion) => reply(
            StatusCode::OK,
            RollbackResponse {
                success: true,
                slot: promotion.slot,
                commit: promotion.commit,
                error: String::new(),
            },
        ),
        Err(err @ DeployError::Busy) => reply(
            StatusCode::CONFLICT,
            RollbackResponse {
                error: err.to_string(),
                ..RollbackResponse::default()
            },
        ),
        Err(err @ DeployError::NoPrevious) => reply(
            StatusCode::BAD_REQUEST,
            RollbackResponse {
                error: err.to_string(),
                ..RollbackResponse::default()
            },
        ),
        Err(err) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            RollbackResponse {
                error: err.to_string(),
                ..RollbackResponse::default()
            },
        ),
    }
}

async fn handle_status(State(orch): State<Arc<Orchestrator>>) -> Json<StatusResponse> {
    let snapshot = orch.snapshot();

    let mut status = StatusResponse {
        staging_dir: STAGING_SLOT.to_string(),
        ..StatusResponse::default()
    };
    if let Some(live) = &snapshot.live {
        status.live_slot = live.name();
        status.live_commit = live.commit().to_string();
        status.healthy = live.is_alive();
    }
    if let Some(prev) = &snapshot.prev {
        status.previous_slot = prev.name();
        status.previous_commit = prev.commit().to_string();
    }
    if let Some(time) = snapshot.last_deploy {
        status.last_deploy_time = time.to_rfc3339_opts(SecondsFormat::Secs, true);
    }

    Json(status)
}

fn reply<T: Serialize>(status: StatusCode, body: T) -> Response {
    (status, Json(body)).into_response()
}
