//! Operator routes under `/internal`, plus `/health`.

use std::sync::Arc;

use arenabridge_core::Error;
use arenabridge_pool::{BattleTarget, CapturePolicy, CaptureTarget, Mode};
use arenabridge_relay::{parse_model_list, CaptureRequest, Command};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/id-capture/start", post(start_capture))
        .route("/id-capture/cancel", post(cancel_capture))
        .route("/model-update", post(model_update))
        .route("/available-models", get(available_models))
        .route("/reload", post(reload))
        .route("/refresh", post(refresh))
        .route("/status", get(status))
}

// ---------------------------------------------------------------
// ID capture
// ---------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct CaptureStartRequest {
    /// Absent means the global default tuple.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub battle_target: Option<BattleTarget>,
    #[serde(default)]
    pub policy: CapturePolicy,
    /// Block until captured or timed out.
    #[serde(default)]
    pub wait: bool,
}

impl CaptureStartRequest {
    fn into_capture(self) -> CaptureRequest {
        let mode = self.mode.unwrap_or(Mode::DirectChat);
        CaptureRequest {
            target: match self.model {
                Some(name) if !name.trim().is_empty() => CaptureTarget::Model(name),
                _ => CaptureTarget::Global,
            },
            mode,
            battle_target: match mode {
                Mode::Battle => Some(self.battle_target.unwrap_or(BattleTarget::A)),
                Mode::DirectChat => None,
            },
            policy: self.policy,
        }
    }
}

async fn start_capture(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    // An empty body arms a global capture.
    let body: CaptureStartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CaptureStartRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| Error::InvalidRequest(e.to_string()))?
    };
    let wait = body.wait;
    let request = body.into_capture();
    let target = request.target.to_string();
    let timeout = state.config.read().capture_timeout();

    let ticket = state.registry.activate_capture(request, timeout)?;
    info!("ID capture armed for {}", target);

    if !wait {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "capturing",
                "target": target,
                "timeoutSecs": timeout.as_secs(),
            })),
        ));
    }

    let tuple = ticket.wait().await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "captured",
            "target": target,
            "tuple": tuple,
        })),
    ))
}

async fn cancel_capture(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let cancelled = state.registry.deactivate_capture();
    Json(json!({ "cancelled": cancelled }))
}

// ---------------------------------------------------------------
// Model list update
// ---------------------------------------------------------------

async fn model_update(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let timeout = state.config.read().page_content_timeout();
    let content = state.registry.request_page_content(timeout).await?;
    let models = parse_model_list(&content)?;
    state.save_available_models(models.clone())?;
    Ok(Json(json!({
        "count": models.len(),
        "models": models,
    })))
}

async fn available_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let models = state.available_models.read();
    Json(json!({
        "count": models.len(),
        "models": *models,
    }))
}

// ---------------------------------------------------------------
// Reload / refresh
// ---------------------------------------------------------------

async fn reload(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let summary = state.reload()?;
    Ok(Json(summary))
}

async fn refresh(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let sent = state.registry.broadcast(&Command::Refresh)?;
    if sent == 0 {
        return Err(Error::NoWorkerAvailable.into());
    }
    info!("Refresh sent to {} worker(s)", sent);
    Ok(Json(json!({ "refreshed": sent })))
}

// ---------------------------------------------------------------
// Status
// ---------------------------------------------------------------

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let relay = state.registry.status();
    let pool = state.pool.summary();
    Json(json!({
        "startedAt": state.started_at.to_rfc3339(),
        "relay": relay,
        "pool": pool,
        "catalogModels": state.catalog.read().len(),
    }))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let relay = state.registry.status();
    Json(json!({
        "status": "ok",
        "workers": relay.workers,
        "activeCorrelations": relay.active_correlations,
        "captureActive": relay.capture_active,
    }))
}
