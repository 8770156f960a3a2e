/**
 * HTTP API - best IP, ranked results, manual runs and config editing
 *
 * ROLE:
 * Read side for DNS-sync scripts and dashboards, plus the manual trigger.
 *
 * OPERATION:
 * - axum router, JSON everywhere except /api/ip (plain text for scripts)
 * - reads take one snapshot so a response never mixes two runs
 * - POST /api/run_test takes the guard synchronously: 202 started, 429 busy
 * - PUT /api/config validates and persists; the running daemon keeps its
 *   config until restart
 *
 * SECURITY:
 * - header x-api-key required on every route except /health
 * - no key configured means every protected request is refused
 */

use crate::config::{save_config, ConfigError, KernelConfig};
use crate::models::{RecordDetail, ResultRecord};
use crate::optimizer::{Optimizer, RunReport};
use crate::state::Shared;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub optimizer: Arc<Optimizer>,
    pub config: Shared<KernelConfig>,
    pub config_path: PathBuf,
    /// Fixed at startup; a saved config changes it only after restart.
    pub api_key: Option<String>,
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("api key not configured, refusing {}", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);
    if !ok {
        warn!("rejected request to {}: bad api key", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/best_ip", get(get_best_ip))
        .route("/api/ip", get(get_ip))
        .route("/api/best", get(get_best))
        .route("/api/results", get(get_results))
        .route("/api/status", get(get_status))
        .route("/api/run_test", post(run_test))
        .route("/api/config", get(get_config).put(put_config))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

#[derive(Serialize)]
struct BestIpView {
    best_ip: String,
}

// GET /api/best_ip
async fn get_best_ip(State(app): State<AppState>) -> Result<Json<BestIpView>, StatusCode> {
    let best_ip = app.optimizer.state().best_ip().ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(BestIpView { best_ip }))
}

// GET /api/ip (plain text)
async fn get_ip(State(app): State<AppState>) -> Result<String, StatusCode> {
    app.optimizer.state().best_ip().ok_or(StatusCode::NOT_FOUND)
}

#[derive(Serialize)]
struct BestView {
    record: ResultRecord,
    detail: RecordDetail,
}

// GET /api/best
async fn get_best(State(app): State<AppState>) -> Result<Json<BestView>, StatusCode> {
    let results = app.optimizer.state().last_results();
    let first = results.first().ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(BestView { record: first.clone(), detail: first.detail() }))
}

#[derive(Debug, Deserialize)]
struct ResultsParams {
    top: Option<usize>,
}

// GET /api/results?top=N
async fn get_results(
    State(app): State<AppState>,
    Query(params): Query<ResultsParams>,
) -> Result<Json<Vec<ResultRecord>>, StatusCode> {
    let results = app.optimizer.state().last_results();
    if results.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    let take = match params.top {
        Some(n) if n > 0 => n.min(results.len()),
        _ => results.len(),
    };
    Ok(Json(results[..take].to_vec()))
}

#[derive(Serialize)]
struct StatusView {
    running: bool,
    generation: u64,
    best_ip: Option<String>,
    results: usize,
    updated_at: Option<String>,
    last_run: Option<RunReport>,
}

// GET /api/status
async fn get_status(State(app): State<AppState>) -> Json<StatusView> {
    let snap = app.optimizer.state().snapshot();
    Json(StatusView {
        running: app.optimizer.is_running(),
        generation: snap.generation,
        best_ip: snap.best_ip.clone(),
        results: snap.last_results.len(),
        updated_at: snap.updated_at.and_then(|t| t.format(&Rfc3339).ok()),
        last_run: app.optimizer.last_report(),
    })
}

#[derive(Debug, Deserialize)]
struct RunParams {
    #[serde(default)]
    wait: bool,
}

// POST /api/run_test[?wait=true]
async fn run_test(State(app): State<AppState>, Query(params): Query<RunParams>) -> Response {
    let Some(handle) = app.optimizer.try_start() else {
        return (StatusCode::TOO_MANY_REQUESTS, Json(json!({ "error": "a speed test is already running" })))
            .into_response();
    };
    info!("manual speed test started via API");

    if !params.wait {
        return (StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response();
    }
    match handle.await {
        Ok(outcome) => match RunReport::from_outcome(&outcome) {
            Some(report) => Json(report).into_response(),
            None => StatusCode::TOO_MANY_REQUESTS.into_response(),
        },
        Err(e) => {
            error!("manual run task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// GET /api/config
async fn get_config(State(app): State<AppState>) -> Json<KernelConfig> {
    Json(app.config.lock().redacted())
}

// PUT /api/config
async fn put_config(State(app): State<AppState>, Json(mut incoming): Json<KernelConfig>) -> Response {
    let current = app.config.lock().clone();
    incoming.restore_secrets(&current);

    match save_config(&app.config_path, &incoming).await {
        Ok(()) => {
            info!("config saved to {}", app.config_path.display());
            *app.config.lock() = incoming;
            Json(json!({ "saved": true, "applied_on_restart": true })).into_response()
        }
        Err(ConfigError::Invalid { field, reason }) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": format!("{field}: {reason}") }))).into_response()
        }
        Err(e) => {
            error!("failed to save config: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}
