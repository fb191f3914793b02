//! Inbound HTTP endpoint for the experiment controller.
//!
//! The platform calls `POST /rng-control` when an experiment needs a control
//! run. The call is acknowledged immediately; all work happens on the
//! controller task.

use std::future::Future;

use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use rngcontrol_core::{ControllerHandle, ControllerStatus, ExperimentRequest, Phase};

/// Shared server state.
#[derive(Clone)]
struct AppState {
    controller: ControllerHandle,
}

#[derive(Debug, Deserialize)]
struct TriggerParams {
    xp_id: Option<String>,
    user_id: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    phase: Phase,
}

/// Ids may arrive as JSON strings or numbers.
fn json_field(body: &serde_json::Value, key: &str) -> Option<String> {
    match body.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Query parameters win; a JSON body fills in whatever they leave out.
fn trigger_request(params: TriggerParams, body: &[u8]) -> ExperimentRequest {
    let json: serde_json::Value = serde_json::from_slice(body).unwrap_or_default();
    let xp_id = params.xp_id.or_else(|| json_field(&json, "xp_id"));
    let user_id = params.user_id.or_else(|| json_field(&json, "user_id"));
    ExperimentRequest::new(xp_id.unwrap_or_default(), user_id.unwrap_or_default())
}

async fn handle_trigger(
    State(state): State<AppState>,
    Query(params): Query<TriggerParams>,
    body: Bytes,
) -> &'static str {
    let request = trigger_request(params, &body);
    log::info!(
        "Received control request for experiment '{}' from user '{}'",
        request.experiment_id,
        request.requester_id
    );
    if !state.controller.trigger(request) {
        log::error!("Controller is not running, request dropped");
    }
    "OK"
}

async fn handle_status(State(state): State<AppState>) -> Json<ControllerStatus> {
    Json(state.controller.status())
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: rngcontrol_core::VERSION,
        phase: state.controller.status().phase,
    })
}

/// Build the axum router.
pub fn build_router(controller: ControllerHandle) -> Router {
    Router::new()
        .route("/rng-control", post(handle_trigger))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .with_state(AppState { controller })
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    controller: ControllerHandle,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(controller);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Bind `host:port` and serve until `shutdown` resolves.
pub async fn run_server<F>(
    controller: ControllerHandle,
    host: &str,
    port: u16,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    log::info!("Listening for control requests on {addr}");
    serve(listener, controller, shutdown).await
}
