use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::SessionError;
use crate::household::{Persona, ProfileUpdate};

use super::WorkerState;
use super::ws::household_endpoint;

pub(super) fn router(state: WorkerState) -> Router {
    Router::new()
        .route("/ws/virtual-household/{persona}", any(household_endpoint))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/update-profile", post(update_profile))
        .route("/stop-session", post(stop_session))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health(State(state): State<WorkerState>) -> Json<serde_json::Value> {
    let stats = state.engine.stats();
    Json(json!({
        "status": "healthy",
        "persona": state.persona.as_str(),
        "port": state.port,
        "active_sessions": stats.active_sessions,
        "max_capacity": stats.max_sessions,
        "uptime_seconds": stats.uptime_seconds,
        "total_connections": stats.total_connections,
        "process_isolation": true,
    }))
}

async fn stats(State(state): State<WorkerState>) -> Json<serde_json::Value> {
    let engine_stats = state.engine.stats();
    let sessions = state.engine.session_metrics();
    let limiter = state.limiter.stats();
    Json(json!({
        "engine": engine_stats,
        "sessions": sessions,
        "rate_limiter": limiter,
        "persona": state.persona.as_str(),
        "port": state.port,
    }))
}

#[derive(Debug, Deserialize)]
struct UpdateProfileRequest {
    user_type: String,
    profile_updates: ProfileUpdate,
}

/// Runtime profile adjustment relayed by the main server. Only this
/// worker's persona is accepted; rates clamp to the adaptive ceiling and
/// live sessions pick the change up at their next tick boundary.
async fn update_profile(
    State(state): State<WorkerState>,
    Json(request): Json<UpdateProfileRequest>,
) -> Response {
    let requested = request.user_type.to_ascii_lowercase();
    if Persona::from_key(&requested) != Some(state.persona) {
        let err = SessionError::WrongPersona {
            expected: state.persona.as_str().to_owned(),
            got: requested,
        };
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() })))
            .into_response();
    }
    if request.profile_updates.is_empty() {
        let err = SessionError::InvalidUpdate {
            reason: "no profile_updates provided".to_owned(),
        };
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() })))
            .into_response();
    }
    let updated_sessions = state.engine.update_profile(&request.profile_updates);
    let profile = state.engine.default_profile();
    Json(json!({
        "success": true,
        "message": format!("{} profile updated", state.persona.as_str()),
        "user_type": state.persona.as_str(),
        "updated_sessions": updated_sessions,
        "download_mbps": profile.download_mbps,
        "upload_mbps": profile.upload_mbps,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct StopSessionRequest {
    session_id: Option<String>,
    test_id: Option<String>,
    user_type: Option<String>,
    reason: Option<String>,
}

/// Stop sessions on this worker, either one by id or every session whose
/// timestamp suffix matches a test id. Matches are flagged inactive; the
/// scheduler's cleanup phase removes them within one tick.
async fn stop_session(
    State(state): State<WorkerState>,
    Json(request): Json<StopSessionRequest>,
) -> Response {
    if let Some(user_type) = request.user_type.as_deref() {
        let requested = user_type.to_ascii_lowercase();
        if Persona::from_key(&requested) != Some(state.persona) {
            let err = SessionError::WrongPersona {
                expected: state.persona.as_str().to_owned(),
                got: requested,
            };
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() })))
                .into_response();
        }
    }

    let mut stopped: Vec<String> = Vec::new();
    if let Some(test_id) = request.test_id.as_deref() {
        stopped.extend(state.engine.stop_matching_sessions(test_id));
    }
    if let Some(session_id) = request.session_id.as_deref() {
        match state.engine.get(session_id) {
            Some(session) => {
                session.mark_inactive();
                if !stopped.iter().any(|id| id == session_id) {
                    stopped.push(session_id.to_owned());
                }
            }
            None => {
                let err = SessionError::NotFound {
                    id: session_id.to_owned(),
                };
                tracing::debug!(persona = %state.persona, error = %err, "stop-session miss");
            }
        }
    }

    let reason = request.reason.unwrap_or_else(|| "client_request".to_owned());
    tracing::info!(
        persona = %state.persona,
        stopped = stopped.len(),
        reason,
        "stop-session request handled"
    );
    Json(json!({
        "success": !stopped.is_empty(),
        "stopped_sessions": stopped,
        "stopped_count": stopped.len(),
        "user_type": state.persona.as_str(),
        "reason": reason,
    }))
    .into_response()
}
