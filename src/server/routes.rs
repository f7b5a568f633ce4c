use std::net::SocketAddr;
use std::path::Path;

use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::error::{SessionError, SupervisorError};
use crate::household::{Persona, ProfileUpdate, UserProfile};
use crate::limit::client_ip;

use super::ServerState;
use super::endpoints::{download, netflix, ping, upload, warmup};

const CLOSE_INTERNAL: u16 = 1011;
const CLOSE_UNAVAILABLE: u16 = 1013;
const CLOSE_REDIRECT: u16 = 1014;

/// API routes are registered before the static mount, so API paths always
/// win over same-named files in the client bundle.
pub(super) fn router(state: ServerState, static_dir: &Path) -> Router {
    Router::new()
        .route("/download", get(download::download))
        .route("/upload", post(upload::upload))
        .route("/ping", get(ping::ping))
        .route("/netflix-chunk", post(netflix::netflix_chunk))
        .route("/warmup/bulk-download", get(warmup::warmup_bulk_download))
        .route("/api/health", get(api_health))
        .route("/api/rate-limit-status", get(rate_limit_status))
        .route("/ws/virtual-household/{persona}", any(household_lookup))
        .route("/virtual-household/health", get(household_health))
        .route("/virtual-household/stats", get(household_stats))
        .route("/virtual-household/profiles", get(household_profiles))
        .route("/virtual-household/process-health", get(process_health))
        .route("/virtual-household/update-profile", post(update_profile))
        .route(
            "/virtual-household/stop-user-sessions/{test_id}",
            post(stop_user_sessions),
        )
        .fallback_service(ServeDir::new(static_dir).append_index_html_on_directories(true))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn api_health(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let household = state.supervisor.as_ref().map_or_else(
        || json!({ "enabled": false }),
        |supervisor| {
            let stats = supervisor.system_stats();
            json!({
                "enabled": true,
                "healthy_processes": stats.healthy_processes,
                "total_processes": stats.total_processes,
            })
        },
    );
    Json(json!({
        "status": "healthy",
        "server_mode": state.config.server_mode.as_str(),
        "upload_mode": state.config.upload.mode.as_str(),
        "tls": state.tls_enabled,
        "virtual_household": household,
    }))
}

async fn rate_limit_status(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let ip = client_ip(&headers, peer);
    Json(json!({
        "client_ip": ip.to_string(),
        "usage": state.limiter.usage(ip),
        "totals": state.limiter.stats(),
    }))
}

/// `GET /ws/virtual-household/<persona>`: tell the browser which dedicated
/// worker to open its WebSocket to. A direct WebSocket upgrade here is
/// answered with close 1014 carrying the target port, or 1013 when no
/// healthy worker exists.
async fn household_lookup(
    State(state): State<ServerState>,
    UrlPath(persona_key): UrlPath<String>,
    ConnectInfo(_peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>,
) -> Response {
    let persona = Persona::from_key(&persona_key.to_ascii_lowercase());
    let port = persona.and_then(|persona| {
        state
            .supervisor
            .as_ref()
            .filter(|supervisor| supervisor.is_running())
            .and_then(|supervisor| supervisor.port_for(persona))
    });

    if let Ok(ws) = ws {
        return ws.on_upgrade(move |socket| redirect_socket(socket, port));
    }

    let Some(persona) = persona else {
        let err = SessionError::UnknownPersona { name: persona_key };
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "redirect": false, "error": err.to_string() })),
        )
            .into_response();
    };

    match port {
        Some(port) => {
            let host = headers
                .get("host")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(':').next())
                .unwrap_or("localhost")
                .to_owned();
            let scheme = if state.tls_enabled { "wss" } else { "ws" };
            // Parse the header-derived host back through Url so a mangled
            // Host header cannot smuggle garbage into the redirect target.
            let raw = format!(
                "{}://{}:{}/ws/virtual-household/{}",
                scheme,
                host,
                port,
                persona.as_str()
            );
            let Ok(websocket_url) = url::Url::parse(&raw).map(String::from) else {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "redirect": false, "error": "Invalid Host header" })),
                )
                    .into_response();
            };
            Json(json!({
                "redirect": true,
                "websocket_url": websocket_url,
                "port": port,
                "host": host,
                "persona": persona.as_str(),
                "architecture": "multiprocess",
                "process_isolation": true,
            }))
            .into_response()
        }
        None => {
            let healthy = state
                .supervisor
                .as_ref()
                .map_or_else(Vec::new, |supervisor| supervisor.healthy_personas());
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "redirect": false,
                    "error": format!("No healthy worker for persona: {}", persona.as_str()),
                    "healthy_personas": healthy,
                })),
            )
                .into_response()
        }
    }
}

async fn redirect_socket(mut socket: WebSocket, port: Option<u16>) {
    let frame = match port {
        Some(port) => CloseFrame {
            code: CLOSE_REDIRECT,
            reason: format!("Redirect to port {}", port).into(),
        },
        None => CloseFrame {
            code: CLOSE_UNAVAILABLE,
            reason: "No healthy worker for persona".to_owned().into(),
        },
    };
    if socket.send(Message::Close(Some(frame))).await.is_err() {
        let fallback = CloseFrame {
            code: CLOSE_INTERNAL,
            reason: "Internal error".to_owned().into(),
        };
        drop(socket.send(Message::Close(Some(fallback))).await);
    }
}

async fn household_health(State(state): State<ServerState>) -> Response {
    let Some(supervisor) = state.supervisor.as_ref() else {
        return household_unavailable();
    };
    let stats = supervisor.system_stats();
    let status = if stats.healthy_processes == stats.total_processes && stats.total_processes > 0 {
        "healthy"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "multiprocess_enabled": true,
        "process_isolation": true,
        "healthy_processes": stats.healthy_processes,
        "total_processes": stats.total_processes,
        "process_health": stats.process_health,
        "supported_personas": Persona::ALL.map(Persona::as_str),
    }))
    .into_response()
}

async fn household_stats(State(state): State<ServerState>) -> Response {
    let Some(supervisor) = state.supervisor.as_ref() else {
        return household_unavailable();
    };
    let mut per_worker = serde_json::Map::new();
    for persona in Persona::ALL {
        if let Some(port) = supervisor.port_for(persona) {
            let stats = worker_get(&state, port, "/stats").await.unwrap_or_else(
                || json!({ "error": "stats unavailable" }),
            );
            per_worker.insert(persona.as_str().to_owned(), stats);
        } else {
            per_worker.insert(persona.as_str().to_owned(), json!({ "error": "unhealthy" }));
        }
    }
    Json(json!({
        "supervisor": supervisor.system_stats(),
        "workers": per_worker,
    }))
    .into_response()
}

async fn household_profiles(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let mut profiles = serde_json::Map::new();
    for persona in Persona::ALL {
        let profile = UserProfile::for_persona(persona);
        profiles.insert(
            persona.as_str().to_owned(),
            json!({
                "name": profile.name,
                "description": profile.description,
                "download_mbps": profile.download_mbps,
                "upload_mbps": profile.upload_mbps,
                "burst": profile.burst,
                "dedicated_port": persona.port(),
            }),
        );
    }
    Json(json!({
        "profiles": profiles,
        "max_concurrent_users_per_type": crate::household::WORKER_SESSION_CAPACITY,
        "multiprocess_enabled": state.supervisor.is_some(),
    }))
}

async fn process_health(State(state): State<ServerState>) -> Response {
    let Some(supervisor) = state.supervisor.as_ref() else {
        return household_unavailable();
    };
    let health = supervisor.process_health();
    let healthy = health.values().filter(|entry| entry.is_healthy).count();
    Json(json!({
        "process_health": health,
        "total_processes": health.len(),
        "healthy_processes": healthy,
        "architecture": "multiprocess",
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct UpdateProfileRelay {
    user_type: String,
    profile_updates: ProfileUpdate,
}

/// Relay an external measurement result to the matching persona worker's
/// `/update-profile`; the worker clamps and applies at tick boundaries.
async fn update_profile(
    State(state): State<ServerState>,
    Json(request): Json<UpdateProfileRelay>,
) -> Response {
    let Some(persona) = Persona::from_key(&request.user_type.to_ascii_lowercase()) else {
        let err = SessionError::UnknownPersona {
            name: request.user_type,
        };
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response();
    };
    let Some(supervisor) = state.supervisor.as_ref() else {
        return household_unavailable();
    };
    let Some(port) = supervisor.port_for(persona) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": format!("No healthy worker for {}", persona.as_str()) })),
        )
            .into_response();
    };

    let body = json!({
        "user_type": persona.as_str(),
        "profile_updates": {
            "download_mbps": request.profile_updates.download_mbps,
            "upload_mbps": request.profile_updates.upload_mbps,
            "description": request.profile_updates.description,
            "multistream": request.profile_updates.multistream,
        },
    });
    match worker_post(&state, port, "/update-profile", &body).await {
        Some(reply) => Json(json!({
            "success": true,
            "user_type": persona.as_str(),
            "worker_response": reply,
        }))
        .into_response(),
        None => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "worker did not accept the profile update" })),
        )
            .into_response(),
    }
}

/// `POST /virtual-household/stop-user-sessions/<test_id>`: fan the stop
/// signal out to every healthy worker; each worker flags its matching
/// sessions inactive and its scheduler removes them within a tick.
async fn stop_user_sessions(
    State(state): State<ServerState>,
    UrlPath(test_id): UrlPath<String>,
) -> Response {
    let Some(supervisor) = state.supervisor.as_ref() else {
        return household_unavailable();
    };
    let mut stopped: Vec<String> = Vec::new();
    for persona in Persona::ALL {
        let Some(port) = supervisor.port_for(persona) else {
            continue;
        };
        let body = json!({ "test_id": test_id, "user_type": persona.as_str() });
        if let Some(reply) = worker_post(&state, port, "/stop-session", &body).await {
            if let Some(ids) = reply.get("stopped_sessions").and_then(|ids| ids.as_array()) {
                for id in ids {
                    if let Some(id) = id.as_str() {
                        stopped.push(id.to_owned());
                    }
                }
            }
        }
    }
    tracing::info!(test_id, stopped = stopped.len(), "stop signal fanned out");
    Json(json!({
        "success": true,
        "test_id": test_id,
        "stopped_sessions": stopped,
        "stopped_count": stopped.len(),
        "server_mode": state.config.server_mode.as_str(),
    }))
    .into_response()
}

fn household_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": SupervisorError::Disabled.to_string(),
            "architecture": "unavailable",
        })),
    )
        .into_response()
}

async fn worker_get(state: &ServerState, port: u16, path: &str) -> Option<serde_json::Value> {
    let url = format!("{}://127.0.0.1:{}{}", state.worker_scheme(), port, path);
    let response = state.relay.get(&url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json().await.ok()
}

async fn worker_post(
    state: &ServerState,
    port: u16,
    path: &str,
    body: &serde_json::Value,
) -> Option<serde_json::Value> {
    let url = format!("{}://127.0.0.1:{}{}", state.worker_scheme(), port, path);
    let response = state.relay.post(&url).json(body).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json().await.ok()
}
