//! The isolated ping listener.
//!
//! Latency probes must never queue behind bulk transfer work, so `/ping`
//! gets its own listener on a dedicated port with nothing else sharing the
//! accept loop. The handler answers with sub-millisecond jitter only.
use std::net::SocketAddr;
use std::ops::RangeInclusive;

use axum::Router;
use axum::extract::State;
use axum::extract::connect_info::ConnectInfo;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::limit::client_ip;

use super::ServerState;
use super::endpoints::{ping, refusal};

const ISOLATED_JITTER_MICROS: RangeInclusive<u64> = 250..=500;

pub(super) fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ping", get(isolated_ping))
        .route("/health", get(health))
        .route("/", get(root))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn isolated_ping(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, peer);
    if !state.limiter.is_exempt(&headers) {
        if let Err(err) = state.limiter.check_ping(ip) {
            return refusal(&err);
        }
    }
    ping::respond(&headers, ISOLATED_JITTER_MICROS, "pong").await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "server": "ping-dedicated" }))
}

async fn root() -> Response {
    Json(json!({
        "server": "dedicated ping listener",
        "purpose": "isolated latency measurements",
        "endpoints": { "/ping": "latency probe", "/health": "health check" },
    }))
    .into_response()
}
