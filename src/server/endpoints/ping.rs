use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::time::Duration;

use axum::extract::State;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use rand::Rng;

use crate::limit::client_ip;
use crate::server::ServerState;

use super::refusal;

/// Main-surface jitter band; the isolated listener uses a tighter one.
const MAIN_JITTER_MICROS: RangeInclusive<u64> = 500..=1000;

pub(crate) fn jitter_in(range: RangeInclusive<u64>) -> Duration {
    let micros = rand::thread_rng().gen_range(range);
    Duration::from_micros(micros)
}

/// `GET /ping`: empty body, tiny randomized delay so synchronized clients
/// do not stampede, and an echo of the client's consecutive-timeout count.
pub(crate) async fn ping(
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
    respond(&headers, MAIN_JITTER_MICROS, "").await
}

pub(crate) async fn respond(
    headers: &HeaderMap,
    jitter: RangeInclusive<u64>,
    body: &'static str,
) -> Response {
    let high_priority = headers
        .get("x-priority")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == "high");
    let consecutive_timeouts = headers
        .get("x-ping-attempt")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(0);
    if consecutive_timeouts > 2 {
        tracing::warn!(consecutive_timeouts, "client reporting ping timeouts");
    }

    tokio::time::sleep(jitter_in(jitter)).await;

    (
        StatusCode::OK,
        [
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::HeaderName::from_static("x-ping-received"), "true"),
        ],
        [
            (
                header::HeaderName::from_static("x-ping-timeouts-seen"),
                consecutive_timeouts.to_string(),
            ),
            (
                header::HeaderName::from_static("x-priority-processed"),
                if high_priority { "true" } else { "false" }.to_owned(),
            ),
        ],
        body,
    )
        .into_response()
}
