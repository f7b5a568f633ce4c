use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::connect_info::ConnectInfo;
use axum::http::HeaderMap;
use axum::response::Response;

use crate::limit::client_ip;
use crate::server::ServerState;

use super::download::{ChunkSource, TrafficPattern, stream_response};
use super::refusal;

/// `GET /warmup/bulk-download`: capacity estimation ahead of a household
/// test. Same shape as `/download` but drawn from the warmup pool with a
/// fixed 1 ms inter-chunk pacing. Holds a concurrent download slot and
/// counts bandwidth, but is not one of the hourly download tests.
pub(crate) async fn warmup_bulk_download(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, peer);
    let guard = if state.limiter.is_exempt(&headers) {
        None
    } else {
        match state.limiter.acquire_download(ip, false) {
            Ok(guard) => Some(guard),
            Err(err) => return refusal(&err),
        }
    };
    tracing::debug!(%ip, "warmup stream started");
    stream_response(
        Arc::clone(&state.pool),
        guard,
        TrafficPattern::Steady,
        ChunkSource::Warmup,
    )
}
