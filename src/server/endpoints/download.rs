use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;

use crate::limit::{SlotGuard, client_ip};
use crate::pool::DataPool;
use crate::server::ServerState;

use super::refusal;

const CHUNK_BYTES: usize = 128 * 1024;

/// Inter-chunk pacing per traffic shape, all within the 1–10 ms band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum TrafficPattern {
    #[default]
    Steady,
    BurstyStreaming,
    AdaptiveStreaming,
}

impl TrafficPattern {
    pub(crate) fn parse(value: Option<&str>) -> Self {
        match value {
            Some("bursty_streaming" | "bursty") => Self::BurstyStreaming,
            Some("adaptive_streaming" | "adaptive") => Self::AdaptiveStreaming,
            Some(_) | None => Self::Steady,
        }
    }

    /// Sleep applied after chunk number `count`, if any.
    pub(crate) fn pause_after(self, count: u64) -> Option<Duration> {
        match self {
            Self::Steady => (count.checked_rem(20) == Some(0)).then(|| Duration::from_millis(5)),
            Self::BurstyStreaming => {
                if count.checked_rem(10) == Some(0) {
                    Some(Duration::from_millis(10))
                } else {
                    Some(Duration::from_millis(1))
                }
            }
            Self::AdaptiveStreaming => Some(Duration::from_millis(2)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadQuery {
    pattern: Option<String>,
}

/// `GET /download`: stream 128 KiB chunks indefinitely. The stream yields
/// between chunks; peer disconnect drops the body and the slot guard with
/// it, releasing the connection and folding observed bytes into the hourly
/// bandwidth history.
pub(crate) async fn download(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let ip = client_ip(&headers, peer);
    let guard = if state.limiter.is_exempt(&headers) {
        None
    } else {
        match state.limiter.acquire_download(ip, true) {
            Ok(guard) => Some(guard),
            Err(err) => return refusal(&err),
        }
    };
    let pattern = TrafficPattern::parse(query.pattern.as_deref());
    tracing::debug!(%ip, ?pattern, "download stream started");
    stream_response(Arc::clone(&state.pool), guard, pattern, ChunkSource::Bulk)
}

pub(crate) enum ChunkSource {
    Bulk,
    Warmup,
}

struct StreamState {
    pool: Arc<DataPool>,
    guard: Option<SlotGuard>,
    pattern: TrafficPattern,
    source: ChunkSource,
    count: u64,
}

/// Shared by `/download` and `/warmup/bulk-download`.
pub(crate) fn stream_response(
    pool: Arc<DataPool>,
    guard: Option<SlotGuard>,
    pattern: TrafficPattern,
    source: ChunkSource,
) -> Response {
    let stream = futures_util::stream::unfold(
        StreamState {
            pool,
            guard,
            pattern,
            source,
            count: 0,
        },
        |mut state| async move {
            if state.count > 0 {
                match state.source {
                    // Warmup uses fixed 1 ms pacing for capacity estimation.
                    ChunkSource::Warmup => tokio::time::sleep(Duration::from_millis(1)).await,
                    ChunkSource::Bulk => match state.pattern.pause_after(state.count) {
                        Some(pause) => tokio::time::sleep(pause).await,
                        None => tokio::task::yield_now().await,
                    },
                }
            }
            state.count = state.count.saturating_add(1);
            let chunk = match state.source {
                ChunkSource::Bulk => state.pool.get_bulk(CHUNK_BYTES),
                ChunkSource::Warmup => state.pool.get_warmup_chunk(state.count),
            };
            if let Some(guard) = state.guard.as_ref() {
                guard.add_bytes(chunk.len() as u64);
            }
            Some((Ok::<Bytes, std::io::Error>(chunk), state))
        },
    );

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
