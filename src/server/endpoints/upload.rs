use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use futures_util::StreamExt;
use serde_json::json;

use crate::limit::client_ip;
use crate::server::ServerState;

use super::refusal;

const RATE_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// How long to sleep to hold intake at the ceiling, if at all. Pure so the
/// throttle math is testable; `None` means the sample stays untouched.
pub(crate) fn throttle_delay(
    bytes_since_check: u64,
    elapsed: Duration,
    ceiling_bytes_per_sec: u64,
) -> Option<Duration> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || ceiling_bytes_per_sec == 0 {
        return None;
    }
    let rate = bytes_since_check as f64 / secs;
    if rate <= ceiling_bytes_per_sec as f64 {
        return None;
    }
    let target_secs = bytes_since_check as f64 / ceiling_bytes_per_sec as f64;
    let delay = target_secs - secs;
    (delay > 0.0).then(|| Duration::from_secs_f64(delay))
}

/// `POST /upload`: count and discard the streamed body. Intake is only
/// slowed past the absolute mode ceiling; everything below it runs at
/// whatever the transport delivers.
pub(crate) async fn upload(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: Request,
) -> Response {
    let ip = client_ip(&headers, peer);
    let _guard = if state.limiter.is_exempt(&headers) {
        None
    } else {
        match state.limiter.acquire_upload(ip) {
            Ok(guard) => Some(guard),
            Err(err) => return refusal(&err),
        }
    };

    let max_request_bytes = state.config.upload.max_request_bytes;
    let ceiling = state.config.upload.mode.ceiling_bytes_per_sec();

    let mut body = request.into_body().into_data_stream();
    let started = Instant::now();
    let mut total_bytes: u64 = 0;
    let mut last_rate_check = started;
    let mut bytes_since_check: u64 = 0;

    while let Some(next) = body.next().await {
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(err) => {
                // Peer went away mid-upload: normal termination, count what
                // arrived.
                tracing::debug!(%ip, error = %err, "upload body ended early");
                break;
            }
        };
        let len = chunk.len() as u64;
        total_bytes = total_bytes.saturating_add(len);
        bytes_since_check = bytes_since_check.saturating_add(len);
        drop(chunk);

        if total_bytes > max_request_bytes {
            tracing::warn!(%ip, total_bytes, "upload over the request cap");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": "Request too large" })),
            )
                .into_response();
        }

        let since_check = last_rate_check.elapsed();
        if since_check >= RATE_SAMPLE_INTERVAL {
            if let Some(delay) = throttle_delay(bytes_since_check, since_check, ceiling) {
                tracing::warn!(
                    %ip,
                    delay_ms = %delay.as_millis(),
                    "upload intake above ceiling, shaping"
                );
                tokio::time::sleep(delay).await;
            }
            bytes_since_check = 0;
            last_rate_check = Instant::now();
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        let mbps = (total_bytes as f64 * 8.0) / (elapsed * 1_000_000.0);
        tracing::debug!(%ip, total_bytes, mbps = format_args!("{:.1}", mbps), "upload complete");
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        String::new(),
    )
        .into_response()
}
