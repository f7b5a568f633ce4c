use std::net::SocketAddr;

use axum::extract::State;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use crate::limit::client_ip;
use crate::server::ServerState;

use super::refusal;

/// Fixed little-endian header length; field bytes first, zero-padded tail.
pub(crate) const HEADER_BYTES: usize = 48;
const ID_BYTES: usize = 16;
const MIN_CHUNK_BYTES: usize = HEADER_BYTES + 2 * ID_BYTES;
const MAX_CHUNK_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_CHUNK_BYTES: usize = 2 * 1024 * 1024;

const KEYFRAME_EVERY: u32 = 30;
const KEYFRAME_PATTERNS: [u32; 4] = [0x1234_5678, 0x8765_4321, 0xABCD_EF00, 0x00FE_DCBA];
const DELTA_BASE: u32 = 0x1111_1111;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NetflixChunkRequest {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    pub quality: Option<String>,
    #[serde(default)]
    pub sequence: u32,
    pub session_id: Option<String>,
    pub flow_id: Option<serde_json::Value>,
}

const fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_BYTES
}

pub(crate) fn quality_level(quality: &str) -> u8 {
    match quality {
        "HD" => 3,
        "720p" => 1,
        "480p" => 0,
        _ => 2,
    }
}

pub(crate) fn is_keyframe(sequence: u32) -> bool {
    sequence.checked_rem(KEYFRAME_EVERY) == Some(0)
}

fn put_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn put_u16(buffer: &mut Vec<u8>, value: u16) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn put_id(buffer: &mut Vec<u8>, value: &str) {
    let mut id = [0u8; ID_BYTES];
    for (slot, byte) in id.iter_mut().zip(value.bytes()) {
        *slot = byte;
    }
    buffer.extend_from_slice(&id);
}

/// Build one synthetic video chunk: 48-byte header, two 16-byte NUL-padded
/// ASCII ids, then a repeating fill pattern (four-word rotation for
/// keyframes, a sequence-XORed word for delta frames).
pub(crate) fn build_chunk(request: &NetflixChunkRequest, timestamp_ms: u64) -> Vec<u8> {
    let chunk_size = request.chunk_size.clamp(MIN_CHUNK_BYTES, MAX_CHUNK_BYTES);
    let quality = quality_level(request.quality.as_deref().unwrap_or("1080p"));
    let keyframe = is_keyframe(request.sequence);
    let mut chunk = Vec::with_capacity(chunk_size);

    put_u32(&mut chunk, request.sequence);
    put_u32(&mut chunk, (timestamp_ms & 0xFFFF_FFFF) as u32);
    put_u32(&mut chunk, u32::try_from(chunk_size).unwrap_or(u32::MAX));
    put_u32(&mut chunk, 0); // reserved
    put_u16(&mut chunk, 0); // viewer count
    chunk.push(u8::from(keyframe));
    chunk.push(quality);
    chunk.push(1); // complexity: medium
    chunk.push(0);
    put_u16(&mut chunk, 0); // buffer level
    put_u16(&mut chunk, 0);
    chunk.resize(HEADER_BYTES, 0);

    put_id(
        &mut chunk,
        request.session_id.as_deref().unwrap_or("netflix_session"),
    );
    let flow = request
        .flow_id
        .as_ref()
        .map_or_else(|| "0".to_owned(), flow_id_text);
    put_id(&mut chunk, &flow);

    let mut word_index: usize = 0;
    while chunk.len() < chunk_size {
        let word = if keyframe {
            KEYFRAME_PATTERNS
                .get(word_index.checked_rem(KEYFRAME_PATTERNS.len()).unwrap_or(0))
                .copied()
                .unwrap_or(DELTA_BASE)
        } else {
            DELTA_BASE ^ (request.sequence & 0xFFFF)
        };
        let remaining = chunk_size.saturating_sub(chunk.len());
        let bytes = word.to_le_bytes();
        chunk.extend_from_slice(bytes.get(..remaining.min(4)).unwrap_or(&bytes));
        word_index = word_index.saturating_add(1);
    }
    chunk
}

fn flow_id_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Number(number) => number.to_string(),
        serde_json::Value::Null
        | serde_json::Value::Bool(_)
        | serde_json::Value::Array(_)
        | serde_json::Value::Object(_) => "0".to_owned(),
    }
}

/// `POST /netflix-chunk`: synthesize a video chunk of the requested size.
/// Shares the download admission path since it is download-class traffic.
pub(crate) async fn netflix_chunk(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<NetflixChunkRequest>,
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

    let chunk = build_chunk(&request, crate::household::epoch_ms() as u64);
    if let Some(guard) = guard.as_ref() {
        guard.add_bytes(chunk.len() as u64);
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CACHE_CONTROL, "no-store".to_owned()),
        ],
        [
            (
                header::HeaderName::from_static("x-netflix-sequence"),
                request.sequence.to_string(),
            ),
            (
                header::HeaderName::from_static("x-netflix-chunk-size"),
                chunk.len().to_string(),
            ),
        ],
        chunk,
    )
        .into_response()
}
