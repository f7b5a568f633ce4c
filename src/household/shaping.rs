//! Per-tick traffic production.
//!
//! One shaping tick computes the burst-effective rate, turns it into a byte
//! target for the interval, and pushes binary frames through the session's
//! writer channel. The bounded channel is the only backpressure signal:
//! a peer that cannot drain frames trips the send deadline, the session is
//! marked inactive, and the next scheduler tick cleans it up. Nothing queues
//! beyond the channel capacity, so lag costs throughput, not memory.
use std::time::{Duration, Instant};

use crate::pool::{DataPool, MAX_BULK_BYTES, WARMUP_CHUNK_BYTES};

use super::epoch_ms;
use super::messages::WsMessage;
use super::profile::Persona;
use super::session::TrafficSession;

const ACTIVE_RECHECK_CHUNKS: u64 = 20;
const MULTISTREAM_LANES: u64 = 4;

pub(super) fn target_bytes_for(rate_mbps: f64, interval: Duration) -> u64 {
    if rate_mbps <= 0.0 {
        return 0;
    }
    let bytes = (rate_mbps * 1_000_000.0 / 8.0) * interval.as_secs_f64();
    let capped = bytes.min(MAX_BULK_BYTES as f64);
    if capped <= 0.0 { 0 } else { capped as u64 }
}

/// Run one download shaping tick. Returns the bytes actually handed to the
/// writer, including partial progress when a send fails mid-tick.
pub(super) async fn shape_download(
    session: &TrafficSession,
    pool: &DataPool,
    interval: Duration,
) -> u64 {
    if !session.is_active() {
        return 0;
    }
    // Profile updates land at tick boundaries only, before the target is
    // computed, so they never race the shaper.
    session.apply_pending_update();

    let profile = session.profile_snapshot();
    let now = Instant::now();
    let effective_mbps = session.with_burst(|burst| {
        profile
            .burst
            .effective_rate(profile.download_mbps, burst, now)
    });
    let target_bytes = target_bytes_for(effective_mbps, interval);
    if target_bytes == 0 {
        return 0;
    }

    if profile.multistream {
        return shape_multistream(session, pool, target_bytes).await;
    }

    if profile.persona == Persona::Bulk {
        // One contiguous slice saturates better than chunk cycling at
        // gigabit targets.
        let chunk = pool.get_bulk(usize::try_from(target_bytes).unwrap_or(MAX_BULK_BYTES));
        let len = chunk.len() as u64;
        if session.send_binary(chunk).await.is_err() {
            session.mark_inactive();
            return 0;
        }
        session.record_download_bytes(len);
        return len;
    }

    let mut sent: u64 = 0;
    let mut remaining = target_bytes;
    let mut chunk_count: u64 = 0;
    while remaining > 0 {
        chunk_count = chunk_count.saturating_add(1);
        let chunk = if remaining >= WARMUP_CHUNK_BYTES as u64 {
            pool.get_warmup_chunk(chunk_count)
        } else {
            pool.warmup_prefix(usize::try_from(remaining).unwrap_or(WARMUP_CHUNK_BYTES))
        };
        let len = chunk.len() as u64;
        if let Err(err) = session.send_binary(chunk).await {
            tracing::debug!(session = %session.id(), error = %err, "chunk send failed");
            session.mark_inactive();
            break;
        }
        sent = sent.saturating_add(len);
        remaining = remaining.saturating_sub(len);
        session.record_download_bytes(len);

        // A stop_test must be observed promptly even mid-burst.
        if chunk_count.checked_rem(ACTIVE_RECHECK_CHUNKS) == Some(0) && !session.is_active() {
            break;
        }
    }
    sent
}

/// Split the tick target across four logical sub-streams, each chunk led by
/// a small JSON header so the peer can demultiplex. Lane 0 absorbs any
/// remainder bytes. Frames still serialize through the one writer task; the
/// lanes exist for the peer's accounting, not for transport parallelism.
async fn shape_multistream(session: &TrafficSession, pool: &DataPool, target_bytes: u64) -> u64 {
    let per_lane = target_bytes.checked_div(MULTISTREAM_LANES).unwrap_or(0);
    let remainder = target_bytes.checked_rem(MULTISTREAM_LANES).unwrap_or(0);
    let mut sent: u64 = 0;

    for lane in 0..MULTISTREAM_LANES {
        let mut share = per_lane;
        if lane == 0 {
            share = share.saturating_add(remainder);
        }
        let mut chunk_id: u64 = 0;
        while share > 0 {
            if !session.is_active() {
                return sent;
            }
            chunk_id = chunk_id.saturating_add(1);
            let len = share.min(WARMUP_CHUNK_BYTES as u64);
            let chunk = pool.get_bulk(usize::try_from(len).unwrap_or(WARMUP_CHUNK_BYTES));
            let header = WsMessage::MultistreamData {
                stream_id: u8::try_from(lane).unwrap_or(0),
                chunk_id,
                data_size: chunk.len() as u64,
                timestamp: epoch_ms(),
            };
            if session.send_message(&header).await.is_err() {
                session.mark_inactive();
                return sent;
            }
            let chunk_len = chunk.len() as u64;
            if session.send_binary(chunk).await.is_err() {
                session.mark_inactive();
                return sent;
            }
            sent = sent.saturating_add(chunk_len);
            share = share.saturating_sub(chunk_len);
            session.record_download_bytes(chunk_len);
        }
    }
    sent
}

/// Ask the peer to produce the upcoming interval's upload traffic. The
/// upload direction is peer-originated, so the server only ever requests.
pub(super) async fn request_upload(session: &TrafficSession, interval: Duration) {
    if !session.is_active() {
        return;
    }
    let profile = session.profile_snapshot();
    let target_bytes = target_bytes_for(profile.upload_mbps, interval);
    if target_bytes == 0 {
        return;
    }
    let request = WsMessage::RealUploadRequest {
        target_bytes,
        optimal_chunk_size: WARMUP_CHUNK_BYTES as u64,
        duration_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        timestamp: epoch_ms(),
    };
    if let Err(err) = session.send_message(&request).await {
        tracing::debug!(session = %session.id(), error = %err, "upload request failed");
        session.mark_inactive();
    }
}
