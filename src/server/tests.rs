use std::time::Duration;

use super::endpoints::download::TrafficPattern;
use super::endpoints::netflix::{HEADER_BYTES, NetflixChunkRequest, build_chunk, is_keyframe,
    quality_level};
use super::endpoints::upload::throttle_delay;

fn read_u32(chunk: &[u8], offset: usize) -> Result<u32, String> {
    let end = offset.checked_add(4).ok_or_else(|| "offset overflow".to_owned())?;
    let bytes = chunk
        .get(offset..end)
        .ok_or_else(|| format!("chunk too short at offset {}", offset))?;
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_bad: std::array::TryFromSliceError| "bad slice length".to_owned())?;
    Ok(u32::from_le_bytes(array))
}

fn chunk_request(sequence: u32, size: usize, quality: &str) -> NetflixChunkRequest {
    NetflixChunkRequest {
        chunk_size: size,
        quality: Some(quality.to_owned()),
        sequence,
        session_id: Some("abc123".to_owned()),
        flow_id: Some(serde_json::json!(7)),
    }
}

#[test]
fn netflix_header_round_trips_the_request() -> Result<(), String> {
    let request = chunk_request(60, 4096, "1080p");
    let chunk = build_chunk(&request, 1_722_500_000_123);
    if chunk.len() != 4096 {
        return Err(format!("expected 4096 bytes, got {}", chunk.len()));
    }
    if read_u32(&chunk, 0)? != 60 {
        return Err("sequence mismatch".to_owned());
    }
    if read_u32(&chunk, 8)? != 4096 {
        return Err("chunk-size mismatch".to_owned());
    }
    // Timestamp is taken mod 2^32.
    let expected_ts = (1_722_500_000_123u64 & 0xFFFF_FFFF) as u32;
    if read_u32(&chunk, 4)? != expected_ts {
        return Err("timestamp mismatch".to_owned());
    }
    // Sequence 60 is a keyframe (60 % 30 == 0).
    if chunk.get(18).copied() != Some(1) {
        return Err("keyframe flag missing".to_owned());
    }
    // 1080p maps to quality level 2.
    if chunk.get(19).copied() != Some(2) {
        return Err("quality level mismatch".to_owned());
    }
    // Session id is ASCII, NUL-padded to 16 bytes, right after the header.
    let id_end = HEADER_BYTES.checked_add(16).ok_or_else(|| "overflow".to_owned())?;
    let session = chunk
        .get(HEADER_BYTES..id_end)
        .ok_or_else(|| "missing session id".to_owned())?;
    if session.get(..6) != Some(b"abc123".as_slice()) {
        return Err("session id not embedded".to_owned());
    }
    if session.get(6..).is_none_or(|tail| tail.iter().any(|byte| *byte != 0)) {
        return Err("session id not NUL-padded".to_owned());
    }
    Ok(())
}

#[test]
fn delta_frames_use_the_sequence_xor_pattern() -> Result<(), String> {
    let request = chunk_request(31, 256, "720p");
    let chunk = build_chunk(&request, 1);
    if chunk.get(18).copied() != Some(0) {
        return Err("sequence 31 must not be a keyframe".to_owned());
    }
    if chunk.get(19).copied() != Some(1) {
        return Err("720p should map to quality 1".to_owned());
    }
    // Payload starts after header + two 16-byte ids.
    let payload_start = HEADER_BYTES.checked_add(32).ok_or_else(|| "overflow".to_owned())?;
    let expected = 0x1111_1111u32 ^ 31;
    if read_u32(&chunk, payload_start)? != expected {
        return Err("delta fill word mismatch".to_owned());
    }
    Ok(())
}

#[test]
fn keyframe_cadence_and_quality_map_are_stable() -> Result<(), String> {
    for sequence in [0u32, 30, 90, 300] {
        if !is_keyframe(sequence) {
            return Err(format!("{} should be a keyframe", sequence));
        }
    }
    for sequence in [1u32, 29, 31, 299] {
        if is_keyframe(sequence) {
            return Err(format!("{} should not be a keyframe", sequence));
        }
    }
    for (name, level) in [("480p", 0u8), ("720p", 1), ("1080p", 2), ("HD", 3), ("8k", 2)] {
        if quality_level(name) != level {
            return Err(format!("quality {} should map to {}", name, level));
        }
    }
    Ok(())
}

#[test]
fn tiny_chunk_requests_are_padded_to_the_envelope() -> Result<(), String> {
    let request = chunk_request(1, 8, "1080p");
    let chunk = build_chunk(&request, 1);
    // Header plus both ids is the minimum representable chunk.
    if chunk.len() != 80 {
        return Err(format!("expected 80-byte minimum, got {}", chunk.len()));
    }
    Ok(())
}

#[test]
fn download_patterns_sleep_within_the_band() -> Result<(), String> {
    // Steady: pause every 20th chunk only.
    if TrafficPattern::Steady.pause_after(19).is_some() {
        return Err("steady should not pause at chunk 19".to_owned());
    }
    if TrafficPattern::Steady.pause_after(20) != Some(Duration::from_millis(5)) {
        return Err("steady should pause 5ms at chunk 20".to_owned());
    }
    // Bursty: long-ish pause every 10th, short otherwise.
    if TrafficPattern::BurstyStreaming.pause_after(10) != Some(Duration::from_millis(10)) {
        return Err("bursty should pause 10ms at chunk 10".to_owned());
    }
    if TrafficPattern::BurstyStreaming.pause_after(11) != Some(Duration::from_millis(1)) {
        return Err("bursty should pause 1ms off-burst".to_owned());
    }
    // Adaptive: constant 2ms.
    if TrafficPattern::AdaptiveStreaming.pause_after(3) != Some(Duration::from_millis(2)) {
        return Err("adaptive should pause 2ms".to_owned());
    }
    // Every configured pause stays inside the 1-10ms band.
    for pattern in [
        TrafficPattern::Steady,
        TrafficPattern::BurstyStreaming,
        TrafficPattern::AdaptiveStreaming,
    ] {
        for count in 1u64..=40 {
            if let Some(pause) = pattern.pause_after(count) {
                if pause < Duration::from_millis(1) || pause > Duration::from_millis(10) {
                    return Err(format!("pause {:?} outside the band", pause));
                }
            }
        }
    }
    Ok(())
}

#[test]
fn pattern_parsing_defaults_to_steady() -> Result<(), String> {
    if TrafficPattern::parse(None) != TrafficPattern::Steady {
        return Err("missing pattern should be steady".to_owned());
    }
    if TrafficPattern::parse(Some("bursty_streaming")) != TrafficPattern::BurstyStreaming {
        return Err("bursty_streaming not recognized".to_owned());
    }
    if TrafficPattern::parse(Some("adaptive")) != TrafficPattern::AdaptiveStreaming {
        return Err("adaptive not recognized".to_owned());
    }
    if TrafficPattern::parse(Some("nonsense")) != TrafficPattern::Steady {
        return Err("unknown patterns should fall back to steady".to_owned());
    }
    Ok(())
}

#[test]
fn upload_throttle_only_trims_above_the_ceiling() -> Result<(), String> {
    let ceiling = 2000u64 * 1024 * 1024;
    // Under the ceiling: untouched.
    if throttle_delay(10 * 1024 * 1024, Duration::from_millis(100), ceiling).is_some() {
        return Err("below-ceiling traffic must not be throttled".to_owned());
    }
    // At double the ceiling over 100ms, the delay is about another 100ms.
    let over = ceiling
        .checked_div(5)
        .ok_or_else(|| "math error".to_owned())?; // 400MiB in 100ms = 2x ceiling
    let delay = throttle_delay(over, Duration::from_millis(100), ceiling)
        .ok_or_else(|| "expected a throttle delay".to_owned())?;
    let millis = delay.as_millis();
    if !(80..=120).contains(&millis) {
        return Err(format!("expected ~100ms delay, got {}ms", millis));
    }
    // A zero ceiling disables the check entirely.
    if throttle_delay(u64::MAX, Duration::from_secs(1), 0).is_some() {
        return Err("zero ceiling must disable throttling".to_owned());
    }
    Ok(())
}
