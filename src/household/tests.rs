use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::latency::{LatencyTracker, Severity};
use super::messages::WsMessage;
use super::profile::{BurstPattern, BurstPhase, BurstState, Persona, ProfileUpdate, UserProfile};
use super::session::{OutboundFrame, TrafficSession};
use super::shaping::target_bytes_for;
use crate::pool::MAX_BULK_BYTES;

fn back_dated(now: Instant, by: Duration) -> Result<Instant, String> {
    now.checked_sub(by)
        .ok_or_else(|| "clock too young to back-date".to_owned())
}

fn streamer_pattern() -> BurstPattern {
    BurstPattern::TwoPhase {
        active_rate_mbps: 25.0,
        active_duration_ms: 1000,
        idle_rate_mbps: 0.0,
        idle_duration_ms: 4000,
    }
}

fn test_session(profile: UserProfile) -> (TrafficSession, mpsc::Receiver<OutboundFrame>) {
    let (out_tx, out_rx) = mpsc::channel(8);
    let id = format!("{}_1722500000000", profile.persona.as_str());
    let session = TrafficSession::new(id, profile, out_tx, Instant::now());
    (session, out_rx)
}

#[test]
fn constant_pattern_never_flips_phase() -> Result<(), String> {
    let now = Instant::now();
    let mut state = BurstState::new(back_dated(now, Duration::from_secs(30))?);
    let rate = BurstPattern::Constant.effective_rate(1.5, &mut state, now);
    if (rate - 1.5).abs() > f64::EPSILON {
        return Err(format!("constant rate changed: {}", rate));
    }
    if state.cycle_count != 0 || state.phase != BurstPhase::Active {
        return Err("constant pattern must not mutate burst state".to_owned());
    }
    Ok(())
}

#[test]
fn two_phase_flips_and_counts_cycles() -> Result<(), String> {
    let pattern = streamer_pattern();
    let now = Instant::now();

    // Still inside the active second: full rate, no transition.
    let mut fresh = BurstState::new(back_dated(now, Duration::from_millis(500))?);
    let active_rate = pattern.effective_rate(25.0, &mut fresh, now);
    if (active_rate - 25.0).abs() > f64::EPSILON {
        return Err(format!("expected active rate, got {}", active_rate));
    }

    // Past the active window: flip to idle, count the cycle.
    let mut state = BurstState::new(back_dated(now, Duration::from_millis(1200))?);
    let idle_rate = pattern.effective_rate(25.0, &mut state, now);
    if idle_rate.abs() > f64::EPSILON {
        return Err(format!("expected idle rate after flip, got {}", idle_rate));
    }
    if state.phase != BurstPhase::Idle || state.cycle_count != 1 {
        return Err("active->idle transition must bump the cycle counter".to_owned());
    }

    // Past the idle window: flip back without another cycle bump.
    state.phase_start = back_dated(now, Duration::from_millis(4100))?;
    let resumed_rate = pattern.effective_rate(25.0, &mut state, now);
    if (resumed_rate - 25.0).abs() > f64::EPSILON {
        return Err(format!("expected active rate after idle, got {}", resumed_rate));
    }
    if state.phase != BurstPhase::Active || state.cycle_count != 1 {
        return Err("idle->active transition must not bump the cycle counter".to_owned());
    }
    Ok(())
}

#[test]
fn two_phase_long_run_average_tracks_weighted_rate() -> Result<(), String> {
    // 1 s at 25 Mb/s + 4 s at 0 equals 5 Mb/s weighted average. Walk the
    // pattern in 100 ms steps over 20 s of simulated wall-clock.
    let pattern = streamer_pattern();
    let start = Instant::now();
    let mut state = BurstState::new(start);
    let step = Duration::from_millis(100);
    let mut accumulated = 0.0f64;
    let mut samples = 0u64;
    for index in 0..200u64 {
        let now = start
            .checked_add(step.saturating_mul(u32::try_from(index).unwrap_or(u32::MAX)))
            .ok_or_else(|| "instant overflow".to_owned())?;
        accumulated += pattern.effective_rate(25.0, &mut state, now);
        samples = samples.saturating_add(1);
    }
    let mean = accumulated / samples as f64;
    if !(4.0..=6.0).contains(&mean) {
        return Err(format!("weighted mean out of range: {:.2}", mean));
    }
    if state.cycle_count < 3 {
        return Err(format!("expected >=3 cycles in 20s, got {}", state.cycle_count));
    }
    Ok(())
}

#[test]
fn target_bytes_match_rate_and_interval() -> Result<(), String> {
    // 1 Mb/s over 250 ms is 31_250 bytes.
    let bytes = target_bytes_for(1.0, Duration::from_millis(250));
    if bytes != 31_250 {
        return Err(format!("expected 31250 bytes, got {}", bytes));
    }
    // Zero and negative rates produce nothing.
    if target_bytes_for(0.0, Duration::from_millis(250)) != 0 {
        return Err("zero rate must produce zero bytes".to_owned());
    }
    // Absurd rates cap at the pool's largest slice.
    let capped = target_bytes_for(1_000_000.0, Duration::from_secs(10));
    if capped != MAX_BULK_BYTES as u64 {
        return Err(format!("expected 64MiB cap, got {}", capped));
    }
    Ok(())
}

#[test]
fn baseline_latches_after_ten_samples() -> Result<(), String> {
    let mut tracker = LatencyTracker::new();
    let now = Instant::now();
    for _sample in 0..9 {
        tracker.record(20.0, now);
    }
    if tracker.baseline_established() {
        return Err("baseline latched too early".to_owned());
    }
    tracker.record(20.0, now);
    if !tracker.baseline_established() {
        return Err("baseline should latch at the tenth sample".to_owned());
    }
    let baseline = tracker.metrics().baseline_latency;
    if (baseline - 20.0).abs() > 0.11 {
        return Err(format!("baseline should be ~20ms, got {}", baseline));
    }
    // Later samples never move the baseline.
    for _sample in 0..50 {
        tracker.record(300.0, now);
    }
    let later = tracker.metrics().baseline_latency;
    if (later - baseline).abs() > f64::EPSILON {
        return Err("baseline must never change once established".to_owned());
    }
    Ok(())
}

#[test]
fn severity_tracks_latency_increase() -> Result<(), String> {
    for (increase, expected) in [
        (0.0, Severity::None),
        (9.9, Severity::None),
        (10.0, Severity::Mild),
        (49.9, Severity::Mild),
        (50.0, Severity::Moderate),
        (199.9, Severity::Moderate),
        (200.0, Severity::Severe),
        (2000.0, Severity::Severe),
    ] {
        let got = Severity::classify(increase);
        if got != expected {
            return Err(format!("increase {} classified as {:?}", increase, got));
        }
    }
    Ok(())
}

#[test]
fn jitter_is_sample_standard_deviation() -> Result<(), String> {
    let mut tracker = LatencyTracker::new();
    let now = Instant::now();
    // Alternating 10/30 ms has mean 20 and population stddev 10.
    for sample in 0..10 {
        let rtt = if sample % 2 == 0 { 10.0 } else { 30.0 };
        tracker.record(rtt, now);
    }
    let metrics = tracker.metrics();
    if (metrics.jitter - 10.0).abs() > 0.11 {
        return Err(format!("expected jitter ~10ms, got {}", metrics.jitter));
    }
    if (metrics.avg_latency - 20.0).abs() > 0.11 {
        return Err(format!("expected avg ~20ms, got {}", metrics.avg_latency));
    }
    if (metrics.min_latency - 10.0).abs() > 0.11 || (metrics.max_latency - 30.0).abs() > 0.11 {
        return Err("min/max tracking is off".to_owned());
    }
    Ok(())
}

#[test]
fn expiry_honors_inactivity_and_duration_caps() -> Result<(), String> {
    let (session, _rx) = test_session(UserProfile::for_persona(Persona::Gamer));
    let start = session.started();

    // Fresh session: nothing expires.
    if session.expiry_reason(start).is_some() {
        return Err("fresh session must not expire".to_owned());
    }

    // 31 s with no activity: inactivity timeout.
    let later = start
        .checked_add(Duration::from_secs(31))
        .ok_or_else(|| "instant overflow".to_owned())?;
    match session.expiry_reason(later) {
        Some(reason) if reason.as_str() == "inactivity_timeout" => {}
        other => return Err(format!("expected inactivity expiry, got {:?}", other)),
    }

    // Activity at 40 s defers inactivity, but the 60 s duration cap holds.
    session.touch_activity(
        start
            .checked_add(Duration::from_secs(40))
            .ok_or_else(|| "instant overflow".to_owned())?,
    );
    let at_61 = start
        .checked_add(Duration::from_secs(61))
        .ok_or_else(|| "instant overflow".to_owned())?;
    match session.expiry_reason(at_61) {
        Some(reason) if reason.as_str() == "duration_cap" => {}
        other => return Err(format!("expected duration expiry, got {:?}", other)),
    }
    Ok(())
}

#[test]
fn high_throughput_personas_get_the_short_duration_cap() -> Result<(), String> {
    let (session, _rx) = test_session(UserProfile::for_persona(Persona::Bulk));
    let start = session.started();
    session.touch_activity(
        start
            .checked_add(Duration::from_secs(44))
            .ok_or_else(|| "instant overflow".to_owned())?,
    );
    let at_46 = start
        .checked_add(Duration::from_secs(46))
        .ok_or_else(|| "instant overflow".to_owned())?;
    match session.expiry_reason(at_46) {
        Some(reason) if reason.as_str() == "duration_cap" => Ok(()),
        other => Err(format!("expected 45s cap for bulk, got {:?}", other)),
    }
}

#[test]
fn connection_failures_expire_after_three() -> Result<(), String> {
    let (session, _rx) = test_session(UserProfile::for_persona(Persona::VideoCall));
    let now = session.started();
    session.touch_activity(now);
    if session.connection_test_failed() != 1 {
        return Err("first failure should count 1".to_owned());
    }
    session.connection_test_passed(now);
    if session.expiry_reason(now).is_some() {
        return Err("reset failures must not expire the session".to_owned());
    }
    for _strike in 0..3 {
        session.connection_test_failed();
    }
    match session.expiry_reason(now) {
        Some(reason) if reason.as_str() == "connection_failures" => Ok(()),
        other => Err(format!("expected failure expiry, got {:?}", other)),
    }
}

#[test]
fn test_id_matching_uses_the_timestamp_suffix() -> Result<(), String> {
    let (session, _rx) = test_session(UserProfile::for_persona(Persona::Streamer));
    // Session id fixed at streamer_1722500000000 by the helper.
    if !session.matches_test_id("1722500000") {
        return Err("floor(ms/1000) should match".to_owned());
    }
    if session.matches_test_id("1722500001") {
        return Err("a different test id must not match".to_owned());
    }
    if !session.matches_test_id("all") || !session.matches_test_id("ALL") {
        return Err("the legacy literal all matches every session".to_owned());
    }
    Ok(())
}

#[test]
fn server_sent_bytes_are_monotonic_and_windowed() -> Result<(), String> {
    let (session, _rx) = test_session(UserProfile::for_persona(Persona::Gamer));
    let start = session.started();
    session.record_download_bytes(1000);
    session.record_download_bytes(500);
    let mid = session.metrics(start);
    if mid.server_sent_bytes != 1500 {
        return Err(format!("expected 1500 sent, got {}", mid.server_sent_bytes));
    }
    session.record_download_bytes(0);
    let after = session.metrics(start);
    if after.server_sent_bytes < mid.server_sent_bytes {
        return Err("server_sent_bytes went backwards".to_owned());
    }

    // 2_500_000 bytes over a 2.5 s window reads as 8 Mb/s.
    session.record_download_bytes(2_497_500);
    let at_2500ms = start
        .checked_add(Duration::from_millis(2500))
        .ok_or_else(|| "instant overflow".to_owned())?;
    let rated = session.metrics(at_2500ms);
    if (rated.actual_download_mbps - 8.0).abs() > 0.1 {
        return Err(format!(
            "expected ~8 Mb/s current rate, got {}",
            rated.actual_download_mbps
        ));
    }
    Ok(())
}

#[test]
fn pending_profile_updates_apply_only_at_tick_boundaries() -> Result<(), String> {
    let (session, _rx) = test_session(UserProfile::for_persona(Persona::Bulk));
    session.queue_profile_update(ProfileUpdate {
        download_mbps: Some(4000.0),
        upload_mbps: None,
        description: None,
        multistream: None,
    });
    let before = session.profile_snapshot();
    if (before.download_mbps - 1000.0).abs() > f64::EPSILON {
        return Err("queued update must not apply immediately".to_owned());
    }
    session.apply_pending_update();
    let after = session.profile_snapshot();
    if (after.download_mbps - 1000.0).abs() > f64::EPSILON {
        return Err(format!(
            "update should clamp to 1000 Mb/s, got {}",
            after.download_mbps
        ));
    }
    // Re-applying with no pending update changes nothing.
    session.apply_pending_update();
    let unchanged = session.profile_snapshot();
    if (unchanged.download_mbps - after.download_mbps).abs() > f64::EPSILON {
        return Err("second apply must be a no-op".to_owned());
    }
    Ok(())
}

#[test]
fn wire_messages_round_trip_and_ignore_unknown_types() -> Result<(), String> {
    let ping = r#"{"type":"ping","sequence":7,"timestamp":1722500000123.0}"#;
    match serde_json::from_str::<WsMessage>(ping) {
        Ok(WsMessage::Ping { sequence, .. }) if sequence == 7 => {}
        other => return Err(format!("ping parse failed: {:?}", other)),
    }

    let stop = r#"{"type":"stop_test","user_id":"gamer_1","extra":true}"#;
    match serde_json::from_str::<WsMessage>(stop) {
        Ok(WsMessage::StopTest) => {}
        other => return Err(format!("stop_test should tolerate extras: {:?}", other)),
    }

    let unknown = r#"{"type":"warp_drive","factor":9}"#;
    if serde_json::from_str::<WsMessage>(unknown).is_ok() {
        return Err("unknown type tags must fail parsing (and be ignored)".to_owned());
    }

    let pong = WsMessage::Pong {
        user_id: Some("gamer_1".to_owned()),
        sequence: 9,
        timestamp: 1000.0,
        server_timestamp: Some(1001.0),
    };
    let encoded =
        serde_json::to_string(&pong).map_err(|err| format!("encode failed: {}", err))?;
    if !encoded.contains(r#""type":"pong""#) || !encoded.contains(r#""sequence":9"#) {
        return Err(format!("pong encoding missing fields: {}", encoded));
    }
    Ok(())
}

#[test]
fn persona_keys_ports_and_session_ids_are_canonical() -> Result<(), String> {
    for (persona, key, port) in [
        (Persona::Streamer, "streamer", 8001),
        (Persona::Gamer, "gamer", 8002),
        (Persona::VideoCall, "video-call", 8003),
        (Persona::Bulk, "bulk", 8004),
    ] {
        if persona.as_str() != key {
            return Err(format!("key mismatch for {:?}", persona));
        }
        if persona.port() != port {
            return Err(format!("port mismatch for {:?}", persona));
        }
        if Persona::from_key(key) != Some(persona) {
            return Err(format!("from_key round trip failed for {}", key));
        }
        let id = format!("{}_1722500000000", key);
        if Persona::from_session_id(&id) != Some(persona) {
            return Err(format!("session id parse failed for {}", id));
        }
    }
    Ok(())
}
