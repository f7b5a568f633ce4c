use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;

use super::{RateLimiter, client_ip};
use crate::config::LimitConfig;

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
}

fn limiter() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(LimitConfig::default()))
}

fn limiter_with<TMut>(mutate: TMut) -> Arc<RateLimiter>
where
    TMut: FnOnce(&mut LimitConfig),
{
    let mut config = LimitConfig::default();
    mutate(&mut config);
    Arc::new(RateLimiter::new(config))
}

#[test]
fn fourth_concurrent_download_is_rejected() -> Result<(), String> {
    let limiter = limiter();
    let _one = limiter
        .acquire_download(ip(1), true)
        .map_err(|err| format!("first acquire failed: {}", err))?;
    let _two = limiter
        .acquire_download(ip(1), true)
        .map_err(|err| format!("second acquire failed: {}", err))?;
    let _three = limiter
        .acquire_download(ip(1), true)
        .map_err(|err| format!("third acquire failed: {}", err))?;
    if limiter.acquire_download(ip(1), true).is_ok() {
        return Err("fourth concurrent download should be rejected".to_owned());
    }
    // A different IP is unaffected.
    let _other = limiter
        .acquire_download(ip(2), true)
        .map_err(|err| format!("other IP should be admitted: {}", err))?;
    Ok(())
}

#[test]
fn dropping_the_guard_releases_the_slot() -> Result<(), String> {
    let limiter = limiter();
    for round in 0..5 {
        let guard = limiter
            .acquire_download(ip(3), true)
            .map_err(|err| format!("round {} acquire failed: {}", round, err))?;
        drop(guard);
    }
    let usage = limiter.usage(ip(3));
    if usage.active_downloads != 0 {
        return Err(format!(
            "slots leaked: {} active after all drops",
            usage.active_downloads
        ));
    }
    Ok(())
}

#[test]
fn hourly_test_quota_rejects_the_seventeenth() -> Result<(), String> {
    let limiter = limiter();
    for round in 0u32..16 {
        let guard = limiter
            .acquire_download(ip(4), true)
            .map_err(|err| format!("test {} refused early: {}", round, err))?;
        drop(guard);
    }
    if limiter.acquire_download(ip(4), true).is_ok() {
        return Err("seventeenth test in the hour should be rejected".to_owned());
    }
    // An unrelated IP in the same window is admitted.
    let _other = limiter
        .acquire_download(ip(5), true)
        .map_err(|err| format!("unrelated IP refused: {}", err))?;
    Ok(())
}

#[test]
fn bandwidth_quota_counts_recorded_bytes() -> Result<(), String> {
    let limiter = limiter_with(|config| config.bandwidth_gb_per_hour = 1);
    let guard = limiter
        .acquire_download(ip(6), true)
        .map_err(|err| format!("acquire failed: {}", err))?;
    guard.add_bytes(2 * 1024 * 1024 * 1024);
    drop(guard);
    match limiter.acquire_download(ip(6), true) {
        Ok(_guard) => Err("bandwidth quota should reject after 2GiB of a 1GiB budget".to_owned()),
        Err(_) => Ok(()),
    }
}

#[test]
fn warmup_acquires_do_not_burn_test_quota() -> Result<(), String> {
    let limiter = limiter();
    for round in 0..20 {
        let guard = limiter
            .acquire_download(ip(9), false)
            .map_err(|err| format!("warmup {} refused: {}", round, err))?;
        drop(guard);
    }
    // A real test is still admitted after twenty warmups.
    let _test = limiter
        .acquire_download(ip(9), true)
        .map_err(|err| format!("real test refused after warmups: {}", err))?;
    Ok(())
}

#[test]
fn websocket_sessions_cap_at_four() -> Result<(), String> {
    let limiter = limiter();
    let mut guards = Vec::new();
    for round in 0..4 {
        let guard = limiter
            .acquire_websocket(ip(7))
            .map_err(|err| format!("session {} refused: {}", round, err))?;
        guards.push(guard);
    }
    if limiter.acquire_websocket(ip(7)).is_ok() {
        return Err("fifth household session should be rejected".to_owned());
    }
    guards.clear();
    let _reopened = limiter
        .acquire_websocket(ip(7))
        .map_err(|err| format!("slot not released after drop: {}", err))?;
    Ok(())
}

#[test]
fn ping_budget_is_per_minute() -> Result<(), String> {
    let limiter = limiter_with(|config| config.pings_per_minute = 3);
    for round in 0..3 {
        limiter
            .check_ping(ip(8))
            .map_err(|err| format!("ping {} refused: {}", round, err))?;
    }
    if limiter.check_ping(ip(8)).is_ok() {
        return Err("fourth ping in the minute should be rejected".to_owned());
    }
    Ok(())
}

#[test]
fn fleet_bypass_requires_explicit_opt_in() -> Result<(), String> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "user-agent",
        "Contend-Central/1.4"
            .parse()
            .map_err(|err| format!("header build failed: {}", err))?,
    );

    let closed = limiter();
    if closed.is_exempt(&headers) {
        return Err("bypass must never be inferred from the UA alone".to_owned());
    }

    let open = limiter_with(|config| config.fleet_bypass = true);
    if !open.is_exempt(&headers) {
        return Err("configured fleet UA should be exempt".to_owned());
    }

    let mut other = HeaderMap::new();
    other.insert(
        "user-agent",
        "Mozilla/5.0".parse().map_err(|err| format!("header build failed: {}", err))?,
    );
    if open.is_exempt(&other) {
        return Err("non-fleet UA must not be exempt".to_owned());
    }
    Ok(())
}

#[test]
fn client_ip_prefers_forwarded_first_hop() -> Result<(), String> {
    let peer: SocketAddr = "192.0.2.9:4321"
        .parse()
        .map_err(|err| format!("peer parse failed: {}", err))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        "x-forwarded-for",
        "198.51.100.7, 10.0.0.1"
            .parse()
            .map_err(|err| format!("header build failed: {}", err))?,
    );
    let from_forwarded = client_ip(&headers, peer);
    if from_forwarded.to_string() != "198.51.100.7" {
        return Err(format!("expected first forwarded hop, got {}", from_forwarded));
    }

    let mut real_ip_only = HeaderMap::new();
    real_ip_only.insert(
        "x-real-ip",
        "198.51.100.8".parse().map_err(|err| format!("header build failed: {}", err))?,
    );
    let from_real_ip = client_ip(&real_ip_only, peer);
    if from_real_ip.to_string() != "198.51.100.8" {
        return Err(format!("expected x-real-ip, got {}", from_real_ip));
    }

    let from_peer = client_ip(&HeaderMap::new(), peer);
    if from_peer.to_string() != "192.0.2.9" {
        return Err(format!("expected peer fallback, got {}", from_peer));
    }
    Ok(())
}
