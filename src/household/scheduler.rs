//! The per-worker background loop.
//!
//! One cooperative task drives every live session through the same tick:
//! cleanup first, then connection validation, then shaping, then the
//! metrics push, then pacing back to the fixed interval. Cleanup runs
//! before shaping so the expensive phase never touches a doomed session
//! and churn cannot grow the session table between ticks.
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use super::engine::SessionEngine;
use super::epoch_ms;
use super::messages::WsMessage;
use super::session::TrafficSession;
use super::shaping;

pub(super) fn spawn(engine: Arc<SessionEngine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_loop(&engine).await;
    })
}

async fn run_loop(engine: &Arc<SessionEngine>) {
    let interval = engine.update_interval();
    let mut tick: u64 = 0;

    while engine.is_running() {
        let tick_start = Instant::now();
        tick = tick.saturating_add(1);

        // 1. Cleanup expired and inactive sessions first.
        let doomed = collect_doomed(engine, tick_start);
        for (id, reason) in doomed {
            tracing::info!(session = %id, reason, "cleaning up session");
            engine.stop_session(&id).await;
        }

        // 2–4. Validate, shape and emit for each surviving session. A
        // failure in one session never stops the loop.
        for session in engine.sessions_snapshot() {
            if !session.is_active() {
                continue;
            }
            if !validate_connection(&session).await {
                continue;
            }
            let sent = shaping::shape_download(&session, engine.pool(), interval).await;
            let download_idle = session.profile_snapshot().download_mbps <= 0.0;
            if sent > 0 || download_idle {
                shaping::request_upload(&session, interval).await;
            }
            if session.is_active() {
                emit_update(&session).await;
                session.touch_activity(Instant::now());
            }
        }

        // 5. Pace to exactly one interval; an overrun is logged and the
        // next tick starts immediately instead of double-ticking.
        let elapsed = tick_start.elapsed();
        if elapsed > interval {
            tracing::warn!(
                tick,
                elapsed_ms = %elapsed.as_millis(),
                interval_ms = %interval.as_millis(),
                "scheduler tick overran"
            );
        } else {
            tokio::time::sleep(interval.saturating_sub(elapsed)).await;
        }
    }
    tracing::info!("scheduler loop ended");
}

fn collect_doomed(engine: &Arc<SessionEngine>, now: Instant) -> Vec<(String, &'static str)> {
    let mut doomed = Vec::new();
    for session in engine.sessions_snapshot() {
        if !session.is_active() {
            doomed.push((session.id().to_owned(), "marked_inactive"));
            continue;
        }
        if let Some(reason) = session.expiry_reason(now) {
            session.mark_inactive();
            doomed.push((session.id().to_owned(), reason.as_str()));
        }
    }
    doomed
}

/// One small frame with a short deadline. Timeout or error bumps the
/// failure counter (three strikes expire the session); success resets it.
async fn validate_connection(session: &Arc<TrafficSession>) -> bool {
    let probe = WsMessage::ConnectionTest {
        user_id: session.id().to_owned(),
        timestamp: epoch_ms(),
    };
    match session.send_message(&probe).await {
        Ok(()) => {
            session.connection_test_passed(Instant::now());
            true
        }
        Err(err) => {
            let failures = session.connection_test_failed();
            tracing::debug!(
                session = %session.id(),
                failures,
                error = %err,
                "connection test failed"
            );
            false
        }
    }
}

async fn emit_update(session: &Arc<TrafficSession>) {
    let update = WsMessage::RealTimeUpdate(Box::new(session.metrics(Instant::now())));
    if let Err(err) = session.send_message(&update).await {
        tracing::debug!(session = %session.id(), error = %err, "metrics push failed");
        session.mark_inactive();
    }
}
