use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SessionError;
use crate::pool::DataPool;

use super::epoch_ms;
use super::messages::{ProfileInfo, SessionMetrics, WsMessage};
use super::profile::{Persona, ProfileUpdate, UserProfile};
use super::scheduler;
use super::session::{OutboundFrame, TrafficSession};

/// Per-worker concurrent session capacity. Generous because each persona
/// runs in its own process.
pub const WORKER_SESSION_CAPACITY: usize = 50;

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;
const LATENCY_PING_INTERVAL: Duration = Duration::from_millis(500);

/// Owns every `TrafficSession` of one persona worker. Handlers keep session
/// ids and look sessions up here; only the scheduler task and the owning
/// message loop mutate a session, so the table itself is the single shared
/// structure.
pub struct SessionEngine {
    persona: Persona,
    pool: Arc<DataPool>,
    default_profile: Mutex<UserProfile>,
    sessions: Mutex<HashMap<String, Arc<TrafficSession>>>,
    update_interval: Duration,
    running: AtomicBool,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
    total_connections: AtomicU64,
}

impl SessionEngine {
    pub fn new(persona: Persona, pool: Arc<DataPool>) -> Arc<Self> {
        let profile = UserProfile::for_persona(persona);
        let update_interval = profile.update_interval();
        Arc::new(Self {
            persona,
            pool,
            default_profile: Mutex::new(profile),
            sessions: Mutex::new(HashMap::new()),
            update_interval,
            running: AtomicBool::new(false),
            scheduler_handle: Mutex::new(None),
            started_at: Instant::now(),
            total_connections: AtomicU64::new(0),
        })
    }

    pub const fn update_interval(&self) -> Duration {
        self.update_interval
    }

    pub(super) fn pool(&self) -> &DataPool {
        &self.pool
    }

    pub(super) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn default_profile(&self) -> UserProfile {
        self.default_profile.lock().clone()
    }

    /// Admit one WebSocket: materialize the session, register it, start its
    /// latency task and make sure the scheduler is running. The returned
    /// receiver feeds the connection's dedicated writer task.
    ///
    /// # Errors
    /// `AtCapacity` when the worker already holds its session budget; the
    /// edge closes 1013.
    pub fn register(
        self: &Arc<Self>,
    ) -> Result<(Arc<TrafficSession>, mpsc::Receiver<OutboundFrame>), SessionError> {
        let profile = self.default_profile();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let now = Instant::now();

        let session = {
            let mut sessions = self.sessions.lock();
            if sessions.len() >= WORKER_SESSION_CAPACITY {
                return Err(SessionError::AtCapacity {
                    active: sessions.len(),
                    limit: WORKER_SESSION_CAPACITY,
                });
            }
            let mut stamp = epoch_ms() as u64;
            while sessions.contains_key(&format!("{}_{}", self.persona.as_str(), stamp)) {
                stamp = stamp.saturating_add(1);
            }
            let id = format!("{}_{}", self.persona.as_str(), stamp);
            let session = Arc::new(TrafficSession::new(id.clone(), profile, out_tx, now));
            sessions.insert(id, Arc::clone(&session));
            session
        };

        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.spawn_latency_task(&session);
        self.ensure_scheduler();
        tracing::info!(session = %session.id(), persona = %self.persona, "session started");
        Ok((session, out_rx))
    }

    /// First frame on a fresh session.
    pub async fn announce(&self, session: &TrafficSession) {
        let profile = session.profile_snapshot();
        let info = WsMessage::SessionInfo {
            user_id: session.id().to_owned(),
            profile: ProfileInfo {
                persona: profile.persona.as_str().to_owned(),
                name: profile.name,
                description: profile.description,
                download_mbps: profile.download_mbps,
                upload_mbps: profile.upload_mbps,
            },
            real_traffic: true,
            timestamp: epoch_ms(),
        };
        if let Err(err) = session.send_message(&info).await {
            tracing::debug!(session = %session.id(), error = %err, "session_info send failed");
        }
    }

    /// 500 ms in-band ping loop. The only cross-task interaction is the
    /// serialized writer channel; the loop dies with the session.
    fn spawn_latency_task(self: &Arc<Self>, session: &Arc<TrafficSession>) {
        let session_task = Arc::clone(session);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(LATENCY_PING_INTERVAL).await;
                if !session_task.is_active() {
                    break;
                }
                let sequence =
                    session_task.with_latency(super::latency::LatencyTracker::next_sequence);
                let ping = WsMessage::Ping {
                    user_id: Some(session_task.id().to_owned()),
                    sequence,
                    timestamp: epoch_ms(),
                };
                if session_task.send_message(&ping).await.is_err() {
                    break;
                }
            }
        });
        session.set_latency_task(handle.abort_handle());
    }

    pub fn ensure_scheduler(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = scheduler::spawn(Arc::clone(self));
        *self.scheduler_handle.lock() = Some(handle);
        tracing::info!(persona = %self.persona, interval_ms = %self.update_interval.as_millis(), "scheduler started");
    }

    pub fn get(&self, id: &str) -> Option<Arc<TrafficSession>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn sessions_snapshot(&self) -> Vec<Arc<TrafficSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|session| session.is_active())
            .count()
    }

    /// Tear one session down: cancel its latency task, best-effort final
    /// metrics, unregister. Idempotent; the WebSocket handler and the
    /// scheduler cleanup can both call it.
    pub async fn stop_session(&self, id: &str) -> bool {
        let removed = self.sessions.lock().remove(id);
        match removed {
            Some(session) => {
                session.mark_inactive();
                session.abort_latency_task();
                let farewell =
                    WsMessage::SessionComplete(Box::new(session.final_metrics(Instant::now())));
                if let Err(err) = session.send_message(&farewell).await {
                    tracing::debug!(session = %id, error = %err, "final metrics not delivered");
                }
                tracing::info!(session = %id, "session stopped");
                true
            }
            None => false,
        }
    }

    /// Dispatch one inbound text frame. Unknown or malformed frames are
    /// logged at debug and ignored.
    pub async fn handle_text(&self, session: &Arc<TrafficSession>, raw: &str) {
        let message: WsMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(session = %session.id(), error = %err, "ignoring frame");
                return;
            }
        };
        let now = Instant::now();
        match message {
            WsMessage::RealUploadData { size } | WsMessage::BulkUploadData { size } => {
                session.record_upload_bytes(size, now);
            }
            WsMessage::ClientConfirmation {
                received_bytes,
                sent_bytes,
            } => {
                session.record_client_confirmation(received_bytes, sent_bytes);
            }
            WsMessage::Ping {
                sequence,
                timestamp,
                user_id: _,
            } => {
                let pong = WsMessage::Pong {
                    user_id: Some(session.id().to_owned()),
                    sequence,
                    timestamp,
                    server_timestamp: Some(epoch_ms()),
                };
                if let Err(err) = session.send_message(&pong).await {
                    tracing::debug!(session = %session.id(), error = %err, "pong send failed");
                }
            }
            WsMessage::Pong {
                timestamp,
                sequence: _,
                user_id: _,
                server_timestamp: _,
            } => {
                let rtt_ms = (epoch_ms() - timestamp).max(0.0);
                session.with_latency(|tracker| tracker.record(rtt_ms, now));
            }
            WsMessage::StopTest => {
                session.mark_inactive();
                let ack = WsMessage::StopTestAck {
                    user_id: session.id().to_owned(),
                    timestamp: epoch_ms(),
                    message: "Traffic generation stopped".to_owned(),
                };
                if let Err(err) = session.send_message(&ack).await {
                    tracing::debug!(session = %session.id(), error = %err, "stop ack send failed");
                }
            }
            WsMessage::ConnectionTestResponse => {
                session.connection_test_passed(now);
            }
            WsMessage::SessionInfo { .. }
            | WsMessage::RealTimeUpdate(_)
            | WsMessage::SessionComplete(_)
            | WsMessage::RealUploadRequest { .. }
            | WsMessage::ConnectionTest { .. }
            | WsMessage::StopTestAck { .. }
            | WsMessage::MultistreamData { .. } => {
                tracing::debug!(session = %session.id(), "ignoring server-typed frame from peer");
            }
        }
    }

    /// Binary frames are upload payload; count and discard.
    pub fn handle_binary(&self, session: &TrafficSession, len: u64) {
        session.record_upload_bytes(len, Instant::now());
    }

    /// Apply a runtime adjustment to the persona default and queue it on
    /// every live session; sessions consume it at their next tick boundary.
    /// Applying the same values twice is a no-op. Returns the number of
    /// sessions the update was queued on.
    pub fn update_profile(&self, update: &ProfileUpdate) -> usize {
        {
            let mut profile = self.default_profile.lock();
            update.apply(&mut profile);
        }
        let sessions = self.sessions_snapshot();
        let mut queued = 0usize;
        for session in &sessions {
            if session.is_active() {
                session.queue_profile_update(update.clone());
                queued = queued.saturating_add(1);
            }
        }
        tracing::info!(persona = %self.persona, sessions = queued, "profile update queued");
        queued
    }

    /// Flag every session matching the test id as inactive; the scheduler's
    /// cleanup phase removes them within one tick.
    pub fn stop_matching_sessions(&self, test_id: &str) -> Vec<String> {
        let mut stopped = Vec::new();
        for session in self.sessions_snapshot() {
            if session.matches_test_id(test_id) {
                session.mark_inactive();
                stopped.push(session.id().to_owned());
            }
        }
        stopped
    }

    pub fn session_metrics(&self) -> Vec<SessionMetrics> {
        let now = Instant::now();
        self.sessions_snapshot()
            .iter()
            .map(|session| session.metrics(now))
            .collect()
    }

    pub fn stats(&self) -> EngineStats {
        let active = self.active_session_count();
        EngineStats {
            persona: self.persona.as_str().to_owned(),
            active_sessions: active,
            total_sessions: self.session_count(),
            max_sessions: WORKER_SESSION_CAPACITY,
            capacity_used_percent: (active as f64 / WORKER_SESSION_CAPACITY as f64) * 100.0,
            update_interval_ms: u64::try_from(self.update_interval.as_millis()).unwrap_or(0),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Stop the scheduler and every session. Bound to process shutdown.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let ids: Vec<String> = self
            .sessions_snapshot()
            .iter()
            .map(|session| session.id().to_owned())
            .collect();
        for id in ids {
            self.stop_session(&id).await;
        }
        if let Some(handle) = self.scheduler_handle.lock().take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EngineStats {
    pub persona: String,
    pub active_sessions: usize,
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub capacity_used_percent: f64,
    pub update_interval_ms: u64,
    pub total_connections: u64,
    pub uptime_seconds: u64,
}
