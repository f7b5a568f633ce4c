use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::SessionError;

use super::epoch_ms;
use super::latency::LatencyTracker;
use super::messages::{FinalMetrics, SessionMetrics, WsMessage};
use super::profile::{BurstPhase, BurstState, ProfileUpdate, UserProfile};

pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_CONNECTION_FAILURES: u32 = 3;
const RATE_WINDOW: Duration = Duration::from_secs(2);
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Frame handed to the session's dedicated writer task. The writer owns the
/// socket sink, so producers (scheduler, message loop, latency task) never
/// contend on the transport itself.
#[derive(Debug)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    Inactive,
    DurationCap,
    ConnectionFailures,
}

impl ExpiryReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactivity_timeout",
            Self::DurationCap => "duration_cap",
            Self::ConnectionFailures => "connection_failures",
        }
    }
}

/// Rolling 2 s byte accumulator. Bytes and window start reset together, so
/// the reported *current* rate never mixes windows.
#[derive(Debug)]
pub struct RateWindow {
    bytes: u64,
    window_start: Instant,
    last_rate_mbps: f64,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            bytes: 0,
            window_start: now,
            last_rate_mbps: 0.0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.bytes = self.bytes.saturating_add(bytes);
    }

    /// Current throughput in Mb/s. Rolls the window every 2 s; inside a
    /// window the previously computed rate is reported.
    pub fn current_rate_mbps(&mut self, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.window_start);
        if elapsed >= RATE_WINDOW {
            let secs = elapsed.as_secs_f64();
            let rate = if secs > 0.0 {
                (self.bytes as f64 * 8.0) / (secs * 1_000_000.0)
            } else {
                0.0
            };
            self.bytes = 0;
            self.window_start = now;
            self.last_rate_mbps = rate;
        }
        self.last_rate_mbps
    }
}

#[derive(Debug)]
pub struct RateWindows {
    pub download: RateWindow,
    pub upload: RateWindow,
}

pub struct TrafficSession {
    id: String,
    start: Instant,
    out_tx: mpsc::Sender<OutboundFrame>,
    profile: Mutex<UserProfile>,
    pending_update: Mutex<Option<ProfileUpdate>>,
    burst: Mutex<BurstState>,
    latency: Mutex<LatencyTracker>,
    latency_task: Mutex<Option<AbortHandle>>,
    windows: Mutex<RateWindows>,
    server_sent_bytes: AtomicU64,
    server_received_bytes: AtomicU64,
    client_received_bytes: AtomicU64,
    client_sent_bytes: AtomicU64,
    /// Milliseconds since `start`, so activity updates stay lock-free.
    last_activity_ms: AtomicU64,
    active: AtomicBool,
    connection_test_failures: AtomicU32,
}

impl TrafficSession {
    pub fn new(
        id: String,
        profile: UserProfile,
        out_tx: mpsc::Sender<OutboundFrame>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            start: now,
            out_tx,
            profile: Mutex::new(profile),
            pending_update: Mutex::new(None),
            burst: Mutex::new(BurstState::new(now)),
            latency: Mutex::new(LatencyTracker::new()),
            latency_task: Mutex::new(None),
            windows: Mutex::new(RateWindows {
                download: RateWindow::new(now),
                upload: RateWindow::new(now),
            }),
            server_sent_bytes: AtomicU64::new(0),
            server_received_bytes: AtomicU64::new(0),
            client_received_bytes: AtomicU64::new(0),
            client_sent_bytes: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            active: AtomicBool::new(true),
            connection_test_failures: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn started(&self) -> Instant {
        self.start
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn touch_activity(&self, now: Instant) {
        let millis = u64::try_from(now.duration_since(self.start).as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.store(millis, Ordering::Release);
    }

    pub fn profile_snapshot(&self) -> UserProfile {
        self.profile.lock().clone()
    }

    pub fn queue_profile_update(&self, update: ProfileUpdate) {
        *self.pending_update.lock() = Some(update);
    }

    /// Consume the pending profile update, if any. Called once per shaping
    /// tick before target computation so updates never race the shaper.
    pub fn apply_pending_update(&self) {
        let pending = self.pending_update.lock().take();
        if let Some(update) = pending {
            let mut profile = self.profile.lock();
            update.apply(&mut profile);
            tracing::debug!(
                session = %self.id,
                download_mbps = profile.download_mbps,
                "profile update applied at tick boundary"
            );
        }
    }

    pub fn with_burst<TOut>(&self, apply: impl FnOnce(&mut BurstState) -> TOut) -> TOut {
        apply(&mut self.burst.lock())
    }

    pub fn with_latency<TOut>(&self, apply: impl FnOnce(&mut LatencyTracker) -> TOut) -> TOut {
        apply(&mut self.latency.lock())
    }

    pub fn set_latency_task(&self, handle: AbortHandle) {
        *self.latency_task.lock() = Some(handle);
    }

    pub fn abort_latency_task(&self) {
        if let Some(handle) = self.latency_task.lock().take() {
            handle.abort();
        }
    }

    pub fn record_download_bytes(&self, bytes: u64) {
        self.server_sent_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.windows.lock().download.record(bytes);
    }

    pub fn record_upload_bytes(&self, bytes: u64, now: Instant) {
        self.server_received_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.windows.lock().upload.record(bytes);
        self.touch_activity(now);
    }

    pub fn record_client_confirmation(&self, received: u64, sent: u64) {
        self.client_received_bytes.store(received, Ordering::Relaxed);
        self.client_sent_bytes.store(sent, Ordering::Relaxed);
    }

    pub fn connection_test_failed(&self) -> u32 {
        self.connection_test_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1)
    }

    pub fn connection_test_passed(&self, now: Instant) {
        self.connection_test_failures.store(0, Ordering::Release);
        self.touch_activity(now);
    }

    /// Why this session should be cleaned up, if at all.
    pub fn expiry_reason(&self, now: Instant) -> Option<ExpiryReason> {
        let elapsed = now.duration_since(self.start);
        let last_activity = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        if elapsed.saturating_sub(last_activity) > INACTIVITY_TIMEOUT {
            return Some(ExpiryReason::Inactive);
        }
        let max_duration = self.profile.lock().max_session_duration();
        if elapsed > max_duration {
            return Some(ExpiryReason::DurationCap);
        }
        if self.connection_test_failures.load(Ordering::Acquire) >= MAX_CONNECTION_FAILURES {
            return Some(ExpiryReason::ConnectionFailures);
        }
        None
    }

    /// Session id suffix convention: `<persona>_<epoch_ms>`; the test id is
    /// `floor(epoch_ms / 1000)`. The legacy literal `all` matches any
    /// session.
    pub fn matches_test_id(&self, test_id: &str) -> bool {
        if test_id.eq_ignore_ascii_case("all") {
            return true;
        }
        let requested = test_id.parse::<u64>().ok();
        self.id
            .rsplit_once('_')
            .and_then(|(_persona, millis)| millis.parse::<u64>().ok())
            .and_then(|millis| millis.checked_div(1000))
            .is_some_and(|secs| requested == Some(secs))
    }

    /// Enqueue a text frame to the writer with the bounded send deadline.
    ///
    /// # Errors
    /// `SendTimeout` when the outbound channel stays full past the deadline
    /// (slow peer backpressure) and `TransportClosed` once the writer is
    /// gone. Callers decide whether to mark the session inactive.
    pub async fn send_message(&self, message: &WsMessage) -> Result<(), SessionError> {
        let payload =
            serde_json::to_string(message).map_err(|err| SessionError::Encode { source: err })?;
        self.send_frame(OutboundFrame::Text(payload)).await
    }

    /// # Errors
    /// Same contract as [`Self::send_message`].
    pub async fn send_binary(&self, chunk: Bytes) -> Result<(), SessionError> {
        self.send_frame(OutboundFrame::Binary(chunk)).await
    }

    async fn send_frame(&self, frame: OutboundFrame) -> Result<(), SessionError> {
        match tokio::time::timeout(SEND_TIMEOUT, self.out_tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_closed)) => Err(SessionError::TransportClosed),
            Err(_elapsed) => Err(SessionError::SendTimeout {
                timeout_ms: u64::try_from(SEND_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    pub fn metrics(&self, now: Instant) -> SessionMetrics {
        let elapsed = now.duration_since(self.start).as_secs_f64();
        let server_sent = self.server_sent_bytes.load(Ordering::Relaxed);
        let server_received = self.server_received_bytes.load(Ordering::Relaxed);
        let client_received = self.client_received_bytes.load(Ordering::Relaxed);
        let client_sent = self.client_sent_bytes.load(Ordering::Relaxed);

        let (actual_download, actual_upload) = {
            let mut windows = self.windows.lock();
            (
                windows.download.current_rate_mbps(now),
                windows.upload.current_rate_mbps(now),
            )
        };
        let (burst_phase, cycle_count) = {
            let burst = self.burst.lock();
            let phase = match burst.phase {
                BurstPhase::Active => "active",
                BurstPhase::Idle => "idle",
            };
            (phase.to_owned(), burst.cycle_count)
        };
        let latency_metrics = self.latency.lock().metrics();
        let profile = self.profile.lock();

        SessionMetrics {
            user_id: self.id.clone(),
            profile_name: profile.name.clone(),
            target_download_mbps: profile.download_mbps,
            target_upload_mbps: profile.upload_mbps,
            actual_download_mbps: round2(throughput_or_zero(actual_download)),
            actual_upload_mbps: round2(throughput_or_zero(actual_upload)),
            cumulative_download_mbps: round2(cumulative_mbps(client_received, elapsed)),
            cumulative_upload_mbps: round2(cumulative_mbps(client_sent, elapsed)),
            server_sent_bytes: server_sent,
            server_received_bytes: server_received,
            client_received_bytes: client_received,
            client_sent_bytes: client_sent,
            elapsed_seconds: round1(elapsed),
            active: self.is_active(),
            timestamp: epoch_ms(),
            burst_phase,
            cycle_count,
            ping_ms: latency_metrics.current_latency,
            jitter_ms: latency_metrics.jitter,
            bufferbloat_severity: latency_metrics.bufferbloat_severity,
            latency_metrics,
        }
    }

    pub fn final_metrics(&self, now: Instant) -> FinalMetrics {
        FinalMetrics {
            metrics: self.metrics(now),
            session_duration: round1(now.duration_since(self.start).as_secs_f64()),
        }
    }
}

fn cumulative_mbps(bytes: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / (elapsed_secs * 1_000_000.0)
}

const fn throughput_or_zero(rate: f64) -> f64 {
    if rate.is_finite() { rate } else { 0.0 }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
