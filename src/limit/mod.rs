//! NAT-aware admission and rate limiting.
//!
//! One tracker per client IP behind a single mutex; every hold is O(1).
//! Limits are deliberately generous per IP because CGNAT deployments put
//! many customers behind one address. Successful acquires hand back an RAII
//! guard, so exactly one release runs on every exit path, including
//! cancellation.
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::LimitConfig;
use crate::error::LimitError;

const RECORD_WINDOW: Duration = Duration::from_secs(3600);
const PING_WINDOW: Duration = Duration::from_secs(60);
const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Client IP resolution: first `X-Forwarded-For` hop, else `X-Real-IP`,
/// else the peer address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok());
    if let Some(ip) = forwarded {
        return ip;
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .map_or_else(|| peer.ip(), |ip| ip)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Download,
    Upload,
    Websocket,
}

#[derive(Debug, Clone, Copy)]
struct DownloadRecord {
    at: Instant,
    bytes: u64,
    counts_as_test: bool,
}

#[derive(Debug, Default)]
struct ConnectionTracker {
    active_downloads: u32,
    active_uploads: u32,
    active_websockets: u32,
    download_records: Vec<DownloadRecord>,
    ping_times: Vec<Instant>,
}

impl ConnectionTracker {
    fn prune(&mut self, now: Instant) {
        self.download_records
            .retain(|record| now.duration_since(record.at) < RECORD_WINDOW);
        self.ping_times
            .retain(|at| now.duration_since(*at) < PING_WINDOW);
    }

    fn tests_this_hour(&self) -> u32 {
        let count = self
            .download_records
            .iter()
            .filter(|record| record.counts_as_test)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    fn bytes_this_hour(&self) -> u64 {
        self.download_records
            .iter()
            .fold(0u64, |sum, record| sum.saturating_add(record.bytes))
    }

    fn is_idle(&self) -> bool {
        self.active_downloads == 0
            && self.active_uploads == 0
            && self.active_websockets == 0
            && self.download_records.is_empty()
            && self.ping_times.is_empty()
    }
}

struct LimiterState {
    trackers: HashMap<IpAddr, ConnectionTracker>,
    last_global_cleanup: Instant,
}

pub struct RateLimiter {
    state: Mutex<LimiterState>,
    config: LimitConfig,
}

impl RateLimiter {
    pub fn new(config: LimitConfig) -> Self {
        tracing::info!(
            downloads_per_hour = config.downloads_per_hour,
            bandwidth_gb_per_hour = config.bandwidth_gb_per_hour,
            websocket_sessions = config.max_websocket_sessions,
            "rate limiter initialized"
        );
        Self {
            state: Mutex::new(LimiterState {
                trackers: HashMap::new(),
                last_global_cleanup: Instant::now(),
            }),
            config,
        }
    }

    /// The one admission seam. The old token-auth layer is gone; the only
    /// remaining bypass is the explicitly configured central-fleet token.
    pub fn is_exempt(&self, headers: &HeaderMap) -> bool {
        if !self.config.fleet_bypass {
            return false;
        }
        headers
            .get("user-agent")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|agent| agent.starts_with(self.config.fleet_user_agent.as_str()))
    }

    /// Acquire a concurrent download slot after the rolling-hour quota
    /// checks. The quota is evaluated before the slot so a refused request
    /// never consumes capacity. Warmup streams pass `count_as_test = false`:
    /// they hold a concurrent slot and their bytes count against the
    /// bandwidth budget, but they are not one of the hourly tests.
    ///
    /// # Errors
    /// `TestQuotaExceeded`, `BandwidthQuotaExceeded` or `TooManyDownloads`.
    pub fn acquire_download(
        self: &Arc<Self>,
        ip: IpAddr,
        count_as_test: bool,
    ) -> Result<SlotGuard, LimitError> {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            state.maybe_global_cleanup(now, self.config.cleanup_interval);
            let tracker = state.trackers.entry(ip).or_default();
            tracker.prune(now);

            let used = tracker.tests_this_hour();
            if used >= self.config.downloads_per_hour {
                return Err(LimitError::TestQuotaExceeded {
                    used,
                    limit: self.config.downloads_per_hour,
                });
            }
            let bytes = tracker.bytes_this_hour();
            if bytes >= self.config.bandwidth_bytes_per_hour() {
                return Err(LimitError::BandwidthQuotaExceeded {
                    used_gb: bytes as f64 / BYTES_PER_GIB,
                    limit_gb: self.config.bandwidth_gb_per_hour,
                });
            }
            if tracker.active_downloads >= self.config.max_download_conns {
                return Err(LimitError::TooManyDownloads {
                    active: tracker.active_downloads,
                    limit: self.config.max_download_conns,
                });
            }
            tracker.active_downloads = tracker.active_downloads.saturating_add(1);
            if count_as_test {
                tracker.download_records.push(DownloadRecord {
                    at: now,
                    bytes: 0,
                    counts_as_test: true,
                });
            }
        }
        Ok(SlotGuard::new(Arc::clone(self), ip, SlotKind::Download))
    }

    /// # Errors
    /// `TooManyUploads` when the concurrent upload cap is reached.
    pub fn acquire_upload(self: &Arc<Self>, ip: IpAddr) -> Result<SlotGuard, LimitError> {
        {
            let mut state = self.state.lock();
            let tracker = state.trackers.entry(ip).or_default();
            if tracker.active_uploads >= self.config.max_upload_conns {
                return Err(LimitError::TooManyUploads {
                    active: tracker.active_uploads,
                    limit: self.config.max_upload_conns,
                });
            }
            tracker.active_uploads = tracker.active_uploads.saturating_add(1);
        }
        Ok(SlotGuard::new(Arc::clone(self), ip, SlotKind::Upload))
    }

    /// # Errors
    /// `TooManyWebsockets` when the per-IP household session cap is reached.
    /// Surfaces at the edge as WebSocket close 1008.
    pub fn acquire_websocket(self: &Arc<Self>, ip: IpAddr) -> Result<SlotGuard, LimitError> {
        {
            let mut state = self.state.lock();
            let tracker = state.trackers.entry(ip).or_default();
            if tracker.active_websockets >= self.config.max_websocket_sessions {
                return Err(LimitError::TooManyWebsockets {
                    active: tracker.active_websockets,
                    limit: self.config.max_websocket_sessions,
                });
            }
            tracker.active_websockets = tracker.active_websockets.saturating_add(1);
        }
        Ok(SlotGuard::new(Arc::clone(self), ip, SlotKind::Websocket))
    }

    /// Count one ping against the rolling minute.
    ///
    /// # Errors
    /// `PingQuotaExceeded` past the per-minute ping budget.
    pub fn check_ping(&self, ip: IpAddr) -> Result<(), LimitError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let tracker = state.trackers.entry(ip).or_default();
        tracker.prune(now);
        let count = u32::try_from(tracker.ping_times.len()).unwrap_or(u32::MAX);
        if count >= self.config.pings_per_minute {
            return Err(LimitError::PingQuotaExceeded {
                count,
                limit: self.config.pings_per_minute,
            });
        }
        tracker.ping_times.push(now);
        Ok(())
    }

    fn release(&self, ip: IpAddr, kind: SlotKind, bytes: u64) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(tracker) = state.trackers.get_mut(&ip) {
            match kind {
                SlotKind::Download => {
                    tracker.active_downloads = tracker.active_downloads.saturating_sub(1);
                    if bytes > 0 {
                        tracker.download_records.push(DownloadRecord {
                            at: now,
                            bytes,
                            counts_as_test: false,
                        });
                    }
                }
                SlotKind::Upload => {
                    tracker.active_uploads = tracker.active_uploads.saturating_sub(1);
                }
                SlotKind::Websocket => {
                    tracker.active_websockets = tracker.active_websockets.saturating_sub(1);
                }
            }
        }
        state.maybe_global_cleanup(now, self.config.cleanup_interval);
    }

    pub fn usage(&self, ip: IpAddr) -> UsageStats {
        let now = Instant::now();
        let mut state = self.state.lock();
        let tracker = state.trackers.entry(ip).or_default();
        tracker.prune(now);
        UsageStats {
            tests_this_hour: tracker.tests_this_hour(),
            tests_limit: self.config.downloads_per_hour,
            bandwidth_this_hour_gb: tracker.bytes_this_hour() as f64 / BYTES_PER_GIB,
            bandwidth_limit_gb: self.config.bandwidth_gb_per_hour,
            active_downloads: tracker.active_downloads,
            max_downloads: self.config.max_download_conns,
            active_uploads: tracker.active_uploads,
            active_websocket_sessions: tracker.active_websockets,
            websocket_sessions_limit: self.config.max_websocket_sessions,
            pings_last_minute: u32::try_from(tracker.ping_times.len()).unwrap_or(u32::MAX),
            pings_limit: self.config.pings_per_minute,
        }
    }

    pub fn stats(&self) -> LimiterStats {
        let state = self.state.lock();
        let mut stats = LimiterStats {
            tracked_ips: state.trackers.len(),
            active_downloads: 0,
            active_uploads: 0,
            active_websockets: 0,
        };
        for tracker in state.trackers.values() {
            stats.active_downloads = stats
                .active_downloads
                .saturating_add(tracker.active_downloads);
            stats.active_uploads = stats.active_uploads.saturating_add(tracker.active_uploads);
            stats.active_websockets = stats
                .active_websockets
                .saturating_add(tracker.active_websockets);
        }
        stats
    }
}

impl LimiterState {
    fn maybe_global_cleanup(&mut self, now: Instant, interval: Duration) {
        if now.duration_since(self.last_global_cleanup) < interval {
            return;
        }
        let before = self.trackers.len();
        self.trackers.retain(|_ip, tracker| {
            tracker.prune(now);
            !tracker.is_idle()
        });
        let after = self.trackers.len();
        if after < before {
            tracing::info!(removed = before.saturating_sub(after), "rate limiter cleanup");
        }
        self.last_global_cleanup = now;
    }
}

/// RAII slot. Dropping releases the concurrent slot and, for downloads,
/// folds the observed byte count into the rolling-hour bandwidth history.
pub struct SlotGuard {
    limiter: Arc<RateLimiter>,
    ip: IpAddr,
    kind: SlotKind,
    bytes: AtomicU64,
}

impl SlotGuard {
    fn new(limiter: Arc<RateLimiter>, ip: IpAddr, kind: SlotKind) -> Self {
        Self {
            limiter,
            ip,
            kind,
            bytes: AtomicU64::new(0),
        }
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let bytes = self.bytes.load(Ordering::Relaxed);
        self.limiter.release(self.ip, self.kind, bytes);
    }
}

#[derive(Debug, Serialize)]
pub struct UsageStats {
    pub tests_this_hour: u32,
    pub tests_limit: u32,
    pub bandwidth_this_hour_gb: f64,
    pub bandwidth_limit_gb: u64,
    pub active_downloads: u32,
    pub max_downloads: u32,
    pub active_uploads: u32,
    pub active_websocket_sessions: u32,
    pub websocket_sessions_limit: u32,
    pub pings_last_minute: u32,
    pub pings_limit: u32,
}

#[derive(Debug, Serialize)]
pub struct LimiterStats {
    pub tracked_ips: usize,
    pub active_downloads: u32,
    pub active_uploads: u32,
    pub active_websockets: u32,
}
