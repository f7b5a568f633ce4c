//! Virtual-household traffic core: persona profiles, per-session state,
//! the shaping engine and its background scheduler, and the WebSocket wire
//! messages shared by workers and clients.
mod engine;
mod latency;
mod messages;
mod profile;
mod scheduler;
mod session;
mod shaping;

#[cfg(test)]
mod tests;

pub use engine::{EngineStats, SessionEngine, WORKER_SESSION_CAPACITY};
pub use latency::{LatencyMetrics, LatencyTracker, Severity};
pub use messages::{FinalMetrics, ProfileInfo, SessionMetrics, WsMessage};
pub use profile::{
    BurstPattern, BurstPhase, BurstState, MAX_ADAPTIVE_DOWNLOAD_MBPS, Persona, ProfileUpdate,
    UserProfile,
};
pub use session::{ExpiryReason, OutboundFrame, TrafficSession};

/// Milliseconds since the Unix epoch, as carried in wire timestamps.
pub fn epoch_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}
