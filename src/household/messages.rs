//! JSON text frames exchanged over the household WebSocket.
//!
//! Every frame is an object with a required `type` tag. Unknown tags fail
//! deserialization and are ignored by the receiver.
use serde::{Deserialize, Serialize};

use super::latency::{LatencyMetrics, Severity};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    // Server-originated.
    SessionInfo {
        user_id: String,
        profile: ProfileInfo,
        real_traffic: bool,
        timestamp: f64,
    },
    RealTimeUpdate(Box<SessionMetrics>),
    SessionComplete(Box<FinalMetrics>),
    RealUploadRequest {
        target_bytes: u64,
        optimal_chunk_size: u64,
        duration_ms: u64,
        timestamp: f64,
    },
    ConnectionTest {
        user_id: String,
        timestamp: f64,
    },
    StopTestAck {
        user_id: String,
        timestamp: f64,
        message: String,
    },
    MultistreamData {
        stream_id: u8,
        chunk_id: u64,
        data_size: u64,
        timestamp: f64,
    },
    // Both directions: the server pings every 500 ms for the latency
    // tracker; clients may ping on their own and get an echo back.
    Ping {
        user_id: Option<String>,
        sequence: u64,
        timestamp: f64,
    },
    Pong {
        user_id: Option<String>,
        sequence: u64,
        timestamp: f64,
        server_timestamp: Option<f64>,
    },
    // Client-originated.
    RealUploadData {
        size: u64,
    },
    BulkUploadData {
        size: u64,
    },
    ClientConfirmation {
        received_bytes: u64,
        sent_bytes: u64,
    },
    StopTest,
    ConnectionTestResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub persona: String,
    pub name: String,
    pub description: String,
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub user_id: String,
    pub profile_name: String,
    pub target_download_mbps: f64,
    pub target_upload_mbps: f64,
    /// Current rates from the rolling 2 s windows, not cumulative averages.
    pub actual_download_mbps: f64,
    pub actual_upload_mbps: f64,
    pub cumulative_download_mbps: f64,
    pub cumulative_upload_mbps: f64,
    pub server_sent_bytes: u64,
    pub server_received_bytes: u64,
    pub client_received_bytes: u64,
    pub client_sent_bytes: u64,
    pub elapsed_seconds: f64,
    pub active: bool,
    pub timestamp: f64,
    pub burst_phase: String,
    pub cycle_count: u64,
    pub latency_metrics: LatencyMetrics,
    pub ping_ms: f64,
    pub jitter_ms: f64,
    pub bufferbloat_severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalMetrics {
    #[serde(flatten)]
    pub metrics: SessionMetrics,
    pub session_duration: f64,
}
