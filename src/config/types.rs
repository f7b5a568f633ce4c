use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub limits: Option<LimitsSection>,
    pub upload: Option<UploadSection>,
    pub fleet: Option<FleetConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitsSection {
    pub max_download_connections: Option<u32>,
    pub max_upload_connections: Option<u32>,
    pub websocket_sessions: Option<u32>,
    pub downloads_per_hour: Option<u32>,
    pub bandwidth_gb_per_hour: Option<u64>,
    pub pings_per_minute: Option<u32>,
    pub cleanup_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadSection {
    pub mode: Option<String>,
    pub max_request_mb: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FleetConfig {
    pub bypass: Option<bool>,
    pub user_agent_prefix: Option<String>,
}
