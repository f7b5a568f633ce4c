use thiserror::Error;

/// Admission refusals. Every variant maps to an HTTP 429 or a WebSocket
/// close 1008 at the edge; the wording is shown to end users, so it spells
/// out that many customers can share one public IP.
#[derive(Debug, Error)]
pub enum LimitError {
    #[error(
        "Too many download connections from your IP ({active}/{limit}). Multiple customers may \
         share your IP address. Please wait for current tests to complete."
    )]
    TooManyDownloads { active: u32, limit: u32 },
    #[error(
        "Too many upload connections from your IP ({active}/{limit}). Multiple customers may \
         share your IP address. Please wait for current tests to complete."
    )]
    TooManyUploads { active: u32, limit: u32 },
    #[error(
        "Connection limit exceeded: {active}/{limit} household sessions active. Multiple \
         customers may share your IP address. Please close unused connections."
    )]
    TooManyWebsockets { active: u32, limit: u32 },
    #[error("Rate limit exceeded: {used}/{limit} download tests used this hour")]
    TestQuotaExceeded { used: u32, limit: u32 },
    #[error("Bandwidth limit exceeded: {used_gb:.1}/{limit_gb}GB used this hour")]
    BandwidthQuotaExceeded { used_gb: f64, limit_gb: u64 },
    #[error("Too many ping requests from your IP ({count}/{limit} per minute)")]
    PingQuotaExceeded { count: u32, limit: u32 },
}
