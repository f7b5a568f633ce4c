use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to locate the server executable: {source}")]
    CurrentExe { source: std::io::Error },
    #[error("Failed to spawn {persona} worker on port {port}: {source}")]
    Spawn {
        persona: String,
        port: u16,
        source: std::io::Error,
    },
    #[error("{persona} worker on port {port} never became healthy")]
    NeverHealthy { persona: String, port: u16 },
    #[error("{persona} worker exceeded the restart limit ({attempts} attempts)")]
    RestartLimit { persona: String, attempts: u32 },
    #[error("Multiprocess household is disabled")]
    Disabled,
}
