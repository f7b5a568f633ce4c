use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unknown persona: {name}")]
    UnknownPersona { name: String },
    #[error("Worker capacity exceeded ({active}/{limit} sessions)")]
    AtCapacity { active: usize, limit: usize },
    #[error("This worker handles {expected}, not {got}")]
    WrongPersona { expected: String, got: String },
    #[error("Session not found: {id}")]
    NotFound { id: String },
    #[error("Session transport closed")]
    TransportClosed,
    #[error("Send timed out after {timeout_ms}ms")]
    SendTimeout { timeout_ms: u64 },
    #[error("Invalid profile update: {reason}")]
    InvalidUpdate { reason: String },
    #[error("Frame encoding failed: {source}")]
    Encode { source: serde_json::Error },
}
