use thiserror::Error;

use super::{ConfigError, SupervisorError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("HTTP client error: {source}")]
    Reqwest {
        #[from]
        source: reqwest::Error,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

pub type AppResult<T> = Result<T, AppError>;
