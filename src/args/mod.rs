//! CLI argument types for the main server and persona workers.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::household::Persona;

/// Bufferbloat and multi-user contention test service.
#[derive(Debug, Parser)]
#[command(name = "contend", version, about, long_about = None)]
pub struct ServerArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Port for the main HTTP server.
    #[arg(short, long, default_value_t = 8000)]
    pub port: u16,

    /// Port for the isolated ping listener.
    #[arg(long, default_value_t = 8005, env = "CONTEND_PING_PORT")]
    pub ping_port: u16,

    /// TLS private key path. TLS is enabled only when both --tls-key and
    /// --tls-cert are given.
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// TLS certificate path.
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// Production mode (disables development conveniences).
    #[arg(long)]
    pub production: bool,

    /// Directory holding the static client bundle, mounted after the API
    /// routes so API paths always win.
    #[arg(long, default_value = "./client")]
    pub static_dir: PathBuf,

    /// Optional TOML config file. `contend.toml` in the working directory
    /// is picked up automatically when present.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose logging (equivalent to CONTEND_LOG=debug).
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a single persona worker. Normally spawned by the supervisor;
    /// running one by hand is useful for debugging a single traffic shape.
    Worker(WorkerArgs),
}

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Persona served by this worker.
    #[arg(long, value_enum)]
    pub persona: Persona,

    /// Port to bind. The supervisor passes the canonical per-persona port.
    #[arg(long)]
    pub port: u16,

    /// TLS private key path.
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// TLS certificate path.
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// Verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServerArgs {
    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (self.tls_key.as_ref(), self.tls_cert.as_ref()) {
            (Some(key), Some(cert)) => Some((key, cert)),
            (Some(_), None) | (None, Some(_)) | (None, None) => None,
        }
    }
}

impl WorkerArgs {
    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (self.tls_key.as_ref(), self.tls_cert.as_ref()) {
            (Some(key), Some(cert)) => Some((key, cert)),
            (Some(_), None) | (None, Some(_)) | (None, None) => None,
        }
    }
}
