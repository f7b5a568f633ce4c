//! Persona worker: a standalone HTTP+WebSocket server bound to one
//! canonical port, serving exactly one persona's traffic shape.
mod routes;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;

use crate::args::WorkerArgs;
use crate::config::ServiceConfig;
use crate::error::AppResult;
use crate::household::{Persona, SessionEngine};
use crate::limit::RateLimiter;
use crate::pool::DataPool;
use crate::shutdown::{setup_signal_shutdown_handler, shutdown_channel};

const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct WorkerState {
    pub engine: Arc<SessionEngine>,
    pub limiter: Arc<RateLimiter>,
    pub persona: Persona,
    pub port: u16,
}

/// Worker entry point. Binds only the assigned port and serves this
/// persona's WebSocket endpoint plus health, stats, update-profile and
/// stop-session.
///
/// # Errors
/// Returns an error when configuration, TLS material or the bind fails.
pub async fn run(args: &WorkerArgs) -> AppResult<()> {
    let config = ServiceConfig::load(None)?;
    let pool = Arc::new(DataPool::generate());
    let engine = SessionEngine::new(args.persona, pool);
    let limiter = Arc::new(RateLimiter::new(config.limits.clone()));

    let state = WorkerState {
        engine: Arc::clone(&engine),
        limiter,
        persona: args.persona,
        port: args.port,
    };
    let app = routes::router(state);

    let shutdown_tx = shutdown_channel();
    let signal_task = setup_signal_shutdown_handler(&shutdown_tx);
    let handle = Handle::new();
    {
        let handle = handle.clone();
        let engine = Arc::clone(&engine);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            drop(shutdown_rx.recv().await);
            engine.shutdown().await;
            handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
        });
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!(persona = %args.persona, %addr, "worker listening");

    match args.tls_paths() {
        Some((key, cert)) => {
            let tls = RustlsConfig::from_pem_file(cert, key).await?;
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await?;
        }
        None => {
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await?;
        }
    }

    signal_task.abort();
    tracing::info!(persona = %args.persona, "worker shutdown complete");
    Ok(())
}
