//! Main server: static client, HTTP test surface, household lookup and the
//! isolated ping listener.
mod endpoints;
mod pingd;
mod routes;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;

use crate::args::ServerArgs;
use crate::config::ServiceConfig;
use crate::error::AppResult;
use crate::limit::RateLimiter;
use crate::pool::DataPool;
use crate::shutdown::{setup_signal_shutdown_handler, shutdown_channel};
use crate::supervisor::Supervisor;

const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);
const RELAY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServiceConfig>,
    pub limiter: Arc<RateLimiter>,
    pub pool: Arc<DataPool>,
    pub supervisor: Option<Arc<Supervisor>>,
    pub tls_enabled: bool,
    pub relay: reqwest::Client,
}

impl ServerState {
    pub(crate) const fn worker_scheme(&self) -> &'static str {
        if self.tls_enabled { "https" } else { "http" }
    }
}

/// Main entry point: bring up the supervisor (unless disabled), then serve
/// the HTTP surface and the isolated ping listener until shutdown.
///
/// # Errors
/// Any startup failure (config, TLS material, bind) is fatal and bubbles to
/// `main`, which exits 1.
pub async fn run(args: &ServerArgs) -> AppResult<()> {
    let config = Arc::new(ServiceConfig::load(args.config.as_deref())?);
    tracing::info!(
        mode = config.server_mode.as_str(),
        multiprocess = config.multiprocess_enabled,
        telemetry = config.telemetry_enabled,
        production = args.production,
        "starting contention test service"
    );

    let pool = Arc::new(DataPool::generate());
    let limiter = Arc::new(RateLimiter::new(config.limits.clone()));
    let tls: Option<(PathBuf, PathBuf)> = args
        .tls_paths()
        .map(|(key, cert)| (key.clone(), cert.clone()));

    let supervisor = if config.multiprocess_enabled {
        let supervisor = Supervisor::new(tls.clone())?;
        match supervisor.start().await {
            Ok(()) => Some(supervisor),
            Err(err) => {
                tracing::error!(error = %err, "household supervisor failed to start");
                None
            }
        }
    } else {
        tracing::info!("multiprocess household disabled by configuration");
        None
    };

    let relay = reqwest::Client::builder()
        .timeout(RELAY_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .build()?;

    let state = ServerState {
        config,
        limiter,
        pool,
        supervisor: supervisor.clone(),
        tls_enabled: tls.is_some(),
        relay,
    };

    let app = routes::router(state.clone(), &args.static_dir);
    let ping_app = pingd::router(state);

    let shutdown_tx = shutdown_channel();
    let signal_task = setup_signal_shutdown_handler(&shutdown_tx);
    let main_handle = Handle::new();
    let ping_handle = Handle::new();
    {
        let main_handle = main_handle.clone();
        let ping_handle = ping_handle.clone();
        let supervisor = supervisor.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            drop(shutdown_rx.recv().await);
            tracing::info!("shutting down");
            if let Some(supervisor) = supervisor {
                supervisor.shutdown().await;
            }
            main_handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
            ping_handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
        });
    }

    let main_addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let ping_addr = SocketAddr::from(([0, 0, 0, 0], args.ping_port));
    tracing::info!(%main_addr, %ping_addr, tls = tls.is_some(), "listening");

    tokio::try_join!(
        serve(main_addr, app, tls.as_ref(), main_handle),
        serve(ping_addr, ping_app, tls.as_ref(), ping_handle),
    )?;

    signal_task.abort();
    tracing::info!("shutdown complete");
    Ok(())
}

async fn serve(
    addr: SocketAddr,
    app: Router,
    tls: Option<&(PathBuf, PathBuf)>,
    handle: Handle,
) -> AppResult<()> {
    match tls {
        Some((key, cert)) => {
            let tls_config = RustlsConfig::from_pem_file(cert, key).await?;
            axum_server::bind_rustls(addr, tls_config)
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
    Ok(())
}
