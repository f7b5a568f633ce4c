use std::future::Future;
use std::path::PathBuf;
#[cfg(unix)]
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::Supervisor;
#[cfg(unix)]
use crate::household::Persona;

fn run_async_test<TFut>(future: TFut) -> Result<(), String>
where
    TFut: Future<Output = Result<(), String>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| format!("Failed to build runtime: {}", err))?;
    runtime.block_on(future)
}

/// One-endpoint HTTP server answering every request with a canned JSON
/// body, for driving the health probe without a real worker.
async fn spawn_canned_health(body: &'static str) -> Result<u16, String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|err| format!("bind canned server failed: {}", err))?;
    let port = listener
        .local_addr()
        .map_err(|err| format!("canned server addr failed: {}", err))?
        .port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _peer)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buffer = [0u8; 1024];
                if stream.read(&mut buffer).await.is_err() {
                    return;
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: \
                     {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                drop(stream.write_all(response.as_bytes()).await);
            });
        }
    });
    Ok(port)
}

#[test]
fn fresh_supervisor_reports_empty_fleet() -> Result<(), String> {
    let supervisor =
        Supervisor::new(None).map_err(|err| format!("supervisor build failed: {}", err))?;
    if supervisor.is_running() {
        return Err("supervisor must not run before start()".to_owned());
    }
    if supervisor.tls_enabled() {
        return Err("tls should be off without cert material".to_owned());
    }
    let stats = supervisor.system_stats();
    if stats.total_processes != 0 || stats.healthy_processes != 0 {
        return Err("no workers should be registered before start()".to_owned());
    }
    if !supervisor.healthy_personas().is_empty() {
        return Err("no persona should be healthy before start()".to_owned());
    }
    Ok(())
}

#[test]
fn tls_material_switches_the_probe_scheme() -> Result<(), String> {
    let supervisor = Supervisor::new(Some((
        PathBuf::from("key.pem"),
        PathBuf::from("cert.pem"),
    )))
    .map_err(|err| format!("supervisor build failed: {}", err))?;
    if !supervisor.tls_enabled() {
        return Err("tls paths should enable https probing".to_owned());
    }
    Ok(())
}

#[test]
fn health_probe_requires_a_healthy_status_body() -> Result<(), String> {
    run_async_test(async {
        let supervisor =
            Supervisor::new(None).map_err(|err| format!("supervisor build failed: {}", err))?;

        let healthy_port = spawn_canned_health(r#"{"status":"healthy","persona":"gamer"}"#).await?;
        if !supervisor.check_health(healthy_port).await {
            return Err("a healthy body must pass the probe".to_owned());
        }

        let degraded_port = spawn_canned_health(r#"{"status":"degraded"}"#).await?;
        if supervisor.check_health(degraded_port).await {
            return Err("a 200 with a non-healthy status must fail the probe".to_owned());
        }

        let empty_port = spawn_canned_health("{}").await?;
        if supervisor.check_health(empty_port).await {
            return Err("a body without a status field must fail the probe".to_owned());
        }

        // Nothing listening at all: connection refused, probe fails.
        let free_port = {
            let probe = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .map_err(|err| format!("bind probe failed: {}", err))?;
            probe
                .local_addr()
                .map_err(|err| format!("probe addr failed: {}", err))?
                .port()
        };
        if supervisor.check_health(free_port).await {
            return Err("a dead port must fail the probe".to_owned());
        }
        Ok(())
    })
}

#[cfg(unix)]
#[test]
fn terminate_child_stops_a_cooperative_child_on_sigterm() -> Result<(), String> {
    run_async_test(async {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| format!("spawn sleep failed: {}", err))?;
        let started = Instant::now();
        super::terminate_child(Persona::Gamer, child).await;
        // `sleep` dies on SIGTERM; the 5 s join and the kill escalation
        // must never be reached for a cooperative child.
        if started.elapsed() > Duration::from_secs(4) {
            return Err("SIGTERM path took the kill-escalation timing".to_owned());
        }
        Ok(())
    })
}
