//! Process supervisor: one worker process per persona on its canonical
//! port, health-monitored over HTTP, restarted within a bounded budget.
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{AppResult, SupervisorError};
use crate::household::Persona;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_WARMUP: Duration = Duration::from_secs(8);
const STARTUP_ATTEMPTS: u32 = 3;
const STARTUP_ATTEMPT_SPACING: Duration = Duration::from_secs(5);
const MAX_RESTART_ATTEMPTS: u32 = 3;
const RESTART_DELAY: Duration = Duration::from_secs(2);
const TERM_JOIN: Duration = Duration::from_secs(5);
const KILL_JOIN: Duration = Duration::from_secs(2);

struct WorkerEntry {
    port: u16,
    /// `None` for adopted workers detected over HTTP at startup.
    child: Option<Child>,
    started: Instant,
    restart_count: u32,
    healthy: bool,
}

pub struct Supervisor {
    client: reqwest::Client,
    scheme: &'static str,
    tls: Option<(PathBuf, PathBuf)>,
    workers: Mutex<HashMap<Persona, WorkerEntry>>,
    running: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
    total_started: AtomicU64,
    total_restarts: AtomicU64,
    started_at: Instant,
}

impl Supervisor {
    /// # Errors
    /// Fails only when the HTTP client cannot be constructed.
    pub fn new(tls: Option<(PathBuf, PathBuf)>) -> AppResult<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_CHECK_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        let scheme = if tls.is_some() { "https" } else { "http" };
        Ok(Arc::new(Self {
            client,
            scheme,
            tls,
            workers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            monitor: Mutex::new(None),
            total_started: AtomicU64::new(0),
            total_restarts: AtomicU64::new(0),
            started_at: Instant::now(),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub const fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Bring the fleet up: adopt pre-existing workers when every canonical
    /// port already answers healthy, otherwise spawn children and wait out
    /// the startup budget. The monitor loop starts either way.
    ///
    /// # Errors
    /// Propagates spawn failures (executable missing, port conflicts
    /// surface later through health checks instead).
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        if self.detect_existing().await {
            tracing::info!("adopted existing persona workers");
        } else {
            self.spawn_all()?;
            self.await_startup_health().await;
        }
        self.running.store(true, Ordering::Release);
        let monitor = spawn_monitor(Arc::clone(self));
        *self.monitor.lock() = Some(monitor);
        Ok(())
    }

    /// Pre-existing workers are registered without a process handle and
    /// verified over HTTP only.
    async fn detect_existing(&self) -> bool {
        let mut detected = Vec::new();
        for persona in Persona::ALL {
            if self.check_health(persona.port()).await {
                detected.push(persona);
            }
        }
        if detected.len() != Persona::ALL.len() {
            return false;
        }
        let now = Instant::now();
        let mut workers = self.workers.lock();
        for persona in detected {
            workers.insert(
                persona,
                WorkerEntry {
                    port: persona.port(),
                    child: None,
                    started: now,
                    restart_count: 0,
                    healthy: true,
                },
            );
        }
        true
    }

    fn spawn_all(&self) -> AppResult<()> {
        for persona in Persona::ALL {
            let port = persona.port();
            let child = self.spawn_worker(persona, port)?;
            tracing::info!(persona = %persona, port, pid = child.id(), "worker spawned");
            self.total_started.fetch_add(1, Ordering::Relaxed);
            self.workers.lock().insert(
                persona,
                WorkerEntry {
                    port,
                    child: Some(child),
                    started: Instant::now(),
                    restart_count: 0,
                    healthy: false,
                },
            );
        }
        Ok(())
    }

    fn spawn_worker(&self, persona: Persona, port: u16) -> Result<Child, SupervisorError> {
        let exe = std::env::current_exe()
            .map_err(|err| SupervisorError::CurrentExe { source: err })?;
        let mut command = Command::new(exe);
        command
            .arg("worker")
            .arg("--persona")
            .arg(persona.as_str())
            .arg("--port")
            .arg(port.to_string());
        if let Some((key, cert)) = self.tls.as_ref() {
            command.arg("--tls-key").arg(key).arg("--tls-cert").arg(cert);
        }
        command.kill_on_drop(true);
        command.spawn().map_err(|err| SupervisorError::Spawn {
            persona: persona.as_str().to_owned(),
            port,
            source: err,
        })
    }

    /// Cold boots are slow: one warmup delay, then a bounded number of
    /// health polls before the fleet is declared (un)healthy.
    async fn await_startup_health(&self) {
        tokio::time::sleep(STARTUP_WARMUP).await;
        for attempt in 1..=STARTUP_ATTEMPTS {
            let mut all_healthy = true;
            for persona in Persona::ALL {
                let healthy = self.check_health(persona.port()).await;
                if let Some(entry) = self.workers.lock().get_mut(&persona) {
                    entry.healthy = healthy;
                }
                if !healthy {
                    all_healthy = false;
                }
            }
            if all_healthy {
                tracing::info!("all persona workers healthy");
                return;
            }
            if attempt < STARTUP_ATTEMPTS {
                tokio::time::sleep(STARTUP_ATTEMPT_SPACING).await;
            }
        }
        for persona in Persona::ALL {
            let healthy = self
                .workers
                .lock()
                .get(&persona)
                .is_some_and(|entry| entry.healthy);
            if !healthy {
                let err = SupervisorError::NeverHealthy {
                    persona: persona.as_str().to_owned(),
                    port: persona.port(),
                };
                tracing::error!(error = %err, "startup health budget exhausted");
            }
        }
    }

    async fn check_health(&self, port: u16) -> bool {
        let url = format!("{}://127.0.0.1:{}/health", self.scheme, port);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(_) => return false,
        };
        if !response.status().is_success() {
            return false;
        }
        response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| {
                body.get("status")
                    .and_then(|status| status.as_str())
                    .map(|status| status == "healthy")
            })
            .unwrap_or(false)
    }

    /// One monitor pass over every persona. A dead managed child is
    /// restarted (after it has been joined) up to the restart budget;
    /// adopted and live workers are probed over HTTP.
    async fn monitor_pass(self: &Arc<Self>) {
        for persona in Persona::ALL {
            enum Next {
                Restart { port: u16, attempts: u32 },
                GiveUp { attempts: u32 },
                Probe { port: u16 },
                Skip,
            }
            let next = {
                let mut workers = self.workers.lock();
                match workers.get_mut(&persona) {
                    None => Next::Skip,
                    Some(entry) => match entry.child.as_mut() {
                        // try_wait both detects death and reaps the child,
                        // so a replacement is only ever spawned after the
                        // prior process is joined.
                        Some(child) => match child.try_wait() {
                            Ok(Some(status)) => {
                                tracing::warn!(persona = %persona, %status, "worker exited");
                                entry.healthy = false;
                                entry.child = None;
                                if entry.restart_count < MAX_RESTART_ATTEMPTS {
                                    Next::Restart {
                                        port: entry.port,
                                        attempts: entry.restart_count,
                                    }
                                } else {
                                    Next::GiveUp {
                                        attempts: entry.restart_count,
                                    }
                                }
                            }
                            Ok(None) => Next::Probe { port: entry.port },
                            Err(err) => {
                                tracing::error!(persona = %persona, error = %err, "child wait failed");
                                Next::Probe { port: entry.port }
                            }
                        },
                        None => Next::Probe { port: entry.port },
                    },
                }
            };
            match next {
                Next::Skip => {}
                Next::GiveUp { attempts } => {
                    let err = SupervisorError::RestartLimit {
                        persona: persona.as_str().to_owned(),
                        attempts,
                    };
                    tracing::error!(error = %err, "persona stays degraded");
                    self.workers.lock().remove(&persona);
                }
                Next::Restart { port, attempts } => {
                    tokio::time::sleep(RESTART_DELAY).await;
                    match self.spawn_worker(persona, port) {
                        Ok(child) => {
                            tracing::info!(
                                persona = %persona,
                                port,
                                attempt = attempts.saturating_add(1),
                                "worker restarted"
                            );
                            self.total_restarts.fetch_add(1, Ordering::Relaxed);
                            let mut workers = self.workers.lock();
                            if let Some(entry) = workers.get_mut(&persona) {
                                entry.child = Some(child);
                                entry.started = Instant::now();
                                entry.restart_count = entry.restart_count.saturating_add(1);
                                entry.healthy = false;
                            }
                        }
                        Err(err) => {
                            tracing::error!(persona = %persona, error = %err, "restart failed");
                        }
                    }
                }
                Next::Probe { port } => {
                    let healthy = self.check_health(port).await;
                    if let Some(entry) = self.workers.lock().get_mut(&persona) {
                        if entry.healthy && !healthy {
                            tracing::warn!(persona = %persona, "worker health check failed");
                        }
                        entry.healthy = healthy;
                    }
                }
            }
        }
    }

    /// Lookup support: the worker port, only while the worker is healthy.
    pub fn port_for(&self, persona: Persona) -> Option<u16> {
        self.workers
            .lock()
            .get(&persona)
            .and_then(|entry| entry.healthy.then_some(entry.port))
    }

    pub fn healthy_personas(&self) -> Vec<&'static str> {
        let workers = self.workers.lock();
        Persona::ALL
            .iter()
            .copied()
            .filter(|persona| workers.get(persona).is_some_and(|entry| entry.healthy))
            .map(Persona::as_str)
            .collect()
    }

    pub fn process_health(&self) -> HashMap<String, ProcessHealth> {
        let workers = self.workers.lock();
        workers
            .iter()
            .map(|(persona, entry)| {
                (
                    persona.as_str().to_owned(),
                    ProcessHealth {
                        is_healthy: entry.healthy,
                        port: entry.port,
                        pid: entry.child.as_ref().and_then(Child::id),
                        adopted: entry.child.is_none(),
                        uptime_seconds: entry.started.elapsed().as_secs(),
                        restart_count: entry.restart_count,
                    },
                )
            })
            .collect()
    }

    pub fn system_stats(&self) -> SupervisorStats {
        let health = self.process_health();
        let healthy = health.values().filter(|entry| entry.is_healthy).count();
        SupervisorStats {
            running: self.is_running(),
            healthy_processes: healthy,
            total_processes: health.len(),
            total_started: self.total_started.load(Ordering::Relaxed),
            total_restarts: self.total_restarts.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            process_health: health,
        }
    }

    /// Stop the monitor, then terminate every managed child: SIGTERM, join
    /// up to 5 s, kill, join up to 2 s. Adopted workers are left running.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        let children: Vec<(Persona, Child)> = {
            let mut workers = self.workers.lock();
            let mut drained = Vec::new();
            for (persona, entry) in workers.iter_mut() {
                if let Some(child) = entry.child.take() {
                    drained.push((*persona, child));
                }
            }
            workers.clear();
            drained
        };
        for (persona, child) in children {
            terminate_child(persona, child).await;
        }
        tracing::info!("supervisor shutdown complete");
    }
}

fn spawn_monitor(supervisor: Arc<Supervisor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !supervisor.is_running() {
                break;
            }
            supervisor.monitor_pass().await;
        }
    })
}

async fn terminate_child(persona: Persona, mut child: Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let raw = i32::try_from(pid).unwrap_or(0);
        if raw > 0 {
            // SAFETY: kill(2) on a pid this supervisor spawned and still
            // owns; no pointers or shared memory are involved.
            unsafe {
                libc::kill(raw, libc::SIGTERM);
            }
        }
    }
    match tokio::time::timeout(TERM_JOIN, child.wait()).await {
        Ok(_status) => {
            tracing::info!(persona = %persona, "worker terminated");
            return;
        }
        Err(_elapsed) => {
            tracing::warn!(persona = %persona, "worker ignored SIGTERM, killing");
        }
    }
    drop(child.start_kill());
    drop(tokio::time::timeout(KILL_JOIN, child.wait()).await);
}

#[derive(Debug, Serialize)]
pub struct ProcessHealth {
    pub is_healthy: bool,
    pub port: u16,
    pub pid: Option<u32>,
    pub adopted: bool,
    pub uptime_seconds: u64,
    pub restart_count: u32,
}

#[derive(Debug, Serialize)]
pub struct SupervisorStats {
    pub running: bool,
    pub healthy_processes: usize,
    pub total_processes: usize,
    pub total_started: u64,
    pub total_restarts: u64,
    pub uptime_seconds: u64,
    pub process_health: HashMap<String, ProcessHealth>,
}
