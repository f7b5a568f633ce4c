use std::ffi::OsStr;
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Child process that is stopped (and reaped) when the test ends. On unix
/// the child gets SIGTERM first so the server's own shutdown path runs and
/// tears down any worker processes it supervises; kill is the escalation.
pub struct BinHandle {
    child: Child,
}

impl Drop for BinHandle {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Ok(pid) = i32::try_from(self.child.id()) {
                if pid > 0 {
                    // SAFETY: signalling a child this harness spawned and
                    // still owns; no memory is shared with it.
                    unsafe {
                        libc::kill(pid, libc::SIGTERM);
                    }
                }
            }
            let deadline = Instant::now()
                .checked_add(Duration::from_secs(5))
                .unwrap_or_else(Instant::now);
            while Instant::now() < deadline {
                match self.child.try_wait() {
                    Ok(Some(_status)) => return,
                    Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                    Err(_) => break,
                }
            }
        }
        drop(self.child.kill());
        drop(self.child.wait());
    }
}

/// Pick an available local TCP port.
///
/// # Errors
///
/// Returns an error if a local port cannot be allocated.
pub fn pick_port() -> Result<u16, String> {
    TcpListener::bind("127.0.0.1:0")
        .map_err(|err| format!("bind port failed: {}", err))?
        .local_addr()
        .map_err(|err| format!("port addr failed: {}", err))
        .map(|addr| addr.port())
}

/// Spawn the `contend` binary.
///
/// # Errors
///
/// Returns an error if the process cannot be started.
pub fn spawn_contend<I, S>(args: I, envs: &[(&str, &str)]) -> Result<BinHandle, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let bin = contend_bin()?;
    let mut command = Command::new(bin);
    command
        .args(args)
        .env("RUST_LOG", "error")
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for (key, value) in envs {
        command.env(key, value);
    }
    command
        .spawn()
        .map(|child| BinHandle { child })
        .map_err(|err| format!("spawn contend failed: {}", err))
}

/// Poll an HTTP endpoint until it answers 200 or the deadline passes.
///
/// # Errors
///
/// Returns an error when the endpoint never becomes ready.
pub async fn wait_until_ready(url: &str, timeout: Duration) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .map_err(|err| format!("client build failed: {}", err))?;
    let deadline = Instant::now()
        .checked_add(timeout)
        .ok_or_else(|| "deadline overflow".to_owned())?;
    loop {
        if let Ok(response) = client.get(url).send().await {
            if response.status().is_success() {
                return Ok(());
            }
        }
        if Instant::now() > deadline {
            return Err(format!("{} never became ready", url));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn contend_bin() -> Result<String, String> {
    option_env!("CARGO_BIN_EXE_contend").map_or_else(
        || Err("CARGO_BIN_EXE_contend missing at compile time.".to_owned()),
        |path| Ok(path.to_owned()),
    )
}
