//! Ownership of the local recognition service process.
//!
//! The service announces itself with one JSON line on stdout:
//!
//! ```text
//! {"event":"ready","address":"127.0.0.1:50051"}
//! ```
//!
//! Everything else it prints goes to the log. An exit the supervisor did not
//! ask for is reported on the exit channel so the owner can restart it.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::status::OcrAdapterStatus;
use crate::error::{OcrError, Result};

/// Command line of the service process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The service executable, pointed at its presets directory.
    pub fn service(executable: impl Into<PathBuf>, presets_dir: impl Into<PathBuf>) -> Self {
        Self::new(executable).arg(presets_dir.into().into_os_string())
    }
}

/// Bounded polling of an adapter's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheck {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            attempts: 15,
        }
    }
}

impl HealthCheck {
    pub fn new(interval: Duration, attempts: u32) -> Self {
        Self { interval, attempts }
    }

    /// Longest time a poll can take.
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts
    }

    /// Returns true as soon as the status reads `Enabled`, false once every
    /// attempt has been used up.
    pub async fn wait_until_enabled(&self, status: &watch::Receiver<OcrAdapterStatus>) -> bool {
        for attempt in 0..self.attempts {
            if *status.borrow() == OcrAdapterStatus::Enabled {
                return true;
            }
            debug!(attempt, status = %*status.borrow(), "Engine not ready, polling");
            tokio::time::sleep(self.interval).await;
        }

        let ready = *status.borrow() == OcrAdapterStatus::Enabled;
        if !ready {
            warn!(
                attempts = self.attempts,
                status = %*status.borrow(),
                "Engine did not become ready in time"
            );
        }
        ready
    }
}

/// An exit of the service process nobody asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: Option<u32>,
    pub code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ReadyMarker {
    event: String,
    address: String,
}

fn parse_ready_marker(line: &str) -> Option<String> {
    let marker: ReadyMarker = serde_json::from_str(line.trim()).ok()?;
    (marker.event == "ready" && !marker.address.is_empty()).then_some(marker.address)
}

struct RunningProcess {
    pid: Option<u32>,
    cancel: CancellationToken,
    watcher: JoinHandle<()>,
}

pub struct ProcessSupervisor {
    spec: ProcessSpec,
    health: HealthCheck,
    status: watch::Receiver<OcrAdapterStatus>,
    exits: mpsc::UnboundedSender<ProcessExit>,
    running: Mutex<Option<RunningProcess>>,
}

impl ProcessSupervisor {
    /// The receiver yields one [`ProcessExit`] per unexpected exit.
    pub fn new(
        spec: ProcessSpec,
        health: HealthCheck,
        status: watch::Receiver<OcrAdapterStatus>,
    ) -> (Self, mpsc::UnboundedReceiver<ProcessExit>) {
        let (exits, exit_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            spec,
            health,
            status,
            exits,
            running: Mutex::new(None),
        };
        (supervisor, exit_rx)
    }

    fn running(&self) -> MutexGuard<'_, Option<RunningProcess>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|process| !process.watcher.is_finished())
    }

    pub fn pid(&self) -> Option<u32> {
        self.running().as_ref().and_then(|process| process.pid)
    }

    /// Spawn the service and wait for its ready marker. Returns the
    /// announced address.
    pub async fn start(&self) -> Result<String> {
        self.stop().await;

        let mut child = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OcrError::Process(format!(
                    "Failed to spawn {}: {e}",
                    self.spec.program.display()
                ))
            })?;

        let pid = child.id();
        info!(program = %self.spec.program.display(), ?pid, "Started OCR service process");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OcrError::Process("service stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let budget = self.health.budget();
        let ready = tokio::time::timeout(budget, read_ready_marker(&mut lines)).await;

        let address = match ready {
            Ok(Ok(address)) => address,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(OcrError::Timeout(budget.as_secs()));
            }
        };

        info!(%address, ?pid, "OCR service ready");

        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "screentext::service", "{}", line);
            }
        });

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_process(
            child,
            pid,
            cancel.clone(),
            self.status.clone(),
            self.exits.clone(),
        ));

        *self.running() = Some(RunningProcess {
            pid,
            cancel,
            watcher,
        });

        Ok(address)
    }

    /// Kill the service process, if any, and wait for it to be reaped.
    pub async fn stop(&self) {
        let process = self.running().take();
        if let Some(process) = process {
            debug!(pid = ?process.pid, "Stopping OCR service process");
            process.cancel.cancel();
            let _ = process.watcher.await;
        }
    }

    pub async fn restart(&self) -> Result<String> {
        info!(program = %self.spec.program.display(), "Restarting OCR service process");
        self.stop().await;
        self.start().await
    }

    /// Poll the owner's status until it reads `Enabled`.
    pub async fn health_check(&self) -> bool {
        self.health.wait_until_enabled(&self.status).await
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(process) = self.running().take() {
            process.cancel.cancel();
        }
    }
}

async fn read_ready_marker(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<String> {
    while let Some(line) = lines.next_line().await? {
        if let Some(address) = parse_ready_marker(&line) {
            return Ok(address);
        }
        debug!(target: "screentext::service", "{}", line);
    }
    Err(OcrError::Process(
        "service exited before announcing an address".to_string(),
    ))
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.to_lowercase().contains("error") {
            warn!(target: "screentext::service", "{}", line);
        } else {
            debug!(target: "screentext::service", "{}", line);
        }
    }
}

async fn watch_process(
    mut child: Child,
    pid: Option<u32>,
    cancel: CancellationToken,
    status: watch::Receiver<OcrAdapterStatus>,
    exits: mpsc::UnboundedSender<ProcessExit>,
) {
    let exited = tokio::select! {
        _ = cancel.cancelled() => None,
        result = child.wait() => Some(result),
    };

    let Some(result) = exited else {
        if let Err(e) = child.kill().await {
            warn!(?pid, error = %e, "Failed to kill OCR service process");
        }
        debug!(?pid, "OCR service process stopped");
        return;
    };

    let code = result.ok().and_then(|s| s.code());
    if *status.borrow() == OcrAdapterStatus::Restarting {
        info!(?pid, ?code, "OCR service process exited during restart");
        return;
    }

    warn!(?pid, ?code, "OCR service process exited unexpectedly");
    let _ = exits.send(ProcessExit { pid, code });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ready_marker() {
        assert_eq!(
            parse_ready_marker(r#"{"event":"ready","address":"127.0.0.1:7001"}"#),
            Some("127.0.0.1:7001".to_string())
        );
        assert_eq!(
            parse_ready_marker(r#"  {"address":"x:1","event":"ready"}  "#),
            Some("x:1".to_string())
        );
        assert_eq!(parse_ready_marker(r#"{"event":"loading","address":"x:1"}"#), None);
        assert_eq!(parse_ready_marker("loading models..."), None);
        assert_eq!(parse_ready_marker(r#"{"event":"ready","address":""}"#), None);
    }

    #[test]
    fn test_health_budget() {
        assert_eq!(HealthCheck::default().budget(), Duration::from_secs(30));
    }

    #[test]
    fn test_service_spec_passes_presets_dir() {
        let spec = ProcessSpec::service("ocr-service", "/opt/presets");
        assert_eq!(spec.program, PathBuf::from("ocr-service"));
        assert_eq!(spec.args, vec![OsString::from("/opt/presets")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_succeeds_once_enabled() {
        let (tx, rx) = watch::channel(OcrAdapterStatus::Restarting);
        let health = HealthCheck::default();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = tx.send(OcrAdapterStatus::Enabled);
            // keep the sender alive past the poll
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let started = tokio::time::Instant::now();
        assert!(health.wait_until_enabled(&rx).await);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_times_out_while_restarting() {
        let (_tx, rx) = watch::channel(OcrAdapterStatus::Restarting);
        let health = HealthCheck::default();

        let started = tokio::time::Instant::now();
        assert!(!health.wait_until_enabled(&rx).await);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_enabled_status_returns_immediately() {
        let (_tx, rx) = watch::channel(OcrAdapterStatus::Enabled);
        assert!(HealthCheck::default().wait_until_enabled(&rx).await);
    }
}
