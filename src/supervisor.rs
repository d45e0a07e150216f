//! Process supervision: one worker per live version, respawned on crash.
//!
//! Each spawned child gets a waiter task that forwards its exit over an
//! unbounded channel; a single consumer task ([`Supervisor::run_exit_loop`])
//! applies the respawn policy, so concurrent exits never race on the same
//! record. Termination is fire-and-forget: the signal is sent and the
//! record's cleanup happens later when the exit event arrives.

use crate::config::RespawnConfig;
use crate::error::{Error, Result};
use crate::meta::Instance;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// State of a supervised worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Spawn requested, process not confirmed yet
    Starting,
    /// Process is live
    Running,
    /// Process exited, respawn scheduled
    Backoff,
    /// No process and no respawn pending
    Stopped,
    /// Shut down for good (obsolete teardown or global stop)
    Terminated,
}

/// Exit notification from a waiter task
#[derive(Debug)]
pub struct ExitEvent {
    pub name: String,
    pub code: Option<i32>,
}

/// Published after a successful respawn so the meta file can record the new pid
#[derive(Debug)]
pub struct RespawnEvent {
    pub name: String,
    pub pid: u32,
}

/// Runtime state for one version's worker
struct WorkerRecord {
    state: WorkerState,
    pid: Option<u32>,
    /// In-band command channel to the worker (resize etc.)
    stdin: Option<ChildStdin>,
    /// Tells the waiter task to kill the child
    kill_tx: Option<oneshot::Sender<()>>,
    /// Exits inside the current rolling crash window
    respawn_count: u32,
    last_exit: Option<Instant>,
    /// Set when the version is being retired; suppresses respawn
    obsolete: bool,
    port: u16,
    path: PathBuf,
}

/// Status row returned by the admin `/processes` route
#[derive(Debug, serde::Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub state: WorkerState,
    pub pid: Option<u32>,
}

/// Compute the delay before the next respawn attempt.
///
/// `count` exits inside the rolling window stay on the short interval up to
/// the configured limit; past it the penalty interval applies.
fn backoff_delay(respawn: &RespawnConfig, count: u32) -> Duration {
    if count > respawn.limit {
        respawn.limit_interval()
    } else {
        respawn.interval()
    }
}

/// Exit count to record for an exit observed at `now`.
///
/// A quiet period of at least `reset_after` since the previous exit starts
/// the crash-loop count over, so the short interval applies again.
fn next_respawn_count(
    count: u32,
    last_exit: Option<Instant>,
    now: Instant,
    reset_after: Duration,
) -> u32 {
    match last_exit {
        Some(last) if now.duration_since(last) >= reset_after => 1,
        _ => count + 1,
    }
}

/// Owns the lifecycle of one OS process per live version.
///
/// Designed to be used behind an `Arc`: [`new`](Supervisor::new) returns
/// `Arc<Self>` plus the exit-event receiver the caller must feed into
/// [`run_exit_loop`](Supervisor::run_exit_loop).
pub struct Supervisor {
    workers: DashMap<String, Mutex<WorkerRecord>>,
    /// Parsed worker command line; run with the version dir as cwd
    argv: Vec<String>,
    respawn: RespawnConfig,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    /// Global stop flag; checked before scheduling any respawn
    stopping: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(
        worker_command: &str,
        respawn: RespawnConfig,
        stopping: watch::Receiver<bool>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ExitEvent>)> {
        let argv = shell_words::split(worker_command).map_err(|e| Error::WorkerCommand {
            command: worker_command.to_string(),
            reason: e.to_string(),
        })?;
        if argv.is_empty() {
            return Err(Error::WorkerCommand {
                command: worker_command.to_string(),
                reason: "empty command".to_string(),
            });
        }
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Ok((
            Arc::new(Self {
                workers: DashMap::new(),
                argv,
                respawn,
                exit_tx,
                stopping,
            }),
            exit_rx,
        ))
    }

    /// Launch the worker for an instance and record it as `Running`.
    ///
    /// Idempotent: an instance that already has a live record (running or
    /// waiting in backoff) is left alone. Returns the worker pid.
    pub fn spawn(&self, instance: &Instance) -> Result<Option<u32>> {
        if let Some(record) = self.workers.get(&instance.name) {
            let guard = record.lock();
            match guard.state {
                WorkerState::Running | WorkerState::Starting => {
                    debug!(name = %instance.name, "Worker already running");
                    return Ok(guard.pid);
                }
                WorkerState::Backoff => {
                    debug!(name = %instance.name, "Worker respawn already scheduled");
                    return Ok(None);
                }
                WorkerState::Stopped | WorkerState::Terminated => {}
            }
        }

        self.workers.insert(
            instance.name.clone(),
            Mutex::new(WorkerRecord {
                state: WorkerState::Starting,
                pid: None,
                stdin: None,
                kill_tx: None,
                respawn_count: 0,
                last_exit: None,
                obsolete: false,
                port: instance.port,
                path: instance.path.clone(),
            }),
        );

        match self.launch(&instance.name, &instance.path, instance.port) {
            Ok(pid) => Ok(Some(pid)),
            Err(e) => {
                // Drop the record so the next reconciliation retries
                self.workers.remove(&instance.name);
                Err(e)
            }
        }
    }

    /// Spawn the OS process for an existing record and move it to `Running`
    fn launch(&self, name: &str, path: &std::path::Path, port: u16) -> Result<u32> {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .current_dir(path)
            .env("PORT", port.to_string())
            .env("VERSION_NAME", name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Workers must not outlive the orchestrator if it exits before
            // the waiter task delivers a termination signal
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            name: name.to_string(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take();
        let (kill_tx, mut kill_rx) = oneshot::channel();

        if let Some(stdout) = child.stdout.take() {
            let worker = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(worker = %worker, "{}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let worker = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(worker = %worker, "{}", line);
                }
            });
        }

        // The record must already reflect the live process when the waiter
        // delivers the exit event; an instant crash would otherwise be
        // misfiled against a stale record and never respawned
        if let Some(record) = self.workers.get(name) {
            let mut guard = record.lock();
            guard.state = WorkerState::Running;
            guard.pid = Some(pid);
            guard.stdin = stdin;
            guard.kill_tx = Some(kill_tx);
        }

        // Waiter task: owns the child, reports the exit, honors kill requests
        let exit_tx = self.exit_tx.clone();
        let worker = name.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                request = &mut kill_rx => {
                    if request.is_ok() {
                        #[cfg(unix)]
                        if let Some(pid) = child.id() {
                            unsafe {
                                libc::kill(pid as i32, libc::SIGTERM);
                            }
                        }
                        #[cfg(not(unix))]
                        let _ = child.start_kill();
                    }
                    child.wait().await
                }
            };
            let code = status.as_ref().ok().and_then(|s| s.code());
            let _ = exit_tx.send(ExitEvent { name: worker, code });
        });

        info!(name, pid, port, "Worker spawned");
        Ok(pid)
    }

    /// Send the termination signal to a worker.
    ///
    /// With `mark_obsolete` the record is flagged so the exit handler
    /// discards it instead of respawning; without it the worker comes back
    /// after the normal respawn delay. Does not wait for the exit.
    pub fn terminate(&self, name: &str, mark_obsolete: bool) {
        let kill_tx = {
            let Some(record) = self.workers.get(name) else {
                debug!(name, "Terminate requested for unknown worker");
                return;
            };
            let mut guard = record.lock();
            if mark_obsolete {
                guard.obsolete = true;
            }
            guard.kill_tx.take()
        };

        match kill_tx {
            Some(tx) => {
                info!(name, mark_obsolete, "Terminating worker");
                let _ = tx.send(());
            }
            None => {
                // No live process (backoff or already signalled). An obsolete
                // record with nothing running can be discarded right away.
                if mark_obsolete {
                    let remove = self
                        .workers
                        .get(name)
                        .map(|r| r.lock().pid.is_none())
                        .unwrap_or(false);
                    if remove {
                        self.workers.remove(name);
                        info!(name, "Discarded obsolete worker record with no process");
                    }
                }
            }
        }
    }

    /// Terminate every worker. Respawn suppression comes from the stop flag,
    /// which callers flip before invoking this.
    pub fn terminate_all(&self) {
        let names: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.terminate(&name, false);
        }
    }

    /// Write an in-band resize command to a worker's stdin
    pub async fn resize(&self, name: &str, size: u32) -> Result<()> {
        let mut stdin = {
            let Some(record) = self.workers.get(name) else {
                return Err(Error::NoProcess(name.to_string()));
            };
            let mut guard = record.lock();
            if guard.state != WorkerState::Running {
                return Err(Error::NoProcess(name.to_string()));
            }
            guard
                .stdin
                .take()
                .ok_or_else(|| Error::NoProcess(name.to_string()))?
        };

        let line = format!("resize {}\n", size);
        let result = stdin.write_all(line.as_bytes()).await;

        // Hand the pipe back for the next command
        if let Some(record) = self.workers.get(name) {
            record.lock().stdin = Some(stdin);
        }

        match result {
            Ok(()) => {
                info!(name, size, "Resize command sent");
                Ok(())
            }
            Err(_) => Err(Error::NoProcess(name.to_string())),
        }
    }

    /// True if the version has a record that is not terminally shut down
    pub fn has_live_record(&self, name: &str) -> bool {
        self.workers
            .get(name)
            .map(|r| r.lock().state != WorkerState::Terminated)
            .unwrap_or(false)
    }

    pub fn get_state(&self, name: &str) -> Option<WorkerState> {
        self.workers.get(name).map(|r| r.lock().state)
    }

    pub fn get_pid(&self, name: &str) -> Option<u32> {
        self.workers.get(name).and_then(|r| r.lock().pid)
    }

    /// Snapshot for the admin `/processes` route
    pub fn list(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> = self
            .workers
            .iter()
            .map(|entry| {
                let guard = entry.value().lock();
                WorkerStatus {
                    name: entry.key().clone(),
                    state: guard.state,
                    pid: guard.pid,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Single consumer for all exit events; runs until the orchestrator stops
    pub async fn run_exit_loop(
        self: Arc<Self>,
        mut exits: mpsc::UnboundedReceiver<ExitEvent>,
        respawns: mpsc::UnboundedSender<RespawnEvent>,
    ) {
        while let Some(event) = exits.recv().await {
            self.handle_exit(event, &respawns);
        }
    }

    fn handle_exit(self: &Arc<Self>, event: ExitEvent, respawns: &mpsc::UnboundedSender<RespawnEvent>) {
        let name = event.name;

        if *self.stopping.borrow() {
            if let Some(record) = self.workers.get(&name) {
                let mut guard = record.lock();
                guard.state = WorkerState::Terminated;
                guard.pid = None;
                guard.stdin = None;
            }
            info!(%name, code = ?event.code, "Worker exited during shutdown");
            return;
        }

        let delay = {
            let Some(record) = self.workers.get(&name) else {
                debug!(%name, "Exit event for unknown worker");
                return;
            };
            let mut guard = record.lock();
            guard.pid = None;
            guard.stdin = None;
            guard.kill_tx = None;

            if guard.obsolete {
                drop(guard);
                drop(record);
                self.workers.remove(&name);
                info!(%name, code = ?event.code, "Obsolete worker exited, record discarded");
                return;
            }

            let now = Instant::now();
            guard.respawn_count = next_respawn_count(
                guard.respawn_count,
                guard.last_exit,
                now,
                self.respawn.reset_after(),
            );
            guard.last_exit = Some(now);
            guard.state = WorkerState::Backoff;

            let delay = backoff_delay(&self.respawn, guard.respawn_count);
            warn!(
                %name,
                code = ?event.code,
                respawn_count = guard.respawn_count,
                delay_secs = delay.as_secs(),
                "Worker exited, respawn scheduled"
            );
            delay
        };

        let supervisor = Arc::clone(self);
        let respawns = respawns.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if *supervisor.stopping.borrow() {
                return;
            }
            match supervisor.respawn(&name) {
                Ok(Some(pid)) => {
                    let _ = respawns.send(RespawnEvent { name, pid });
                }
                Ok(None) => {}
                Err(e) => {
                    error!(%name, error = %e, "Respawn failed, will retry on next reconciliation");
                    supervisor.workers.remove(&name);
                }
            }
        });
    }

    /// Relaunch a worker after its backoff delay
    fn respawn(&self, name: &str) -> Result<Option<u32>> {
        let (path, port) = {
            let Some(record) = self.workers.get(name) else {
                return Ok(None);
            };
            let guard = record.lock();
            if guard.obsolete || guard.state != WorkerState::Backoff {
                return Ok(None);
            }
            (guard.path.clone(), guard.port)
        };

        let pid = self.launch(name, &path, port)?;
        Ok(Some(pid))
    }
}
