//! Supervised workload lifecycle.
//!
//! The agent optionally runs one child process and keeps it alive: it
//! resolves the child's secrets at every start, restarts it when the managed
//! key rotates, and applies a crash budget so a broken workload cannot
//! restart-loop forever. The child is always started through here so stale
//! orphans from a previous agent run are reaped first.

pub mod budget;

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::humantime_serde;
use crate::events::{AgentEvent, EventBus};
use crate::secrets::{ExecSecret, ResolvedSecrets, SecretError, SecretResolver};

use budget::{BudgetDecision, RestartBudget};

/// Lifecycle state of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    /// Not running and not expected to be.
    Stopped,
    /// Secrets are being resolved and the process is being spawned.
    Starting,
    /// Running.
    Running,
    /// Exited unexpectedly; a restart is pending.
    Restarting,
    /// Exited unexpectedly; the crash has just been recorded.
    Crashed,
    /// The crash budget is exhausted; no restarts until reset.
    MaxRestartsExceeded,
}

impl std::fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Crashed => "crashed",
            Self::MaxRestartsExceeded => "max_restarts_exceeded",
        };
        f.write_str(s)
    }
}

/// Observable child process state.
#[derive(Debug, Clone)]
pub struct ChildProcessState {
    /// Current lifecycle status.
    pub status: ChildStatus,
    /// Pid while running.
    pub pid: Option<u32>,
    /// Restarts performed since the last reset.
    pub restart_count: u32,
    /// Exit code of the last exit, when it exited normally.
    pub last_exit_code: Option<i32>,
    /// Signal that terminated the last run, when killed by a signal.
    pub last_exit_signal: Option<i32>,
    /// When the child last started.
    pub last_started_at: Option<DateTime<Utc>>,
    /// When the child last exited.
    pub last_exited_at: Option<DateTime<Utc>>,
}

impl Default for ChildProcessState {
    fn default() -> Self {
        Self {
            status: ChildStatus::Stopped,
            pid: None,
            restart_count: 0,
            last_exit_code: None,
            last_exit_signal: None,
            last_started_at: None,
            last_exited_at: None,
        }
    }
}

/// Supervised workload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Program to run.
    pub command: String,

    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the child.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Whether the child inherits the agent's environment in addition to
    /// the resolved secrets.
    #[serde(default = "default_true")]
    pub inherit_env: bool,

    /// Whether key rotations and credential updates restart the child.
    #[serde(default = "default_true")]
    pub restart_on_change: bool,

    /// Pid file written on start and used to reap orphans from a previous
    /// agent run.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    /// Secrets exported to the child.
    #[serde(default)]
    pub secrets: Vec<ExecSecret>,

    /// Crashes tolerated per window before restarts stop.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Crash budget window.
    #[serde(default = "default_restart_window", with = "humantime_serde")]
    pub restart_window: Duration,

    /// Delay before restarting a crashed child.
    #[serde(default = "default_restart_delay", with = "humantime_serde")]
    pub restart_delay: Duration,

    /// How long to wait after SIGTERM before escalating to SIGKILL.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// How long to wait for an orphan to exit after SIGTERM.
    #[serde(default = "default_orphan_wait", with = "humantime_serde")]
    pub orphan_wait: Duration,
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    10
}

fn default_restart_window() -> Duration {
    Duration::from_secs(300)
}

fn default_restart_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_orphan_wait() -> Duration {
    Duration::from_secs(5)
}

/// Supervisor failures.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `start` was called while the child is already running.
    #[error("child is already running")]
    AlreadyRunning,

    /// `start` was called during shutdown.
    #[error("supervisor is shutting down")]
    ShuttingDown,

    /// Secret resolution failed.
    #[error(transparent)]
    Secrets(#[from] SecretError),

    /// Spawning the child failed.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        /// The command that failed to spawn.
        command: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Supervises one child process.
///
/// Cheap to clone; clones share the child.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: WorkloadConfig,
    resolver: SecretResolver,
    events: EventBus,
    state: Mutex<ChildProcessState>,
    budget: Mutex<RestartBudget>,
    status_tx: watch::Sender<ChildStatus>,
    // Cancelled to mark the current child's exit (or pending restart) as
    // deliberate rather than a crash.
    stop_token: Mutex<Option<CancellationToken>>,
    // Serializes spawn/stop/restart so secret resolution in one start cannot
    // overlap another spawn of the same workload.
    lifecycle: tokio::sync::Mutex<()>,
    // Bumped by every spawn; a monitor whose epoch is stale no longer owns
    // the status.
    epoch: AtomicU64,
    shutdown: CancellationToken,
}

impl ProcessSupervisor {
    /// Creates a supervisor for `config`. Nothing runs until
    /// [`ProcessSupervisor::start`].
    #[must_use]
    pub fn new(config: WorkloadConfig, resolver: SecretResolver, events: EventBus) -> Self {
        let budget = RestartBudget::new(config.max_restarts, config.restart_window);
        let (status_tx, _) = watch::channel(ChildStatus::Stopped);
        Self {
            inner: Arc::new(Inner {
                config,
                resolver,
                events,
                state: Mutex::new(ChildProcessState::default()),
                budget: Mutex::new(budget),
                status_tx,
                stop_token: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Starts the child.
    ///
    /// Reaps any orphan recorded in the pid file first, then resolves
    /// secrets and spawns.
    ///
    /// # Errors
    ///
    /// Fails when the child is already running, the supervisor is shutting
    /// down, secret resolution fails, or the spawn fails.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let state = self.inner.state.lock().expect("state lock poisoned");
            if matches!(
                state.status,
                ChildStatus::Starting | ChildStatus::Running | ChildStatus::Restarting
            ) {
                return Err(SupervisorError::AlreadyRunning);
            }
        }
        Inner::reap_orphan(&self.inner).await;
        Inner::spawn_now(&self.inner).await
    }

    /// Stops the child: SIGTERM, then SIGKILL after the stop timeout.
    /// Cancels a pending crash restart. No-op when nothing is running.
    /// Waits for an in-flight start to finish first.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.stop_locked().await;
    }

    async fn stop_locked(&self) {
        let token = self
            .inner
            .stop_token
            .lock()
            .expect("stop token lock poisoned")
            .take();
        let Some(token) = token else { return };
        token.cancel();

        let pid = self
            .inner
            .state
            .lock()
            .expect("state lock poisoned")
            .pid;
        let Some(pid) = pid else {
            // Pending restart cancelled; the monitor settles the status.
            return;
        };

        info!(pid, "stopping child");
        signal_pid(pid, Signal::SIGTERM);
        if !self.wait_until_stopped(self.inner.config.stop_timeout).await {
            warn!(pid, "child did not exit after SIGTERM; sending SIGKILL");
            signal_pid(pid, Signal::SIGKILL);
            self.wait_until_stopped(self.inner.config.stop_timeout).await;
        }
    }

    /// Restarts the child so it picks up freshly resolved secrets.
    ///
    /// No-op when restart-on-change is disabled, when the crash budget is
    /// exhausted, or when nothing is running.
    ///
    /// # Errors
    ///
    /// Fails when the respawn fails.
    pub async fn restart(&self, reason: &str) -> Result<(), SupervisorError> {
        if !self.inner.config.restart_on_change {
            debug!(reason, "restart requested but restart_on_change is disabled");
            return Ok(());
        }
        // The status check happens under the lifecycle lock so an in-flight
        // start is observed as Running, not raced.
        let _lifecycle = self.inner.lifecycle.lock().await;
        let status = self.status();
        match status {
            ChildStatus::Running | ChildStatus::Restarting => {}
            ChildStatus::Stopped
            | ChildStatus::Starting
            | ChildStatus::Crashed
            | ChildStatus::MaxRestartsExceeded => {
                debug!(reason, %status, "restart requested but child is not running");
                return Ok(());
            }
        }
        info!(reason, "restarting child");
        self.stop_locked().await;
        Inner::spawn_now(&self.inner).await
    }

    /// Clears the crash budget. A child parked in `max_restarts_exceeded`
    /// becomes startable again.
    pub fn reset_restart_count(&self) {
        self.inner
            .budget
            .lock()
            .expect("budget lock poisoned")
            .reset();
        let mut state = self.inner.state.lock().expect("state lock poisoned");
        state.restart_count = 0;
        if state.status == ChildStatus::MaxRestartsExceeded {
            drop(state);
            Inner::set_status(&self.inner, ChildStatus::Stopped);
        }
    }

    /// Forwards `signal` to a running child.
    pub fn forward_signal(&self, signal: Signal) {
        let pid = self
            .inner
            .state
            .lock()
            .expect("state lock poisoned")
            .pid;
        if let Some(pid) = pid {
            debug!(pid, %signal, "forwarding signal to child");
            signal_pid(pid, signal);
        }
    }

    /// Stops the child and refuses further starts.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.stop().await;
    }

    /// Snapshot of the child state.
    #[must_use]
    pub fn state(&self) -> ChildProcessState {
        self.inner
            .state
            .lock()
            .expect("state lock poisoned")
            .clone()
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ChildStatus {
        *self.inner.status_tx.borrow()
    }

    /// Watch handle for status transitions.
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<ChildStatus> {
        self.inner.status_tx.subscribe()
    }

    async fn wait_until_stopped(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.status_tx.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                if matches!(
                    *rx.borrow_and_update(),
                    ChildStatus::Stopped | ChildStatus::Crashed | ChildStatus::MaxRestartsExceeded
                ) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }
}

impl Inner {
    fn set_status(inner: &Arc<Self>, status: ChildStatus) {
        inner.state.lock().expect("state lock poisoned").status = status;
        inner.status_tx.send_replace(status);
        inner
            .events
            .publish(AgentEvent::ChildStateChanged { status });
    }

    /// Boxed respawn entry for the monitor; the `dyn Future` indirection
    /// keeps the monitor/spawn recursion out of the future's type.
    fn spawn_child(inner: &Arc<Self>) -> BoxFuture<'static, Result<(), SupervisorError>> {
        let inner = Arc::clone(inner);
        async move { Self::spawn_now(&inner).await }.boxed()
    }

    /// Spawns the child. Callers must hold the lifecycle lock.
    async fn spawn_now(inner: &Arc<Self>) -> Result<(), SupervisorError> {
        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        Self::set_status(inner, ChildStatus::Starting);

        let secrets = match inner.resolver.resolve(&inner.config.secrets).await {
            Ok(secrets) => secrets,
            Err(err) => {
                Self::set_status(inner, ChildStatus::Stopped);
                return Err(err.into());
            }
        };

        let mut cmd = Command::new(&inner.config.command);
        cmd.args(&inner.config.args);
        if let Some(cwd) = &inner.config.cwd {
            cmd.current_dir(cwd);
        }
        if !inner.config.inherit_env {
            cmd.env_clear();
        }
        for (name, value) in secrets.env_vars() {
            cmd.env(name, value);
        }
        cmd.kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                Self::set_status(inner, ChildStatus::Stopped);
                return Err(SupervisorError::Spawn {
                    command: inner.config.command.clone(),
                    source,
                });
            }
        };
        let pid = child.id();

        if let (Some(path), Some(pid)) = (&inner.config.pid_file, pid) {
            if let Err(err) = std::fs::write(path, format!("{pid}\n")) {
                warn!(%err, path = %path.display(), "failed to write pid file");
            }
        }
        {
            let mut state = inner.state.lock().expect("state lock poisoned");
            state.pid = pid;
            state.last_started_at = Some(Utc::now());
        }
        info!(command = %inner.config.command, pid, "child started");
        Self::set_status(inner, ChildStatus::Running);

        let token = inner.shutdown.child_token();
        inner
            .stop_token
            .lock()
            .expect("stop token lock poisoned")
            .replace(token.clone());

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            Self::monitor(&inner, child, secrets, token, epoch).await;
        });
        Ok(())
    }

    /// Only the monitor whose spawn is still the latest may write status.
    fn set_status_if_current(inner: &Arc<Self>, epoch: u64, status: ChildStatus) {
        if inner.epoch.load(Ordering::SeqCst) == epoch {
            Self::set_status(inner, status);
        }
    }

    /// Waits for the child to exit and decides what happens next. Owns the
    /// resolved secrets so file-mode secrets outlive the child.
    async fn monitor(
        inner: &Arc<Self>,
        mut child: tokio::process::Child,
        secrets: ResolvedSecrets,
        token: CancellationToken,
        epoch: u64,
    ) {
        let exit = child.wait().await;
        drop(secrets);

        let exit_status = match exit {
            Ok(status) => Some(status),
            Err(err) => {
                warn!(%err, "waiting on child failed");
                None
            }
        };
        {
            let mut state = inner.state.lock().expect("state lock poisoned");
            state.pid = None;
            state.last_exited_at = Some(Utc::now());
            state.last_exit_code = exit_status.and_then(|s| s.code());
            state.last_exit_signal = exit_status.and_then(exit_signal);
        }
        if let Some(path) = &inner.config.pid_file {
            let _ = std::fs::remove_file(path);
        }

        if token.is_cancelled() {
            info!("child stopped");
            Self::set_status_if_current(inner, epoch, ChildStatus::Stopped);
            return;
        }

        warn!(
            code = exit_status.and_then(|s| s.code()),
            signal = exit_status.and_then(exit_signal),
            "child exited unexpectedly"
        );
        Self::set_status_if_current(inner, epoch, ChildStatus::Crashed);

        let decision = inner
            .budget
            .lock()
            .expect("budget lock poisoned")
            .record_crash(tokio::time::Instant::now());
        match decision {
            BudgetDecision::Exceeded => {
                error!(
                    max = inner.config.max_restarts,
                    window_secs = inner.config.restart_window.as_secs(),
                    "crash budget exhausted; not restarting"
                );
                Self::set_status_if_current(inner, epoch, ChildStatus::MaxRestartsExceeded);
            }
            BudgetDecision::Restart => {
                {
                    let mut state = inner.state.lock().expect("state lock poisoned");
                    state.restart_count += 1;
                }
                Self::set_status_if_current(inner, epoch, ChildStatus::Restarting);
                tokio::select! {
                    () = token.cancelled() => {
                        Self::set_status_if_current(inner, epoch, ChildStatus::Stopped);
                        return;
                    }
                    () = tokio::time::sleep(inner.config.restart_delay) => {}
                }
                let _lifecycle = inner.lifecycle.lock().await;
                if token.is_cancelled() {
                    // A stop or restart overtook the pending respawn while it
                    // waited for the lock.
                    Self::set_status_if_current(inner, epoch, ChildStatus::Stopped);
                    return;
                }
                if let Err(err) = Self::spawn_child(inner).await {
                    error!(%err, "restart after crash failed");
                }
            }
        }
    }

    /// Kills a child left over from a previous agent run, per the pid file.
    async fn reap_orphan(inner: &Arc<Self>) {
        let Some(path) = &inner.config.pid_file else {
            return;
        };
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(%err, path = %path.display(), "failed to read pid file");
                return;
            }
        };
        let Ok(pid) = content.trim().parse::<i32>() else {
            warn!(path = %path.display(), "pid file is malformed; removing");
            let _ = std::fs::remove_file(path);
            return;
        };

        if kill(Pid::from_raw(pid), None).is_err() {
            // Stale file, process already gone.
            let _ = std::fs::remove_file(path);
            return;
        }

        warn!(pid, "reaping orphaned child from a previous run");
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        let deadline = tokio::time::Instant::now() + inner.config.orphan_wait;
        while tokio::time::Instant::now() < deadline {
            if kill(Pid::from_raw(pid), None).is_err() {
                let _ = std::fs::remove_file(path);
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!(pid, "orphan did not exit after SIGTERM; sending SIGKILL");
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = std::fs::remove_file(path);
    }
}

fn signal_pid(pid: u32, signal: Signal) {
    #[allow(clippy::cast_possible_wrap)]
    if let Err(err) = kill(Pid::from_raw(pid as i32), signal) {
        warn!(pid, %signal, %err, "failed to signal child");
    }
}

fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}
