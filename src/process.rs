//! Backend process supervision
//!
//! Spawns the backend executable as a child process, relays its output into
//! the supervisor's log stream, reports its exit asynchronously, and knows
//! how to take it down (SIGTERM, grace period, SIGKILL).

use crate::config::Config;
use crate::error::SpawnError;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Lifecycle state of the supervised backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Spawned, readiness probe not yet passed
    Starting,
    /// Readiness probe passed
    Ready,
    /// Ready and fronted by the forwarder
    Running,
    /// Process exited on its own; `None` means it died on a signal
    Exited(Option<i32>),
    /// Force-killed by the supervisor after the grace period
    Killed,
}

/// Exit report delivered to the lifecycle controller when the backend dies
#[derive(Debug, Clone, Copy)]
pub struct BackendExit {
    pub pid: u32,
    /// Exit code, `None` when the process died on a signal
    pub code: Option<i32>,
    /// Terminating signal, when there was one
    pub signal: Option<i32>,
}

/// Outcome of a termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Backend exited within the grace period
    Graceful(Option<i32>),
    /// Backend ignored the termination signal and was force-killed
    Forced,
}

/// Handle to the single supervised backend process.
///
/// Exactly one live handle exists at a time; the [`ProcessManager`] creates
/// it on spawn and the lifecycle controller discards it once the exit has
/// been observed and acted on. Other components only read its state.
#[derive(Clone)]
pub struct BackendHandle {
    pid: u32,
    state: Arc<Mutex<BackendState>>,
    exited: watch::Receiver<Option<BackendExit>>,
}

impl BackendHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock()
    }

    pub fn mark_ready(&self) {
        let mut state = self.state.lock();
        if *state == BackendState::Starting {
            *state = BackendState::Ready;
        }
    }

    pub fn mark_running(&self) {
        let mut state = self.state.lock();
        if *state == BackendState::Ready {
            *state = BackendState::Running;
        }
    }

    /// Non-blocking liveness check
    pub fn is_alive(&self) -> bool {
        self.exited.borrow().is_none()
    }

    /// Last observed exit, if the process has died
    pub fn exit(&self) -> Option<BackendExit> {
        *self.exited.borrow()
    }

    /// Receiver that resolves to `Some(exit)` when the process dies.
    /// Used by the readiness prober to cancel probing the instant the
    /// backend is gone.
    pub fn exit_watch(&self) -> watch::Receiver<Option<BackendExit>> {
        self.exited.clone()
    }

    /// Wait until the process has exited, returning the exit report
    pub async fn wait_exited(&self) -> BackendExit {
        let mut rx = self.exited.clone();
        loop {
            if let Some(exit) = *rx.borrow() {
                return exit;
            }
            // Sender lives in the wait task, which always publishes before
            // dropping, so a closed channel still carries the final value.
            if rx.changed().await.is_err() {
                if let Some(exit) = *rx.borrow() {
                    return exit;
                }
                // Unreachable in practice; report a signal-less death.
                return BackendExit {
                    pid: self.pid,
                    code: None,
                    signal: None,
                };
            }
        }
    }
}

/// Spawns and terminates the backend process.
///
/// Exit notifications are delivered asynchronously on the channel handed to
/// [`new`](ProcessManager::new); a dedicated wait task per spawn reaps the
/// child (the supervisor runs as PID 1 of its container, so reaping is its
/// job) and publishes the exit both to that channel and to the handle.
pub struct ProcessManager {
    exit_tx: mpsc::UnboundedSender<BackendExit>,
}

impl ProcessManager {
    pub fn new(exit_tx: mpsc::UnboundedSender<BackendExit>) -> Self {
        Self { exit_tx }
    }

    /// Spawn the backend described by `config`, with stdout/stderr captured
    /// and relayed line-buffered into the supervisor's log stream.
    pub fn spawn(&self, config: &Config) -> Result<BackendHandle, SpawnError> {
        let mut cmd = Command::new(&config.backend_command);
        cmd.args(&config.backend_args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref dir) = config.backend_dir {
            cmd.current_dir(dir);
        }

        // The backend listens on its internal port, not the platform port
        cmd.env("PORT", config.backend_port.to_string());

        if let Some(ref data_dir) = config.data_dir {
            cmd.env("DATA_DIR", data_dir);
        }

        let mut child = cmd.spawn().map_err(|source| SpawnError {
            command: config.backend_command.clone(),
            source,
        })?;

        // A pid of 0 must never reach the signal path: kill(0, sig) would
        // signal the supervisor's entire process group.
        let Some(pid) = child.id() else {
            return Err(SpawnError {
                command: config.backend_command.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "spawned process reaped before its pid was observed",
                ),
            });
        };
        info!(pid, command = ?config.backend_command, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(relay_output(stdout, pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_output(stderr, pid, "stderr"));
        }

        let state = Arc::new(Mutex::new(BackendState::Starting));
        let (exited_tx, exited_rx) = watch::channel(None);

        // Wait task: owns the child, reaps it, publishes the exit report
        let exit_tx = self.exit_tx.clone();
        let wait_state = Arc::clone(&state);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => BackendExit {
                    pid,
                    code: status.code(),
                    signal: exit_signal(&status),
                },
                Err(e) => {
                    warn!(pid, error = %e, "Error waiting for backend process");
                    BackendExit {
                        pid,
                        code: None,
                        signal: None,
                    }
                }
            };

            {
                let mut state = wait_state.lock();
                // terminate() records Killed itself on the forced path
                if *state != BackendState::Killed {
                    *state = BackendState::Exited(exit.code);
                }
            }

            info!(pid, code = ?exit.code, signal = ?exit.signal, "Backend process exited");
            let _ = exited_tx.send(Some(exit));
            let _ = exit_tx.send(exit);
        });

        Ok(BackendHandle {
            pid,
            state,
            exited: exited_rx,
        })
    }

    /// Terminate the backend: SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn terminate(&self, handle: &BackendHandle, grace: Duration) -> Termination {
        if let Some(exit) = handle.exit() {
            return Termination::Graceful(exit.code);
        }

        let pid = handle.pid;
        info!(pid, "Sending SIGTERM to backend");
        send_signal(pid, Signal::Term);

        match tokio::time::timeout(grace, handle.wait_exited()).await {
            Ok(exit) => {
                info!(pid, code = ?exit.code, "Backend exited within grace period");
                Termination::Graceful(exit.code)
            }
            Err(_) => {
                warn!(
                    pid,
                    grace_secs = grace.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                send_signal(pid, Signal::Kill);
                *handle.state.lock() = BackendState::Killed;
                // SIGKILL cannot be ignored; the wait task reaps promptly
                let _ = tokio::time::timeout(Duration::from_secs(5), handle.wait_exited()).await;
                Termination::Forced
            }
        }
    }
}

async fn relay_output<R>(stream: R, pid: u32, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(source = "backend", pid, stream = name, "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(pid, stream = name, error = %e, "Backend output stream closed");
                break;
            }
        }
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    // kill(0, sig) targets the whole process group, never do that
    if pid == 0 {
        warn!("Refusing to signal pid 0");
        return;
    }
    let signum = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(pid as i32, signum);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) {
    // No graceful signal on non-Unix; the forced path uses kill_on_drop
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config(command: &str, args: &[&str]) -> Config {
        Config {
            listen_port: 8080,
            backend_port: 4000,
            backend_command: PathBuf::from(command),
            backend_args: args.iter().map(|s| s.to_string()).collect(),
            backend_dir: None,
            data_dir: None,
            health_path: None,
            startup_timeout_secs: 1,
            probe_interval_ms: 50,
            shutdown_grace_secs: 1,
            request_timeout_secs: 5,
            restart_max: 3,
            restart_window_secs: 60,
        }
    }

    fn manager() -> (ProcessManager, mpsc::UnboundedReceiver<BackendExit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProcessManager::new(tx), rx)
    }

    #[tokio::test]
    async fn test_spawn_and_terminate_gracefully() {
        let (manager, _rx) = manager();
        let handle = manager
            .spawn(&test_config("/bin/sleep", &["60"]))
            .unwrap();

        assert!(handle.is_alive());
        assert_eq!(handle.state(), BackendState::Starting);
        assert!(handle.pid() > 0);

        // sleep dies on SIGTERM well within the grace period
        let outcome = manager.terminate(&handle, Duration::from_secs(5)).await;
        assert!(matches!(outcome, Termination::Graceful(_)));
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_terminate_force_kills_stubborn_backend() {
        let (manager, _rx) = manager();
        let handle = manager
            .spawn(&test_config(
                "/bin/sh",
                &["-c", "trap '' TERM; while true; do sleep 1; done"],
            ))
            .unwrap();

        // Give the shell a moment to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = manager.terminate(&handle, Duration::from_millis(500)).await;
        assert_eq!(outcome, Termination::Forced);
        assert_eq!(handle.state(), BackendState::Killed);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_exit_notification_carries_exit_code() {
        let (manager, mut rx) = manager();
        let handle = manager
            .spawn(&test_config("/bin/sh", &["-c", "exit 7"]))
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("exit notification within timeout")
            .expect("channel open");

        assert_eq!(exit.code, Some(7));
        assert_eq!(exit.pid, handle.pid());
        assert_eq!(handle.state(), BackendState::Exited(Some(7)));
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_terminate_after_exit_reports_observed_code() {
        let (manager, mut rx) = manager();
        let handle = manager
            .spawn(&test_config("/bin/sh", &["-c", "exit 0"]))
            .unwrap();

        let _ = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;

        let outcome = manager.terminate(&handle, Duration::from_secs(1)).await;
        assert_eq!(outcome, Termination::Graceful(Some(0)));
    }

    #[test]
    fn test_signal_to_pid_zero_is_refused() {
        // Were pid 0 passed through, this would SIGTERM/SIGKILL the test
        // runner's own process group.
        send_signal(0, Signal::Term);
        send_signal(0, Signal::Kill);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let (manager, _rx) = manager();
        let result = manager.spawn(&test_config("/no/such/binary", &[]));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (manager, _rx) = manager();
        let handle = manager
            .spawn(&test_config("/bin/sleep", &["60"]))
            .unwrap();

        assert_eq!(handle.state(), BackendState::Starting);
        handle.mark_ready();
        assert_eq!(handle.state(), BackendState::Ready);
        handle.mark_running();
        assert_eq!(handle.state(), BackendState::Running);

        // mark_ready only applies to a Starting backend
        handle.mark_ready();
        assert_eq!(handle.state(), BackendState::Running);

        manager.terminate(&handle, Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_wait_exited_resolves_on_death() {
        let (manager, _rx) = manager();
        let handle = manager
            .spawn(&test_config("/bin/sh", &["-c", "exit 3"]))
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait_exited())
            .await
            .expect("exit within timeout");
        assert_eq!(exit.code, Some(3));
    }
}
