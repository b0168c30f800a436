//! Top-level lifecycle orchestration
//!
//! Owns the supervisor state machine: startup sequencing (spawn backend,
//! gate on readiness, begin forwarding), crash handling (bounded automatic
//! restarts within a sliding window), and shutdown sequencing (stop
//! accepting, drain in-flight sessions, terminate the backend).
//!
//! State transitions happen only here, serialized in the single lifecycle
//! task; every other component just reads the published state.

use crate::client::BackendClient;
use crate::config::Config;
use crate::error::SupervisorError;
use crate::process::{BackendExit, BackendHandle, ProcessManager};
use crate::proxy::ProxyServer;
use crate::readiness::{ProbeOutcome, ReadinessProber};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Interval for polling the in-flight count while draining
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pause before respawning a crashed backend
const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Process-wide supervisor state, published over a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Configuration loaded, nothing spawned yet
    Initializing,
    /// Backend spawned, readiness probe in progress
    AwaitingBackendReady,
    /// Backend ready, traffic flowing
    Serving,
    /// Termination signal received, refusing new work
    Draining,
    /// Final state; the process is about to exit
    Terminated,
}

/// Sliding-window restart budget.
///
/// Each consumed restart is remembered for the window's duration; once
/// `max` restarts sit inside the window, further attempts are refused and
/// the supervisor exits fatally so the platform can restart the whole unit.
#[derive(Debug)]
pub struct RestartBudget {
    max: u32,
    window: Duration,
    attempts: Vec<Instant>,
}

impl RestartBudget {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            attempts: Vec::new(),
        }
    }

    /// Try to consume one restart. Returns false when the budget is spent.
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    fn try_consume_at(&mut self, now: Instant) -> bool {
        self.attempts
            .retain(|t| now.duration_since(*t) < self.window);
        if self.attempts.len() >= self.max as usize {
            return false;
        }
        self.attempts.push(now);
        true
    }

    /// Restarts currently counted inside the window
    pub fn used(&self) -> usize {
        self.attempts.len()
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// The top-level orchestrator. One instance per supervisor process; fields
/// rather than globals so tests can run several in one process.
pub struct LifecycleController {
    config: Config,
    manager: ProcessManager,
    exit_rx: mpsc::UnboundedReceiver<BackendExit>,
    prober: ReadinessProber,
    state_tx: watch::Sender<SupervisorState>,
    proxy_shutdown_tx: watch::Sender<bool>,
    in_flight: Arc<AtomicUsize>,
    proxy_handle: JoinHandle<()>,
}

impl LifecycleController {
    /// Build the controller: bind the external port and start the accept
    /// loop immediately, so inbound connections get an explicit "not ready"
    /// answer instead of a refused connection while the backend is still
    /// starting. A port that cannot be bound is fatal before anything is
    /// spawned.
    pub async fn new(config: Config) -> Result<Self, SupervisorError> {
        let (state_tx, state_rx) = watch::channel(SupervisorState::Initializing);
        let (proxy_shutdown_tx, proxy_shutdown_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let client = Arc::new(BackendClient::new(config.backend_port));
        let prober = ReadinessProber::new(&config, Arc::clone(&client));
        let manager = ProcessManager::new(exit_tx);

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
        let proxy = ProxyServer::bind(
            bind_addr,
            config.request_timeout(),
            state_rx,
            proxy_shutdown_rx,
            client,
        )
        .await
        .map_err(|source| SupervisorError::Bind {
            port: config.listen_port,
            source,
        })?;
        let in_flight = proxy.in_flight();

        let proxy_handle = tokio::spawn(proxy.run());

        Ok(Self {
            config,
            manager,
            exit_rx,
            prober,
            state_tx,
            proxy_shutdown_tx,
            in_flight,
            proxy_handle,
        })
    }

    /// Observe state transitions (used by tests and diagnostics)
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// Supervise until a fatal failure or a termination signal on `term_rx`.
    ///
    /// Returns `Ok(())` for a clean, signal-initiated shutdown; the error
    /// carries the exit code otherwise.
    pub async fn run(
        mut self,
        mut term_rx: watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        let mut budget = RestartBudget::new(self.config.restart_max, self.config.restart_window());
        let mut first_start = true;

        loop {
            self.set_state(SupervisorState::AwaitingBackendReady);

            let handle = match self.manager.spawn(&self.config) {
                Ok(handle) => handle,
                Err(e) => {
                    // Fatal at startup, retryable within the budget later
                    if first_start {
                        return Err(e.into());
                    }
                    error!(error = %e, "Backend respawn failed");
                    if !budget.try_consume() {
                        return self.budget_exhausted(&budget);
                    }
                    tokio::time::sleep(RESTART_DELAY).await;
                    continue;
                }
            };

            let outcome = tokio::select! {
                outcome = self.prober.await_ready(&handle) => Some(outcome),
                _ = signalled(&mut term_rx) => None,
            };
            let outcome = match outcome {
                Some(outcome) => outcome,
                // Termination signal while still starting up
                None => return self.shutdown(handle).await,
            };

            match outcome {
                ProbeOutcome::Ready => {}
                ProbeOutcome::TimedOut => {
                    warn!(
                        timeout_secs = self.config.startup_timeout_secs,
                        "Backend readiness timeout"
                    );
                    self.manager
                        .terminate(&handle, self.config.shutdown_grace())
                        .await;
                    if first_start {
                        self.set_state(SupervisorState::Terminated);
                        return Err(SupervisorError::ReadinessTimeout {
                            timeout: self.config.startup_timeout(),
                        });
                    }
                    if !budget.try_consume() {
                        return self.budget_exhausted(&budget);
                    }
                    tokio::time::sleep(RESTART_DELAY).await;
                    continue;
                }
                ProbeOutcome::BackendExited(exit) => {
                    warn!(code = ?exit.code, "Backend exited before becoming ready");
                    if first_start {
                        self.set_state(SupervisorState::Terminated);
                        return Err(SupervisorError::StartupExit { code: exit.code });
                    }
                    if !budget.try_consume() {
                        return self.budget_exhausted(&budget);
                    }
                    tokio::time::sleep(RESTART_DELAY).await;
                    continue;
                }
            }

            first_start = false;
            handle.mark_running();
            self.set_state(SupervisorState::Serving);
            info!(pid = handle.pid(), "Serving traffic");

            let crash = tokio::select! {
                exit = next_exit_for(&mut self.exit_rx, handle.pid()) => Some(exit),
                _ = signalled(&mut term_rx) => None,
            };
            match crash {
                Some(exit) => {
                    warn!(
                        pid = exit.pid,
                        code = ?exit.code,
                        signal = ?exit.signal,
                        "Backend exited unexpectedly while serving"
                    );
                    // Stop forwarding at once: until the respawn is ready,
                    // clients must see "not ready", not connection failures
                    // against the dead port.
                    self.set_state(SupervisorState::AwaitingBackendReady);
                    if !budget.try_consume() {
                        return self.budget_exhausted(&budget);
                    }
                    info!(
                        used = budget.used(),
                        max = budget.max(),
                        "Restarting backend"
                    );
                    tokio::time::sleep(RESTART_DELAY).await;
                    // Respawn at the top of the loop
                }
                None => return self.shutdown(handle).await,
            }
        }
    }

    fn set_state(&self, state: SupervisorState) {
        debug!(?state, "Supervisor state transition");
        let _ = self.state_tx.send(state);
    }

    fn budget_exhausted(&self, budget: &RestartBudget) -> Result<(), SupervisorError> {
        error!(
            restarts = budget.max(),
            window_secs = budget.window().as_secs(),
            "Restart budget exhausted, giving up"
        );
        self.set_state(SupervisorState::Terminated);
        Err(SupervisorError::RestartBudgetExhausted {
            restarts: budget.max(),
            window: budget.window(),
        })
    }

    /// Drain and terminate: stop accepting, let in-flight sessions finish
    /// up to the grace deadline, then take the backend down.
    async fn shutdown(self, handle: BackendHandle) -> Result<(), SupervisorError> {
        info!("Termination signal received, draining");
        self.set_state(SupervisorState::Draining);
        let _ = self.proxy_shutdown_tx.send(true);

        let grace = self.config.shutdown_grace();
        let drain_start = Instant::now();
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if drain_start.elapsed() > grace {
                let remaining = self.in_flight.load(Ordering::SeqCst);
                warn!(remaining, "Drain deadline exceeded, closing remaining sessions");
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        let drained_in = drain_start.elapsed();
        if drained_in > Duration::from_millis(100) {
            info!(drained_in_ms = drained_in.as_millis(), "Drained in-flight sessions");
        }

        let termination = self.manager.terminate(&handle, grace).await;
        info!(?termination, "Backend terminated");

        self.set_state(SupervisorState::Terminated);

        // Give the accept loop a moment to wind down
        let _ = tokio::time::timeout(Duration::from_secs(5), self.proxy_handle).await;

        info!("Shutdown complete");
        Ok(())
    }
}

/// Resolve once the watch value becomes true. Pends forever if the sender
/// goes away without signalling.
async fn signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Receive the next exit notification for the given pid, discarding stale
/// reports from children the controller already terminated itself.
async fn next_exit_for(
    exit_rx: &mut mpsc::UnboundedReceiver<BackendExit>,
    pid: u32,
) -> BackendExit {
    loop {
        match exit_rx.recv().await {
            Some(exit) if exit.pid == pid => return exit,
            Some(exit) => {
                debug!(pid = exit.pid, "Discarding stale exit notification");
            }
            // The manager owns a sender for the process lifetime
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_allows_up_to_max() {
        let mut budget = RestartBudget::new(3, Duration::from_secs(60));
        let now = Instant::now();

        assert!(budget.try_consume_at(now));
        assert!(budget.try_consume_at(now + Duration::from_secs(1)));
        assert!(budget.try_consume_at(now + Duration::from_secs(2)));
        assert_eq!(budget.used(), 3);

        // Fourth restart inside the window is refused
        assert!(!budget.try_consume_at(now + Duration::from_secs(3)));
    }

    #[test]
    fn test_budget_window_slides() {
        let mut budget = RestartBudget::new(2, Duration::from_secs(60));
        let now = Instant::now();

        assert!(budget.try_consume_at(now));
        assert!(budget.try_consume_at(now + Duration::from_secs(1)));
        assert!(!budget.try_consume_at(now + Duration::from_secs(2)));

        // Once the first attempt ages out, capacity frees up again
        assert!(budget.try_consume_at(now + Duration::from_secs(61)));
        assert_eq!(budget.used(), 2);
    }

    #[test]
    fn test_budget_zero_max_always_refuses() {
        let mut budget = RestartBudget::new(0, Duration::from_secs(60));
        assert!(!budget.try_consume_at(Instant::now()));
    }

    #[test]
    fn test_supervisor_state_is_distinct() {
        assert_ne!(SupervisorState::Initializing, SupervisorState::AwaitingBackendReady);
        assert_ne!(SupervisorState::AwaitingBackendReady, SupervisorState::Serving);
        assert_ne!(SupervisorState::Serving, SupervisorState::Draining);
        assert_ne!(SupervisorState::Draining, SupervisorState::Terminated);
    }
}
