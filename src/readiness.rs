//! Startup readiness probing
//!
//! Polls the backend's internal port at a fixed interval until it accepts
//! connections (or answers its health endpoint), the startup timeout
//! elapses, or the backend dies. Runs only during startup; continuous
//! health monitoring is not this component's job.

use crate::client::BackendClient;
use crate::config::Config;
use crate::process::{BackendExit, BackendHandle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Timeout for a single probe attempt
const PROBE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of waiting for the backend to become ready
#[derive(Debug, Clone, Copy)]
pub enum ProbeOutcome {
    /// Backend accepted a probe; traffic may flow
    Ready,
    /// Startup timeout elapsed without a successful probe
    TimedOut,
    /// Backend exited while we were still probing
    BackendExited(BackendExit),
}

/// Polls the backend until it is ready to accept traffic
pub struct ReadinessProber {
    backend_port: u16,
    health_path: Option<String>,
    interval: Duration,
    timeout: Duration,
    client: Arc<BackendClient>,
}

impl ReadinessProber {
    pub fn new(config: &Config, client: Arc<BackendClient>) -> Self {
        Self {
            backend_port: config.backend_port,
            health_path: config.health_path.clone(),
            interval: config.probe_interval(),
            timeout: config.startup_timeout(),
            client,
        }
    }

    /// Wait until the backend is ready, the timeout elapses, or the backend
    /// exits. Exceeding the timeout is a fatal startup condition for the
    /// caller, not a transient one; there are no retries past the window.
    pub async fn await_ready(&self, handle: &BackendHandle) -> ProbeOutcome {
        let deadline = Instant::now() + self.timeout;
        let mut exit_rx = handle.exit_watch();

        debug!(
            port = self.backend_port,
            health_path = ?self.health_path,
            timeout_secs = self.timeout.as_secs(),
            "Waiting for backend readiness"
        );

        loop {
            if let Some(exit) = handle.exit() {
                return ProbeOutcome::BackendExited(exit);
            }

            if self.probe_once().await {
                handle.mark_ready();
                info!(port = self.backend_port, "Backend is ready");
                return ProbeOutcome::Ready;
            }

            if Instant::now() >= deadline {
                return ProbeOutcome::TimedOut;
            }

            // Sleep until the next attempt, but wake immediately if the
            // backend dies so a dead process never waits out the timeout.
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = exit_rx.changed() => {
                    if let Some(exit) = handle.exit() {
                        return ProbeOutcome::BackendExited(exit);
                    }
                }
            }
        }
    }

    /// One probe attempt: HTTP GET against the health path when configured,
    /// plain TCP connect otherwise.
    async fn probe_once(&self) -> bool {
        match self.health_path {
            Some(ref path) => self.client.probe(path).await,
            None => {
                let addr = format!("127.0.0.1:{}", self.backend_port);
                match tokio::time::timeout(PROBE_ATTEMPT_TIMEOUT, TcpStream::connect(&addr)).await
                {
                    Ok(Ok(_stream)) => {
                        debug!(port = self.backend_port, "Probe passed (TCP connect)");
                        true
                    }
                    Ok(Err(e)) => {
                        debug!(port = self.backend_port, error = %e, "Probe failed");
                        false
                    }
                    Err(_) => {
                        debug!(port = self.backend_port, "Probe timed out");
                        false
                    }
                }
            }
        }
    }
}
