//! Gateward - a supervisory reverse proxy for a single managed backend
//!
//! This library provides a container-entrypoint supervisor that:
//! - Binds a platform-injected external port and answers from the moment it starts
//! - Spawns a single backend executable as a supervised child process
//! - Relays the backend's stdout/stderr into its own structured log stream
//! - Gates traffic on a readiness probe against the backend's internal port
//! - Proxies HTTP (and WebSocket upgrades) to the backend once it is ready
//! - Restarts a crashed backend within a bounded sliding-window budget
//! - Drains in-flight sessions and terminates the backend cleanly on signal

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod process;
pub mod proxy;
pub mod readiness;
