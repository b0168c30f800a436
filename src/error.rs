//! Error taxonomy, process exit codes, and JSON error responses
//!
//! Backend-lifecycle failures escalate to a process-level fatal exit with a
//! distinct code so the surrounding platform can apply its restart policy.
//! Per-connection failures never escalate; they are answered with a JSON
//! error response and contained in the session that hit them.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Clean, signal-initiated shutdown
pub const EXIT_OK: i32 = 0;
/// Configuration could not be loaded; nothing was spawned
pub const EXIT_CONFIG: i32 = 2;
/// Backend never became ready during initial startup
pub const EXIT_STARTUP: i32 = 3;
/// Backend kept crashing and the restart budget ran out
pub const EXIT_RESTART_BUDGET: i32 = 4;
/// The platform-injected listen port could not be bound
pub const EXIT_BIND: i32 = 5;

/// Configuration loading failures (fatal, immediate exit)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("PORT is not set; the platform-injected listen port is required")]
    MissingPort,

    #[error("PORT is not a valid port number: {0:?}")]
    InvalidPort(String),

    #[error("BACKEND_COMMAND is not set or empty")]
    MissingCommand,

    #[error("BACKEND_COMMAND could not be parsed: {0}")]
    UnparsableCommand(String),

    #[error("backend executable not found: {0:?}")]
    ExecutableNotFound(String),

    #[error("{key} has an invalid value: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Backend spawn failures (missing binary, permission denied, fork failure)
#[derive(Debug, thiserror::Error)]
#[error("failed to spawn backend {command:?}: {source}")]
pub struct SpawnError {
    pub command: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Fatal supervisor-level failures. Everything that reaches `main` through
/// this type terminates the whole process with the matching exit code.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("failed to bind listen port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("backend did not become ready within {timeout:?}")]
    ReadinessTimeout { timeout: Duration },

    #[error("backend exited during startup (code {code:?})")]
    StartupExit { code: Option<i32> },

    #[error("restart budget exhausted: {restarts} restarts within {window:?}")]
    RestartBudgetExhausted { restarts: u32, window: Duration },
}

impl SupervisorError {
    /// Process exit code for this failure, per the platform restart contract
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::Config(_) => EXIT_CONFIG,
            SupervisorError::Spawn(_) => EXIT_STARTUP,
            SupervisorError::Bind { .. } => EXIT_BIND,
            SupervisorError::ReadinessTimeout { .. } => EXIT_STARTUP,
            SupervisorError::StartupExit { .. } => EXIT_STARTUP,
            SupervisorError::RestartBudgetExhausted { .. } => EXIT_RESTART_BUDGET,
        }
    }
}

/// Error codes for proxy-level error responses
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Backend has not passed its readiness probe yet
    BackendStarting,
    /// Supervisor is draining; no new work is accepted
    Draining,
    /// Backend connection failed mid-flight
    ConnectionFailed,
    /// Backend did not answer within the request timeout
    RequestTimeout,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BackendStarting => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::Draining => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BackendStarting => "BACKEND_STARTING",
            ProxyErrorCode::Draining => "DRAINING",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::BackendStarting.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::Draining.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::BackendStarting, "Backend is starting");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"BACKEND_STARTING\""));
        assert!(json.contains("\"message\":\"Backend is starting\""));
        assert!(json.contains("\"status\":503"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_supervisor_error_exit_codes() {
        assert_eq!(
            SupervisorError::Config(ConfigError::MissingPort).exit_code(),
            EXIT_CONFIG
        );
        assert_eq!(
            SupervisorError::Bind {
                port: 8080,
                source: std::io::Error::from(std::io::ErrorKind::AddrInUse)
            }
            .exit_code(),
            EXIT_BIND
        );
        assert_eq!(
            SupervisorError::ReadinessTimeout {
                timeout: Duration::from_secs(60)
            }
            .exit_code(),
            EXIT_STARTUP
        );
        assert_eq!(
            SupervisorError::StartupExit { code: Some(1) }.exit_code(),
            EXIT_STARTUP
        );
        assert_eq!(
            SupervisorError::RestartBudgetExhausted {
                restarts: 3,
                window: Duration::from_secs(60)
            }
            .exit_code(),
            EXIT_RESTART_BUDGET
        );
    }
}
