use crate::error::ConfigError;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Immutable supervisor configuration, built once at startup from the
/// environment. Any change requires a process restart.
#[derive(Debug, Clone)]
pub struct Config {
    /// External listen port, injected by the container platform. Never
    /// defaulted: the platform routes traffic to whatever port it handed us.
    pub listen_port: u16,

    /// Port the backend listens on internally
    pub backend_port: u16,

    /// Resolved path to the backend executable
    pub backend_command: PathBuf,

    /// Arguments passed to the backend executable
    pub backend_args: Vec<String>,

    /// Working directory for the backend (inherited when unset)
    pub backend_dir: Option<PathBuf>,

    /// Persistent storage root, re-exported to the backend as DATA_DIR
    pub data_dir: Option<PathBuf>,

    /// HTTP health path on the backend; plain TCP connect probe when unset
    pub health_path: Option<String>,

    /// Maximum time to wait for the backend to become ready
    pub startup_timeout_secs: u64,

    /// Interval between readiness probe attempts
    pub probe_interval_ms: u64,

    /// Drain deadline and SIGTERM-to-SIGKILL grace period
    pub shutdown_grace_secs: u64,

    /// Maximum time to wait for a single proxied request
    pub request_timeout_secs: u64,

    /// Restarts allowed within the sliding window before giving up
    pub restart_max: u32,

    /// Sliding window for the restart budget
    pub restart_window_secs: u64,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Deterministic for a given environment snapshot; the only validation
    /// with a side effect on the filesystem is resolving the backend
    /// executable path.
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (injectable for tests)
    pub fn from_lookup<F>(get: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_port = match get("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(raw))?,
            None => return Err(ConfigError::MissingPort),
        };

        let backend_port = parse_or("BACKEND_PORT", &get, DEFAULT_BACKEND_PORT)?;

        let raw_command = get("BACKEND_COMMAND").ok_or(ConfigError::MissingCommand)?;
        let mut words = shell_words::split(&raw_command)
            .map_err(|e| ConfigError::UnparsableCommand(e.to_string()))?;
        if words.is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        let executable = words.remove(0);
        let backend_command = resolve_executable(&executable, get("PATH").as_deref())
            .ok_or_else(|| ConfigError::ExecutableNotFound(executable.clone()))?;

        Ok(Config {
            listen_port,
            backend_port,
            backend_command,
            backend_args: words,
            backend_dir: get("BACKEND_DIR").map(PathBuf::from),
            data_dir: get("DATA_DIR").map(PathBuf::from),
            health_path: get("HEALTH_PATH").filter(|p| !p.is_empty()),
            startup_timeout_secs: parse_or("STARTUP_TIMEOUT_SECS", &get, DEFAULT_STARTUP_TIMEOUT)?,
            probe_interval_ms: parse_or("PROBE_INTERVAL_MS", &get, DEFAULT_PROBE_INTERVAL_MS)?,
            shutdown_grace_secs: parse_or("SHUTDOWN_GRACE_SECS", &get, DEFAULT_SHUTDOWN_GRACE)?,
            request_timeout_secs: parse_or("REQUEST_TIMEOUT_SECS", &get, DEFAULT_REQUEST_TIMEOUT)?,
            restart_max: parse_or("RESTART_MAX", &get, DEFAULT_RESTART_MAX)?,
            restart_window_secs: parse_or("RESTART_WINDOW_SECS", &get, DEFAULT_RESTART_WINDOW)?,
        })
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }
}

fn parse_or<T, F>(key: &'static str, get: &F, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

/// Resolve an executable the way the shell would: a name containing a path
/// separator must exist as given, a bare name is searched on PATH.
fn resolve_executable(name: &str, path_var: Option<&str>) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }

    for dir in path_var.unwrap_or("").split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

const DEFAULT_BACKEND_PORT: u16 = 4000;
const DEFAULT_STARTUP_TIMEOUT: u64 = 60;
const DEFAULT_PROBE_INTERVAL_MS: u64 = 250;
const DEFAULT_SHUTDOWN_GRACE: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT: u64 = 30;
const DEFAULT_RESTART_MAX: u32 = 3;
const DEFAULT_RESTART_WINDOW: u64 = 60;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map = env(pairs);
        Config::from_lookup(|key| map.get(key).cloned())
    }

    fn base_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("PORT", "8080"),
            ("BACKEND_COMMAND", "/bin/sleep 60"),
        ]
    }

    #[test]
    fn test_minimal_config() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.backend_port, 4000);
        assert_eq!(config.backend_command, PathBuf::from("/bin/sleep"));
        assert_eq!(config.backend_args, vec!["60".to_string()]);
        assert_eq!(config.startup_timeout(), Duration::from_secs(60));
        assert_eq!(config.probe_interval(), Duration::from_millis(250));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(10));
        assert_eq!(config.restart_max, 3);
        assert_eq!(config.restart_window(), Duration::from_secs(60));
        assert!(config.health_path.is_none());
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_missing_port_is_an_error() {
        let result = load(&[("BACKEND_COMMAND", "/bin/sleep 60")]);
        assert!(matches!(result, Err(ConfigError::MissingPort)));
    }

    #[test]
    fn test_non_numeric_port_is_an_error() {
        let mut pairs = base_env();
        pairs[0] = ("PORT", "eight-thousand");
        let result = load(&pairs);
        assert!(matches!(result, Err(ConfigError::InvalidPort(_))));
    }

    #[test]
    fn test_missing_command_is_an_error() {
        let result = load(&[("PORT", "8080")]);
        assert!(matches!(result, Err(ConfigError::MissingCommand)));

        let result = load(&[("PORT", "8080"), ("BACKEND_COMMAND", "")]);
        assert!(matches!(result, Err(ConfigError::MissingCommand)));
    }

    #[test]
    fn test_missing_executable_is_an_error() {
        let result = load(&[
            ("PORT", "8080"),
            ("BACKEND_COMMAND", "/no/such/binary --flag"),
        ]);
        assert!(matches!(result, Err(ConfigError::ExecutableNotFound(_))));
    }

    #[test]
    fn test_bare_name_resolved_on_path() {
        let map = env(&[
            ("PORT", "8080"),
            ("BACKEND_COMMAND", "sleep 60"),
            ("PATH", "/usr/bin:/bin"),
        ]);
        let config = Config::from_lookup(|key| map.get(key).cloned()).unwrap();
        assert!(config.backend_command.is_absolute());
        assert!(config.backend_command.ends_with("sleep"));
    }

    #[test]
    fn test_quoted_command_arguments() {
        let mut pairs = base_env();
        pairs[1] = ("BACKEND_COMMAND", r#"/bin/sh -c "sleep 60""#);
        let config = load(&pairs).unwrap();
        assert_eq!(config.backend_command, PathBuf::from("/bin/sh"));
        assert_eq!(
            config.backend_args,
            vec!["-c".to_string(), "sleep 60".to_string()]
        );
    }

    #[test]
    fn test_overrides() {
        let mut pairs = base_env();
        pairs.extend([
            ("BACKEND_PORT", "4100"),
            ("STARTUP_TIMEOUT_SECS", "5"),
            ("PROBE_INTERVAL_MS", "50"),
            ("SHUTDOWN_GRACE_SECS", "2"),
            ("REQUEST_TIMEOUT_SECS", "7"),
            ("RESTART_MAX", "5"),
            ("RESTART_WINDOW_SECS", "120"),
            ("HEALTH_PATH", "/healthz"),
            ("DATA_DIR", "/var/data"),
        ]);
        let config = load(&pairs).unwrap();
        assert_eq!(config.backend_port, 4100);
        assert_eq!(config.startup_timeout(), Duration::from_secs(5));
        assert_eq!(config.probe_interval(), Duration::from_millis(50));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(2));
        assert_eq!(config.request_timeout(), Duration::from_secs(7));
        assert_eq!(config.restart_max, 5);
        assert_eq!(config.restart_window(), Duration::from_secs(120));
        assert_eq!(config.health_path.as_deref(), Some("/healthz"));
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/data")));
    }

    #[test]
    fn test_invalid_numeric_override_is_an_error() {
        let mut pairs = base_env();
        pairs.push(("STARTUP_TIMEOUT_SECS", "soon"));
        let result = load(&pairs);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { key: "STARTUP_TIMEOUT_SECS", .. })
        ));
    }

    #[test]
    fn test_empty_health_path_means_tcp_probe() {
        let mut pairs = base_env();
        pairs.push(("HEALTH_PATH", ""));
        let config = load(&pairs).unwrap();
        assert!(config.health_path.is_none());
    }
}
