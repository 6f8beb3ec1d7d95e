use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use anyhow::{Context, Result};
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the admin API, e.g. `https://api.example.com`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

fn default_base_url() -> String { "http://localhost:8000".to_string() }
fn default_socket_path() -> PathBuf { common::default_socket_path() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            socket_path: default_socket_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_start_delay")]
    pub start_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_token_attempts")]
    pub token_attempts: u32,
    #[serde(default = "default_token_base_delay")]
    pub token_base_delay_ms: u64,
    #[serde(default = "default_token_max_delay")]
    pub token_max_delay_ms: u64,
}

fn default_start_delay() -> u64 { 1000 }
fn default_heartbeat_interval() -> u64 { 30_000 }
fn default_reconnect_base_delay() -> u64 { 1000 }
fn default_reconnect_max_delay() -> u64 { 30_000 }
fn default_max_reconnect_attempts() -> u32 { 5 }
fn default_token_attempts() -> u32 { 5 }
fn default_token_base_delay() -> u64 { 1000 }
fn default_token_max_delay() -> u64 { 5000 }

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            start_delay_ms: default_start_delay(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            reconnect_base_delay_ms: default_reconnect_base_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            token_attempts: default_token_attempts(),
            token_base_delay_ms: default_token_base_delay(),
            token_max_delay_ms: default_token_max_delay(),
        }
    }
}

impl StreamConfig {
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn token_base_delay(&self) -> Duration {
        Duration::from_millis(self.token_base_delay_ms)
    }

    pub fn token_max_delay(&self) -> Duration {
        Duration::from_millis(self.token_max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_max_entries() -> usize { common::MAX_HISTORY_ENTRIES }

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_notifications_enabled")]
    pub enabled: bool,
    #[serde(default = "default_info_duration")]
    pub info_duration_ms: u64,
    #[serde(default = "default_success_duration")]
    pub success_duration_ms: u64,
    #[serde(default = "default_warning_duration")]
    pub warning_duration_ms: u64,
    #[serde(default = "default_failure_duration")]
    pub failure_duration_ms: u64,
}

fn default_notifications_enabled() -> bool { true }
fn default_info_duration() -> u64 { 3000 }
fn default_success_duration() -> u64 { 5000 }
fn default_warning_duration() -> u64 { 5000 }
fn default_failure_duration() -> u64 { 10_000 }

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: default_notifications_enabled(),
            info_duration_ms: default_info_duration(),
            success_duration_ms: default_success_duration(),
            warning_duration_ms: default_warning_duration(),
            failure_duration_ms: default_failure_duration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub output: Option<PathBuf>,
    pub alerts_output: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
            alerts_output: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Hex encoded secp256k1 secret key. No key file means no session.
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Detect file type by extension and load
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "toml" => Self::from_toml_file(path),
            _ => Err(anyhow::anyhow!("Unsupported config file format. Use .yaml, .yml, or .toml")),
        }
    }

    /// Load from `path` when it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            log::warn!("Config file {:?} not found, using defaults", path);
            Ok(Self::default())
        }
    }
}

/// Where the admin API currently lives.
pub trait EndpointResolver: Send + Sync {
    fn base_url(&self) -> Result<String>;
}

/// A fixed base URL.
pub struct StaticEndpoint(String);

impl StaticEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self(base_url.into())
    }
}

impl EndpointResolver for StaticEndpoint {
    fn base_url(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Reads `server.base_url` from the persisted config file on every call,
/// so an edited endpoint is used by the next connection attempt.
pub struct ConfigFileEndpoint {
    path: PathBuf,
    last_good: Mutex<String>,
}

impl ConfigFileEndpoint {
    pub fn new(path: impl Into<PathBuf>, initial: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            last_good: Mutex::new(initial.into()),
        }
    }
}

impl EndpointResolver for ConfigFileEndpoint {
    fn base_url(&self) -> Result<String> {
        let mut last_good = self.last_good.lock().unwrap();
        if !self.path.exists() {
            return Ok(last_good.clone());
        }
        match Config::from_file(&self.path) {
            Ok(config) => {
                if *last_good != config.server.base_url {
                    log::info!("Server endpoint changed to {}", config.server.base_url);
                    *last_good = config.server.base_url.clone();
                }
                Ok(config.server.base_url)
            }
            Err(e) => {
                log::warn!("Could not re-read {:?} ({:#}), keeping {}", self.path, e, last_good);
                Ok(last_good.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = serde_yaml::from_str("server:\n  base_url: https://api.example.com\n").unwrap();
        assert_eq!(config.server.base_url, "https://api.example.com");
        assert_eq!(config.stream.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.stream.max_reconnect_attempts, 5);
        assert_eq!(config.stream.token_max_delay(), Duration::from_secs(5));
        assert_eq!(config.history.max_entries, 1000);
        assert!(config.notifications.enabled);
        assert!(config.auth.key_file.is_none());
    }

    #[test]
    fn test_toml_and_extension_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobfeed.toml");
        fs::write(&path, "[stream]\nstart_delay_ms = 0\n[history]\nmax_entries = 10\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.stream.start_delay(), Duration::ZERO);
        assert_eq!(config.history.max_entries, 10);

        let bad = dir.path().join("jobfeed.ini");
        fs::write(&bad, "").unwrap();
        assert!(Config::from_file(&bad).is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.server.base_url, "http://localhost:8000");
    }

    #[test]
    fn test_file_endpoint_follows_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "server:\n  base_url: http://one:8000\n").unwrap();
        let endpoint = ConfigFileEndpoint::new(&path, "http://fallback");
        assert_eq!(endpoint.base_url().unwrap(), "http://one:8000");

        fs::write(&path, "server:\n  base_url: http://two:8000\n").unwrap();
        assert_eq!(endpoint.base_url().unwrap(), "http://two:8000");

        // A broken file keeps the last value that worked.
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"server: [unterminated").unwrap();
        assert_eq!(endpoint.base_url().unwrap(), "http://two:8000");
    }
}
