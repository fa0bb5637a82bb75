//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/easydb/config.toml)
//! 3. Environment variables (EASYDB_* prefix)
//!
//! Environment variables take precedence over config file values. The CLI
//! applies its own flags on top.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "EASYDB";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// File holding the persisted canonical document (server)
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,

    /// Address the server listens on
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Path prefix the endpoints are mounted under
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Seconds between persistence flushes (server)
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,

    /// Include error detail in failed responses (server)
    #[serde(default)]
    pub debug: bool,

    /// Base URL of the server, including the base path (client)
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Idle window before local changes are flushed, in milliseconds (client)
    #[serde(default = "default_sync_time_ms")]
    pub sync_time_ms: u64,

    /// Whether client sessions open the change stream (client)
    #[serde(default = "default_subscribe")]
    pub subscribe: bool,

    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Write logs to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
            bind: default_bind(),
            base_path: default_base_path(),
            persist_interval_secs: default_persist_interval_secs(),
            debug: false,
            server_url: default_server_url(),
            sync_time_ms: default_sync_time_ms(),
            subscribe: default_subscribe(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (EASYDB_DATA_FILE, EASYDB_BIND, ...)
    /// 2. Config file (~/.config/easydb/config.toml or EASYDB_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring a path given on the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(val) = env_var("DATA_FILE") {
            self.data_file = PathBuf::from(val);
        }

        if let Some(val) = env_var("BIND") {
            self.bind = val
                .parse()
                .with_context(|| format!("Invalid {}_BIND: {}", ENV_PREFIX, val))?;
        }

        if let Some(val) = env_var("BASE_PATH") {
            self.base_path = val;
        }

        if let Some(val) = env_var("PERSIST_INTERVAL_SECS") {
            self.persist_interval_secs = val.parse().with_context(|| {
                format!("Invalid {}_PERSIST_INTERVAL_SECS: {}", ENV_PREFIX, val)
            })?;
        }

        if let Some(val) = env_var("DEBUG") {
            self.debug = parse_flag(&val);
        }

        if let Some(val) = env_var("SERVER_URL") {
            self.server_url = val;
        }

        if let Some(val) = env_var("SYNC_TIME_MS") {
            self.sync_time_ms = val
                .parse()
                .with_context(|| format!("Invalid {}_SYNC_TIME_MS: {}", ENV_PREFIX, val))?;
        }

        if let Some(val) = env_var("SUBSCRIBE") {
            self.subscribe = parse_flag(&val);
        }

        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with EASYDB_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Some(path) = env_var("CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("easydb")
            .join("config.toml")
    }

    /// Interval between persistence flushes
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs.max(1))
    }

    /// Debounce window for client flushes
    pub fn sync_time(&self) -> Duration {
        Duration::from_millis(self.sync_time_ms)
    }

    /// Base path normalized to a leading slash and no trailing slash
    ///
    /// Returns an empty string when endpoints are mounted at the root.
    pub fn normalized_base_path(&self) -> String {
        let trimmed = self.base_path.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn parse_flag(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Get the default data file
fn default_data_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("easydb")
        .join("data.json")
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_base_path() -> String {
    "/easy-db".to_string()
}

fn default_persist_interval_secs() -> u64 {
    20
}

fn default_server_url() -> String {
    "http://127.0.0.1:3000/easy-db/".to_string()
}

fn default_sync_time_ms() -> u64 {
    1000
}

fn default_subscribe() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "EASYDB_DATA_FILE",
        "EASYDB_BIND",
        "EASYDB_BASE_PATH",
        "EASYDB_PERSIST_INTERVAL_SECS",
        "EASYDB_DEBUG",
        "EASYDB_SERVER_URL",
        "EASYDB_SYNC_TIME_MS",
        "EASYDB_SUBSCRIBE",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.debug);
        assert!(config.subscribe);
        assert_eq!(config.persist_interval_secs, 20);
        assert_eq!(config.sync_time(), Duration::from_secs(1));
        assert!(config.data_file.ends_with("data.json"));
        assert_eq!(config.normalized_base_path(), "/easy-db");
    }

    #[test]
    fn test_normalized_base_path() {
        let mut config = Config::default();

        config.base_path = "api/db/".to_string();
        assert_eq!(config.normalized_base_path(), "/api/db");

        config.base_path = "/".to_string();
        assert_eq!(config.normalized_base_path(), "");

        config.base_path = String::new();
        assert_eq!(config.normalized_base_path(), "");
    }

    #[test]
    fn test_env_override_data_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("EASYDB_DATA_FILE", "/tmp/easydb-test.json");
        config.apply_env_overrides().unwrap();

        assert_eq!(config.data_file, PathBuf::from("/tmp/easydb-test.json"));
    }

    #[test]
    fn test_env_override_flags() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("EASYDB_DEBUG", "true");
        env::set_var("EASYDB_SUBSCRIBE", "0");
        config.apply_env_overrides().unwrap();
        assert!(config.debug);
        assert!(!config.subscribe);

        env::set_var("EASYDB_DEBUG", "1");
        config.debug = false;
        config.apply_env_overrides().unwrap();
        assert!(config.debug);

        env::set_var("EASYDB_DEBUG", "false");
        config.apply_env_overrides().unwrap();
        assert!(!config.debug);
    }

    #[test]
    fn test_env_override_numbers() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("EASYDB_BIND", "0.0.0.0:9000");
        env::set_var("EASYDB_SYNC_TIME_MS", "250");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.sync_time(), Duration::from_millis(250));

        env::set_var("EASYDB_BIND", "not an address");
        assert!(config.apply_env_overrides().is_err());
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_file: PathBuf::from("/data/easydb.json"),
            server_url: "http://sync.example.com/easy-db/".to_string(),
            debug: true,
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_file"));
        assert!(toml_str.contains("server_url"));
        assert!(toml_str.contains("debug"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_file = "/custom/data.json"
            bind = "0.0.0.0:8080"
            persist_interval_secs = 5
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_file, PathBuf::from("/custom/data.json"));
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.persist_interval(), Duration::from_secs(5));
        // Unspecified fields fall back to defaults
        assert_eq!(config.base_path, "/easy-db");
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            sync_time_ms: 50,
            ..Config::default()
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.sync_time_ms, 50);
    }
}
