//! Configuration module for FlowPulse Monitor.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FLOWPULSE_SERVER_URL` | For `run`/`publish` | - | Flow service URL (e.g., `https://flow.example.com`) |
//! | `FLOWPULSE_SOURCE_ID` | No | hostname | Identifier sent with every request |
//! | `FLOWPULSE_FLOW_DIR` | No | `~/.flowpulse/plugins` | Directory holding one folder per plugin |
//! | `FLOWPULSE_PLUGINS` | No | (all) | Comma-separated plugin folder names to monitor |
//! | `FLOWPULSE_PUBLISH_INTERVAL_SECS` | No | 300 | Seconds between pipeline cycles |
//! | `FLOWPULSE_REFRESH_INTERVAL_SECS` | No | 120 | Seconds between snapshot refreshes and idle checks |
//! | `FLOWPULSE_INTENTION_CREDIT` | No | false | Credit momentum when a new intention is set |
//!
//! # Example
//!
//! ```no_run
//! use flowpulse_monitor::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Flow dir: {}", config.flow_dir.display());
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

/// Default flow directory relative to home.
const DEFAULT_FLOW_DIR: &str = ".flowpulse/plugins";

/// Default seconds between pipeline cycles.
const DEFAULT_PUBLISH_INTERVAL_SECS: u64 = 300;

/// Default seconds between snapshot refreshes.
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 120;

const SERVER_URL_VAR: &str = "FLOWPULSE_SERVER_URL";
const SOURCE_ID_VAR: &str = "FLOWPULSE_SOURCE_ID";
const FLOW_DIR_VAR: &str = "FLOWPULSE_FLOW_DIR";
const PLUGINS_VAR: &str = "FLOWPULSE_PLUGINS";
const PUBLISH_INTERVAL_VAR: &str = "FLOWPULSE_PUBLISH_INTERVAL_SECS";
const REFRESH_INTERVAL_VAR: &str = "FLOWPULSE_REFRESH_INTERVAL_SECS";
const INTENTION_CREDIT_VAR: &str = "FLOWPULSE_INTENTION_CREDIT";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,

    /// The flow directory could not be listed.
    #[error("failed to list plugins in {path}: {source}")]
    PluginDiscovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration for the FlowPulse Monitor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Flow service URL. Only the commands that talk to the server need it.
    pub server_url: Option<String>,

    /// Identifier sent as `X-Source-Id`.
    pub source_id: String,

    /// Directory holding one folder per plugin.
    pub flow_dir: PathBuf,

    /// Plugins to monitor. `None` means every folder in `flow_dir`.
    pub plugins: Option<Vec<String>>,

    pub publish_interval: Duration,

    pub refresh_interval: Duration,

    /// Whether a new intention on the same task earns momentum.
    pub intention_credit: bool,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - An interval is set but is not an integer of at least 1
    /// - `FLOWPULSE_INTENTION_CREDIT` is not a boolean
    /// - The home directory cannot be determined (needed for the default flow dir)
    pub fn from_env() -> Result<Self, ConfigError> {
        // Optional: FLOWPULSE_SERVER_URL (checked by require_server_url)
        let server_url = env::var(SERVER_URL_VAR)
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        // Optional: FLOWPULSE_SOURCE_ID (default: hostname)
        let source_id = env::var(SOURCE_ID_VAR).unwrap_or_else(|_| get_hostname());

        // Optional: FLOWPULSE_FLOW_DIR (default: ~/.flowpulse/plugins)
        let flow_dir = match env::var(FLOW_DIR_VAR) {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
                base_dirs.home_dir().join(DEFAULT_FLOW_DIR)
            }
        };

        // Optional: FLOWPULSE_PLUGINS (default: None = every plugin folder)
        let plugins = env::var(PLUGINS_VAR)
            .ok()
            .map(|val| {
                val.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty());

        let publish_interval = parse_interval(PUBLISH_INTERVAL_VAR, DEFAULT_PUBLISH_INTERVAL_SECS)?;
        let refresh_interval = parse_interval(REFRESH_INTERVAL_VAR, DEFAULT_REFRESH_INTERVAL_SECS)?;

        let intention_credit = match env::var(INTENTION_CREDIT_VAR) {
            Ok(val) => parse_bool(&val).ok_or_else(|| ConfigError::InvalidValue {
                key: INTENTION_CREDIT_VAR.to_string(),
                message: format!("expected true or false, got '{val}'"),
            })?,
            Err(_) => false,
        };

        Ok(Self {
            server_url,
            source_id,
            flow_dir,
            plugins,
            publish_interval,
            refresh_interval,
            intention_credit,
        })
    }

    /// The server URL, or an error naming the missing variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnvVar`] if `FLOWPULSE_SERVER_URL` is unset.
    pub fn require_server_url(&self) -> Result<&str, ConfigError> {
        self.server_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar(SERVER_URL_VAR.to_string()))
    }

    /// Directory of one plugin.
    #[must_use]
    pub fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.flow_dir.join(plugin_id)
    }

    /// The configured plugins, or every folder in the flow directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PluginDiscovery`] if the flow directory cannot
    /// be read while discovering plugins.
    pub fn resolve_plugins(&self) -> Result<Vec<String>, ConfigError> {
        match &self.plugins {
            Some(plugins) => Ok(plugins.clone()),
            None => discover_plugins(&self.flow_dir),
        }
    }
}

/// Names of the subdirectories of `flow_dir`, sorted.
fn discover_plugins(flow_dir: &Path) -> Result<Vec<String>, ConfigError> {
    let discovery_err = |source| ConfigError::PluginDiscovery {
        path: flow_dir.to_path_buf(),
        source,
    };

    let mut plugins = Vec::new();
    for entry in std::fs::read_dir(flow_dir).map_err(discovery_err)? {
        let entry = entry.map_err(discovery_err)?;
        if entry.file_type().map_err(discovery_err)?.is_dir() {
            plugins.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    plugins.sort();
    Ok(plugins)
}

/// Parses an interval in whole seconds (at least 1).
fn parse_interval(key: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    let Ok(val) = env::var(key) else {
        return Ok(Duration::from_secs(default_secs));
    };

    let secs = val.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected positive integer, got '{val}'"),
    })?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "interval must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Gets the system hostname, falling back to "unknown" if it cannot be determined.
fn get_hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to run tests with isolated environment variables.
    /// Clears all FLOWPULSE_* vars before the test and restores them after.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("FLOWPULSE_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let result = f();

        for (key, _) in env::vars().filter(|(k, _)| k.starts_with("FLOWPULSE_")) {
            env::remove_var(key);
        }
        for (key, value) in saved_vars {
            env::set_var(key, value);
        }

        result
    }

    #[test]
    #[serial]
    fn test_defaults() {
        with_clean_env(|| {
            let config = Config::from_env().unwrap();
            assert_eq!(config.server_url, None);
            assert!(!config.source_id.is_empty());
            assert!(config.flow_dir.ends_with(".flowpulse/plugins"));
            assert_eq!(config.plugins, None);
            assert_eq!(config.publish_interval, Duration::from_secs(300));
            assert_eq!(config.refresh_interval, Duration::from_secs(120));
            assert!(!config.intention_credit);
        });
    }

    #[test]
    #[serial]
    fn test_missing_server_url_is_reported_on_demand() {
        with_clean_env(|| {
            let config = Config::from_env().unwrap();
            let err = config.require_server_url().unwrap_err();
            assert!(
                matches!(err, ConfigError::MissingEnvVar(ref s) if s == "FLOWPULSE_SERVER_URL")
            );
        });
    }

    #[test]
    #[serial]
    fn test_full_config() {
        with_clean_env(|| {
            env::set_var("FLOWPULSE_SERVER_URL", "https://flow.example.com");
            env::set_var("FLOWPULSE_SOURCE_ID", "desk-7");
            env::set_var("FLOWPULSE_FLOW_DIR", "/tmp/flow");
            env::set_var("FLOWPULSE_PLUGINS", "intellij, vscode,,");
            env::set_var("FLOWPULSE_PUBLISH_INTERVAL_SECS", "30");
            env::set_var("FLOWPULSE_REFRESH_INTERVAL_SECS", "15");
            env::set_var("FLOWPULSE_INTENTION_CREDIT", "true");

            let config = Config::from_env().unwrap();
            assert_eq!(config.require_server_url().unwrap(), "https://flow.example.com");
            assert_eq!(config.source_id, "desk-7");
            assert_eq!(config.plugin_dir("intellij"), PathBuf::from("/tmp/flow/intellij"));
            assert_eq!(
                config.plugins,
                Some(vec!["intellij".to_string(), "vscode".to_string()])
            );
            assert_eq!(config.publish_interval, Duration::from_secs(30));
            assert_eq!(config.refresh_interval, Duration::from_secs(15));
            assert!(config.intention_credit);
        });
    }

    #[test]
    #[serial]
    fn test_zero_interval_is_rejected() {
        with_clean_env(|| {
            env::set_var("FLOWPULSE_PUBLISH_INTERVAL_SECS", "0");
            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == PUBLISH_INTERVAL_VAR
            ));
        });
    }

    #[test]
    #[serial]
    fn test_non_numeric_interval_is_rejected() {
        with_clean_env(|| {
            env::set_var("FLOWPULSE_REFRESH_INTERVAL_SECS", "soon");
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    #[serial]
    fn test_invalid_intention_credit() {
        with_clean_env(|| {
            env::set_var("FLOWPULSE_INTENTION_CREDIT", "maybe");
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("FLOWPULSE_INTENTION_CREDIT"));
        });
    }

    #[test]
    #[serial]
    fn test_plugins_discovered_from_flow_dir() {
        with_clean_env(|| {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir(dir.path().join("vscode")).unwrap();
            std::fs::create_dir(dir.path().join("intellij")).unwrap();
            std::fs::write(dir.path().join("notes.txt"), "").unwrap();
            env::set_var("FLOWPULSE_FLOW_DIR", dir.path());

            let config = Config::from_env().unwrap();
            assert_eq!(config.resolve_plugins().unwrap(), vec!["intellij", "vscode"]);
        });
    }

    #[test]
    fn test_parse_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("2"), None);
    }
}
