//! Configuration data structures

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Logging level configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "info")]
    #[default]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Logging verbosity level
    pub log_level: LogLevel,
    /// JSON file backing the execution store
    pub store_path: PathBuf,
    /// Directory scanned for definition files on startup
    pub definitions_dir: Option<PathBuf>,
    /// Server bind address
    pub server_host: String,
    /// Server port number
    pub server_port: u16,
    /// How often due timers are checked, in milliseconds
    pub timer_tick_ms: u64,
    /// Timeout applied to callback tasks that do not declare one
    pub default_callback_timeout_seconds: u64,
    /// Upper bound for any retry delay
    pub max_backoff_seconds: u64,
    /// Steps an execution may take without waiting before it fails
    pub max_transitions_per_drive: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            log_level: LogLevel::Info,
            store_path: home.join(".statewright").join("store.json"),
            definitions_dir: None,
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            timer_tick_ms: 250,
            default_callback_timeout_seconds: 86_400, // one day
            max_backoff_seconds: 600,
            max_transitions_per_drive: 10_000,
        }
    }
}

impl Configuration {
    /// Load configuration from file
    pub fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Configuration = toml::from_str(&content)?;
            Ok(config)
        } else {
            // Return default configuration if file doesn't exist
            Ok(Configuration::default())
        }
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the XDG config directory path
    pub fn default_config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_dir = dirs::config_dir().ok_or("Could not determine config directory")?;
        Ok(config_dir.join("statewright").join("config.toml"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Validate port (u16 is already 0-65535, so only check minimum)
        if self.server_port < 1024 {
            errors.push(
                "server_port must be at least 1024 (privileged ports not allowed)".to_string(),
            );
        }

        if self.timer_tick_ms == 0 || self.timer_tick_ms > 60_000 {
            errors.push("timer_tick_ms must be between 1 and 60000".to_string());
        }

        if self.default_callback_timeout_seconds == 0 {
            errors.push("default_callback_timeout_seconds must be at least 1".to_string());
        }

        if self.max_backoff_seconds == 0 {
            errors.push("max_backoff_seconds must be at least 1".to_string());
        }

        if self.max_transitions_per_drive == 0 {
            errors.push("max_transitions_per_drive must be at least 1".to_string());
        }

        if self.store_path.as_os_str().is_empty() {
            errors.push("store_path cannot be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
