//! Configuration management for hubcore
//!
//! This module handles loading, parsing, and managing configuration from:
//! 1. Embedded default_config.toml (compile-time defaults)
//! 2. User config at ~/.config/hubcore/config.toml (or platform-specific location)
//! 3. Project-local config at ./.hubcore/config.toml

use crate::error::{ConfigError, ConfigResult};
use crate::health::HealthSettings;
use crate::logging::{self, LogFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration embedded in binary
const DEFAULT_CONFIG: &str = include_str!("../../default_config.toml");

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Start periodic health checks from `init`
    #[serde(default = "default_true")]
    pub auto_health_check: bool,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enable_audit_log: bool,
    /// Trace every publish and raise the default log level to DEBUG
    #[serde(default = "default_false")]
    pub enable_debug_mode: bool,
    /// Soft per-event limit; exceeding it only warns
    #[serde(default = "default_max_event_listeners")]
    pub max_event_listeners: usize,
    #[serde(default = "default_audit_log_capacity")]
    pub audit_log_capacity: usize,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_stale_module_threshold")]
    pub stale_module_threshold_secs: u64,
    /// URL probed with `GET` by the health monitor
    #[serde(default)]
    pub health_endpoint: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_true")]
    pub timestamps: bool,
    #[serde(default = "default_false")]
    pub file_line: bool,
    #[serde(default = "default_false")]
    pub file_output: bool,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            file_line: false,
            file_output: false,
            file_path: None,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_max_event_listeners() -> usize {
    crate::event_bus::DEFAULT_MAX_LISTENERS
}

fn default_audit_log_capacity() -> usize {
    crate::audit::DEFAULT_AUDIT_CAPACITY
}

fn default_probe_timeout() -> u64 {
    5000
}

fn default_stale_module_threshold() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

// ============================================================================
// Configuration loading
// ============================================================================

impl HubConfig {
    /// Load configuration with fallback chain:
    /// 1. Project-local .hubcore/config.toml
    /// 2. User config ~/.config/hubcore/config.toml
    /// 3. Embedded default_config.toml
    pub fn load() -> ConfigResult<Self> {
        let mut config: HubConfig = toml::from_str(DEFAULT_CONFIG).map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse default config: {}", e))
        })?;

        for path in [Self::user_config_path(), Self::project_config_path()]
            .into_iter()
            .flatten()
        {
            if !path.exists() {
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(overlay) => {
                    config = overlay;
                    tracing::info!("Loaded config from {:?}", path);
                }
                Err(e) => {
                    tracing::warn!("Failed to load config {:?}: {}", path, e);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Get the user config path (~/.config/hubcore/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|config_dir| config_dir.join("hubcore").join("config.toml"))
    }

    /// Get the project-local config path (./.hubcore/config.toml)
    pub fn project_config_path() -> Option<PathBuf> {
        std::env::current_dir()
            .ok()
            .map(|cwd| cwd.join(".hubcore").join("config.toml"))
    }

    /// Write configuration as pretty TOML, creating parent directories
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let toml_string =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml_string).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Reject values that would stall or disable a component
    pub fn validate(&self) -> ConfigResult<()> {
        if self.health_check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "health_check_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "probe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.stale_module_threshold_secs == 0 {
            return Err(ConfigError::Invalid(
                "stale_module_threshold_secs must be greater than zero".to_string(),
            ));
        }
        if self.audit_log_capacity == 0 {
            return Err(ConfigError::Invalid(
                "audit_log_capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_event_listeners == 0 {
            return Err(ConfigError::Invalid(
                "max_event_listeners must be greater than zero".to_string(),
            ));
        }
        if let Some(endpoint) = &self.health_endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "health_endpoint must be an http(s) URL, got '{}'",
                    endpoint
                )));
            }
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stale_module_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_module_threshold_secs)
    }

    pub fn health_settings(&self) -> HealthSettings {
        HealthSettings {
            check_interval: self.health_check_interval(),
            probe_timeout: self.probe_timeout(),
            stale_threshold: self.stale_module_threshold(),
        }
    }

    /// Logging setup for [`logging::init_logging`]; debug mode forces DEBUG
    pub fn logging_config(&self) -> logging::LoggingConfig {
        let level = if self.enable_debug_mode {
            tracing::Level::DEBUG
        } else {
            logging::parse_level(&self.logging.level)
        };
        logging::LoggingConfig {
            level,
            format: LogFormat::from_str(&self.logging.format),
            timestamps: self.logging.timestamps,
            file_line: self.logging.file_line,
            file_output: self.logging.file_output,
            file_path: self.logging.file_path.clone(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|_| Self {
            auto_health_check: true,
            health_check_interval_secs: default_health_check_interval(),
            enable_audit_log: true,
            enable_debug_mode: false,
            max_event_listeners: default_max_event_listeners(),
            audit_log_capacity: default_audit_log_capacity(),
            probe_timeout_ms: default_probe_timeout(),
            stale_module_threshold_secs: default_stale_module_threshold(),
            health_endpoint: None,
            logging: LoggingConfig::default(),
        })
    }
}
