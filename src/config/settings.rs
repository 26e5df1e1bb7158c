//! Service settings

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No configuration directory could be determined
    #[error("could not determine config directory")]
    NoConfigDir,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Service daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Name to advertise on the local network (none = unadvertised)
    pub service_name: Option<String>,
    /// Address the control endpoint binds to
    pub bind_address: String,
    /// Port the control endpoint binds to
    pub port: u16,
    /// Project directory holding credentials and runtime artifacts
    pub project_dir: Option<PathBuf>,
    /// Start the loaded program as soon as the daemon is up
    pub autostart: bool,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            bind_address: "127.0.0.1".to_string(),
            port: 61131,
            project_dir: None,
            autostart: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load config from file, falling back to defaults when absent
    ///
    /// # Errors
    ///
    /// Fails when no config directory exists or the file is malformed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = super::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    ///
    /// # Errors
    ///
    /// Fails when no config directory exists or the file is unwritable.
    pub fn save(&self) -> Result<(), ConfigError> {
        let dir = super::config_dir().ok_or(ConfigError::NoConfigDir)?;
        std::fs::create_dir_all(&dir)?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(dir.join("config.toml"), content)?;
        Ok(())
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level (error, warn, info, debug, trace)
    pub level: String,
    /// Also write logs to a daily-rolled file
    pub file_enabled: bool,
    /// Log file directory (application log dir when unset)
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: false,
            dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.port, 61131);
        assert!(!config.autostart);
        assert!(config.service_name.is_none());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = ServiceConfig::default();
        config.service_name = Some("bench-plc".into());
        config.bind_address = "0.0.0.0".into();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: ServiceConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.service_name.as_deref(), Some("bench-plc"));
        assert_eq!(back.bind_address, "0.0.0.0");
        assert_eq!(back.port, config.port);
    }
}
