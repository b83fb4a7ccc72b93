//! Engine configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub streaming: StreamingSettings,
    #[serde(default)]
    pub control: ControlSettings,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "EngineSettings::default_log_level")]
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl EngineSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Frame reassembly settings, applied per stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingSettings {
    /// Receive requests (and pool buffers) kept outstanding per stream
    #[serde(default = "StreamingSettings::default_request_count")]
    pub request_count: usize,
    /// Frames held between reassembly and the publisher before eviction
    #[serde(default = "StreamingSettings::default_queue_capacity")]
    pub queue_capacity: usize,
    /// Publisher dequeue wait in milliseconds
    #[serde(default = "StreamingSettings::default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Bytes reserved in each buffer for the payload header
    #[serde(default = "StreamingSettings::default_header_allowance")]
    pub payload_header_allowance: usize,
    /// Watchdog timeout as a multiple of the frame interval
    #[serde(default = "StreamingSettings::default_watchdog_multiplier")]
    pub watchdog_multiplier: u32,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            request_count: Self::default_request_count(),
            queue_capacity: Self::default_queue_capacity(),
            publish_timeout_ms: Self::default_publish_timeout_ms(),
            payload_header_allowance: Self::default_header_allowance(),
            watchdog_multiplier: Self::default_watchdog_multiplier(),
        }
    }
}

impl StreamingSettings {
    fn default_request_count() -> usize {
        4
    }

    fn default_queue_capacity() -> usize {
        10
    }

    fn default_publish_timeout_ms() -> u64 {
        50
    }

    fn default_header_allowance() -> usize {
        protocol::MAX_PAYLOAD_HEADER_LEN
    }

    fn default_watchdog_multiplier() -> u32 {
        10
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Control transfer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Retries after the first failed attempt
    #[serde(default = "ControlSettings::default_retries")]
    pub retries: u32,
    #[serde(default = "ControlSettings::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            retries: Self::default_retries(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

impl ControlSettings {
    fn default_retries() -> u32 {
        5
    }

    fn default_timeout_ms() -> u64 {
        100
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherSettings {
    #[serde(default = "DispatcherSettings::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            queue_capacity: Self::default_queue_capacity(),
        }
    }
}

impl DispatcherSettings {
    fn default_queue_capacity() -> usize {
        10
    }
}

impl EngineConfig {
    /// Load configuration from the specified path, or the default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()),
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("uvc-stream").join("engine.toml")
        } else {
            PathBuf::from(".config/uvc-stream/engine.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.engine.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.engine.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.streaming.request_count == 0 {
            return Err(anyhow!("streaming.request_count must be at least 1"));
        }
        if self.streaming.queue_capacity == 0 {
            return Err(anyhow!("streaming.queue_capacity must be at least 1"));
        }
        if self.streaming.watchdog_multiplier == 0 {
            return Err(anyhow!("streaming.watchdog_multiplier must be at least 1"));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(anyhow!("dispatcher.queue_capacity must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.engine.log_level, "info");
        assert_eq!(config.streaming.request_count, 4);
        assert_eq!(config.streaming.payload_header_allowance, 12);
        assert_eq!(config.streaming.watchdog_multiplier, 10);
        assert_eq!(config.control.retries, 5);
        assert_eq!(config.dispatcher.queue_capacity, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = EngineConfig::default();
        config.engine.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.engine.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_counts() {
        let mut config = EngineConfig::default();
        config.streaming.request_count = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.streaming.watchdog_multiplier = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.dispatcher.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [streaming]
            request_count = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.streaming.request_count, 8);
        assert_eq!(config.streaming.queue_capacity, 10);
        assert_eq!(config.control.timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.toml");

        let mut config = EngineConfig::default();
        config.control.retries = 2;
        config.streaming.publish_timeout_ms = 20;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.streaming.publish_timeout(), Duration::from_millis(20));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "[engine]\nlog_level = \"loud\"\n").unwrap();
        assert!(EngineConfig::load(Some(path)).is_err());
    }
}
