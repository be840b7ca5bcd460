//! Configuration service system for dependency injection and test isolation.
//!
//! This module provides a clean abstraction for configuration management
//! that enables dependency injection and complete test isolation without
//! requiring unsafe code or global state resets.

use crate::{Result, config::Config, error::WhisperdError};
use config::{Config as ConfigCrate, ConfigBuilder, Environment, File, builder::DefaultState};
use log::debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Configuration service trait for dependency injection.
///
/// This trait abstracts configuration loading and reloading operations,
/// allowing different implementations for production and testing environments.
pub trait ConfigService: Send + Sync {
    /// Get the current configuration.
    ///
    /// Returns the current [`Config`] instance loaded from files,
    /// environment variables, and defaults. This method may use internal
    /// caching for performance.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading fails due to:
    /// - Invalid TOML format in configuration files
    /// - Missing required configuration values
    /// - File system access issues
    fn get_config(&self) -> Result<Config>;

    /// Reload configuration from sources, discarding any cached values.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration reloading fails.
    fn reload(&self) -> Result<()>;

    /// Save configuration to a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if TOML serialization fails, parent directories
    /// cannot be created, or the file write fails.
    fn save_config_to_file(&self, path: &Path) -> Result<()>;

    /// Get the default configuration file path.
    ///
    /// Returns the path where configuration files are expected to be
    /// located, typically `$CONFIG_DIR/whisperd/config.toml`.
    fn get_config_file_path(&self) -> Result<PathBuf>;
}

/// Production configuration service implementation.
///
/// This service loads configuration from multiple sources in order of priority:
/// 1. Environment variables (highest priority, `WHISPERD_` prefix)
/// 2. User configuration file
/// 3. Built-in defaults (lowest priority)
///
/// Configuration is cached after first load for performance.
pub struct ProductionConfigService {
    config_builder: ConfigBuilder<DefaultState>,
    cached_config: Arc<RwLock<Option<Config>>>,
    config_file_path: PathBuf,
}

impl ProductionConfigService {
    /// Create a new production configuration service.
    ///
    /// Honors `WHISPERD_CONFIG_PATH` as an override for the configuration
    /// file location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration builder cannot be initialized.
    pub fn new() -> Result<Self> {
        let config_file_path = match std::env::var("WHISPERD_CONFIG_PATH") {
            Ok(custom_path) => PathBuf::from(custom_path),
            Err(_) => Self::user_config_path(),
        };
        Self::with_config_file(config_file_path)
    }

    /// Create a configuration service reading the given file.
    pub fn with_config_file(config_file_path: PathBuf) -> Result<Self> {
        let config_builder = ConfigCrate::builder()
            .add_source(File::from(config_file_path.clone()).required(false))
            .add_source(Environment::with_prefix("WHISPERD").separator("__"));

        Ok(Self {
            config_builder,
            cached_config: Arc::new(RwLock::new(None)),
            config_file_path,
        })
    }

    /// Get the user configuration file path.
    fn user_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("whisperd")
            .join("config.toml")
    }

    /// Load and validate configuration from all sources.
    fn load_and_validate(&self) -> Result<Config> {
        debug!("ProductionConfigService: loading configuration from sources");

        let config_crate = self.config_builder.build_cloned().map_err(|e| {
            debug!("ProductionConfigService: config build failed: {}", e);
            WhisperdError::config(format!("Failed to build configuration: {}", e))
        })?;

        let mut app_config = match config_crate.try_deserialize::<Config>() {
            Ok(config) => config,
            Err(e) => {
                debug!(
                    "ProductionConfigService: deserialization failed ({}), using defaults",
                    e
                );
                Config::default()
            }
        };
        if self.config_file_path.exists() {
            app_config.loaded_from = Some(self.config_file_path.clone());
        }

        crate::config::validate_config(&app_config)?;
        Ok(app_config)
    }
}

impl ConfigService for ProductionConfigService {
    fn get_config(&self) -> Result<Config> {
        {
            let cached = self
                .cached_config
                .read()
                .map_err(|_| WhisperdError::config("configuration cache lock poisoned"))?;
            if let Some(config) = cached.as_ref() {
                return Ok(config.clone());
            }
        }

        let config = self.load_and_validate()?;
        let mut cached = self
            .cached_config
            .write()
            .map_err(|_| WhisperdError::config("configuration cache lock poisoned"))?;
        *cached = Some(config.clone());
        Ok(config)
    }

    fn reload(&self) -> Result<()> {
        let config = self.load_and_validate()?;
        let mut cached = self
            .cached_config
            .write()
            .map_err(|_| WhisperdError::config("configuration cache lock poisoned"))?;
        *cached = Some(config);
        Ok(())
    }

    fn save_config_to_file(&self, path: &Path) -> Result<()> {
        let config = self.get_config()?;
        let content = toml::to_string_pretty(&config)
            .map_err(|e| WhisperdError::config(format!("TOML serialization failed: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    fn get_config_file_path(&self) -> Result<PathBuf> {
        Ok(self.config_file_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let service =
            ProductionConfigService::with_config_file(temp.path().join("nope.toml")).unwrap();
        let config = service.get_config().unwrap();
        assert_eq!(config.pool.engine, "faster_whisper");
        assert!(config.loaded_from.is_none());
    }

    #[test]
    fn test_config_file_values_are_loaded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[pool]
engine = "openai_whisper"
min_size = 1
max_size = 4
max_instances_per_gpu = 2
init_with_max_size = true
acquire_timeout_seconds = 10
health_check_enabled = false
"#,
        )
        .unwrap();

        let service = ProductionConfigService::with_config_file(path.clone()).unwrap();
        let config = service.get_config().unwrap();
        assert_eq!(config.pool.engine, "openai_whisper");
        assert_eq!(config.pool.max_size, 4);
        assert!(config.pool.init_with_max_size);
        assert_eq!(config.loaded_from, Some(path));
    }

    #[test]
    fn test_save_config_roundtrip() {
        let temp = TempDir::new().unwrap();
        let service =
            ProductionConfigService::with_config_file(temp.path().join("absent.toml")).unwrap();
        let out = temp.path().join("saved/config.toml");
        service.save_config_to_file(&out).unwrap();
        assert!(out.exists());

        let reloaded = ProductionConfigService::with_config_file(out).unwrap();
        let config = reloaded.get_config().unwrap();
        assert_eq!(config.callback.retry_attempts, 3);
    }
}
