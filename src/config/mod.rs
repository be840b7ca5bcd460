// src/config/mod.rs
//! Configuration management module for whisperd.
//!
//! This module provides the complete configuration service system with
//! dependency injection support and comprehensive type definitions.
//!
//! # Key Components
//!
//! - [`Config`] - Main configuration structure containing all settings
//! - [`ConfigService`] - Service interface for configuration management
//! - [`ProductionConfigService`] - Production implementation with file I/O
//! - [`TestConfigBuilder`] - Builder pattern for test configurations
//!
//! # Examples
//!
//! ```rust
//! use whisperd::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! assert_eq!(config.pool.engine, "faster_whisper");
//! assert_eq!(config.processor.status_check_interval_seconds, 3);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! The configuration system uses dependency injection to provide testable
//! and maintainable configuration management. All configuration access
//! should go through the [`ConfigService`] trait.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod builder;
pub mod service;
pub mod validator;

// ============================================================================
// Configuration Type Definitions
// ============================================================================

/// Full application configuration for whisperd.
///
/// This struct aggregates all settings for task persistence, the model
/// pool, the background processor, media retrieval, and result callbacks.
///
/// # Serialization
///
/// This struct can be serialized to/from TOML format for configuration files.
///
/// ```rust
/// use whisperd::config::Config;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::default();
/// let toml_str = toml::to_string(&config)?;
/// assert!(toml_str.contains("[pool]"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Task store (SQLite) settings.
    pub store: StoreConfig,
    /// Model pool sizing and engine selection.
    pub pool: PoolConfig,
    /// Background task processor settings.
    pub processor: ProcessorConfig,
    /// Media download and temp-file settings.
    pub media: MediaConfig,
    /// Result callback delivery settings.
    pub callback: CallbackConfig,
    /// General runtime options.
    pub general: GeneralConfig,
    /// Optional file path from which the configuration was loaded.
    pub loaded_from: Option<PathBuf>,
}

/// Task store configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file path; ":memory:" opens a shared in-memory database.
    pub database_path: PathBuf,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Connection attempts before surfacing a fatal store error.
    pub connect_retry_attempts: u32,
    /// SQLite busy timeout in seconds.
    pub busy_timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("whisperd.db"),
            max_connections: 10,
            connect_retry_attempts: 5,
            busy_timeout_seconds: 30,
        }
    }
}

/// Model pool configuration parameters.
///
/// The pool owns a bounded collection of engine handles. `max_size` is a
/// request: it is clamped against the visible device topology at
/// construction (see the pool module) and the adjustment is logged.
///
/// # Examples
///
/// ```rust
/// use whisperd::config::PoolConfig;
///
/// let pool = PoolConfig::default();
/// assert_eq!(pool.min_size, 1);
/// assert!(pool.min_size <= pool.max_size);
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PoolConfig {
    /// Engine selector: "openai_whisper" or "faster_whisper".
    pub engine: String,
    /// Handles created at initialization (unless `init_with_max_size`).
    pub min_size: usize,
    /// Upper bound on concurrently existing handles, pre-clamp.
    pub max_size: usize,
    /// Cap on handles bound to a single GPU.
    pub max_instances_per_gpu: usize,
    /// Populate `max_size` handles at initialization instead of `min_size`.
    pub init_with_max_size: bool,
    /// Seconds to wait for a free handle before growing or failing.
    pub acquire_timeout_seconds: u64,
    /// Run a cheap health probe before returning handles to the pool.
    pub health_check_enabled: bool,
    /// Engine-specific parameters forwarded to handle construction.
    pub engine_params: EngineParams,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            engine: "faster_whisper".to_string(),
            min_size: 1,
            max_size: 2,
            max_instances_per_gpu: 1,
            init_with_max_size: false,
            acquire_timeout_seconds: 30,
            health_check_enabled: true,
            engine_params: EngineParams::default(),
        }
    }
}

/// Engine-specific parameters.
///
/// These are opaque to the pool; each engine adapter reads the fields it
/// understands and forwards device placement alongside them.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineParams {
    /// Model identifier (e.g. "large-v3").
    pub model: String,
    /// Base URL of the inference runtime.
    pub base_url: String,
    /// Optional API key for the runtime.
    pub api_key: Option<String>,
    /// CPU threads per handle; 0 selects half the machine threads.
    pub cpu_threads: usize,
    /// Parallel workers inside one handle (faster-whisper).
    pub num_workers: usize,
    /// Model weight cache directory, forwarded to the runtime.
    pub download_root: Option<PathBuf>,
    /// HTTP request timeout for one transcription call, in seconds.
    /// Long media needs a generous ceiling.
    pub request_timeout_seconds: u64,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            model: "large-v3".to_string(),
            base_url: "http://127.0.0.1:9000/v1".to_string(),
            api_key: None,
            cpu_threads: 0,
            num_workers: 1,
            download_root: None,
            request_timeout_seconds: 1800,
        }
    }
}

/// Background processor configuration.
///
/// `max_concurrent_tasks` is clamped to the pool's effective `max_size` at
/// processor construction so the queue can never outrun the pool.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Tasks claimed per fetch cycle and upper bound on in-flight work.
    pub max_concurrent_tasks: usize,
    /// Seconds to sleep when the queue is empty.
    pub status_check_interval_seconds: u64,
    /// Delete downloaded/uploaded media once a task reaches a terminal state.
    pub delete_temp_files_after_processing: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 2,
            status_check_interval_seconds: 3,
            delete_temp_files_after_processing: true,
        }
    }
}

/// Media download and temp-file configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MediaConfig {
    /// Directory under which all transient media files live.
    pub temp_dir: PathBuf,
    /// Maximum accepted media size in bytes.
    pub max_file_size_bytes: u64,
    /// Streaming download chunk size in bytes.
    pub download_chunk_size: usize,
    /// Per-request retry attempts at the HTTP client layer.
    pub request_retry_attempts: u32,
    /// Bytes requested by the pre-download ranged probe.
    pub probe_bytes: u64,
    /// Per-platform request headers, matched by URL substring.
    #[serde(default)]
    pub platform_headers: Vec<PlatformHeaders>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("./temp_files"),
            max_file_size_bytes: 2 * 1024 * 1024 * 1024,
            download_chunk_size: 1024 * 1024,
            request_retry_attempts: 3,
            probe_bytes: 1024,
            platform_headers: Vec::new(),
        }
    }
}

/// Request headers attached when the media URL contains a marker substring.
///
/// Some platforms refuse downloads without a Referer/Origin pair; the table
/// is plain configuration, not core logic.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlatformHeaders {
    /// Substring matched against the media URL.
    pub url_contains: String,
    /// Referer header value.
    pub referer: Option<String>,
    /// Origin header value.
    pub origin: Option<String>,
}

/// Callback delivery configuration.
///
/// Delivery is at-least-once with a recorded outcome; these knobs bound the
/// retry loop, they do not change the recording contract.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CallbackConfig {
    /// Connect+read timeout for one POST attempt, in seconds.
    pub request_timeout_seconds: u64,
    /// Total attempts per callback.
    pub retry_attempts: u32,
    /// Fixed wait between attempts, in seconds.
    pub retry_delay_seconds: u64,
    /// Recorded response bodies are truncated to this many bytes.
    pub max_message_length: usize,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 10,
            retry_attempts: 3,
            retry_delay_seconds: 2,
            max_message_length: 512,
        }
    }
}

/// General runtime options.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    /// Public base URL used to build each task's `output_url`.
    pub base_url: String,
    /// Visible GPU count override; -1 auto-detects from the environment.
    pub gpu_count: i32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            gpu_count: -1,
        }
    }
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default();
        assert_eq!(config.pool.engine, "faster_whisper");
        assert_eq!(config.pool.min_size, 1);
        assert_eq!(config.processor.max_concurrent_tasks, 2);
        assert!(config.processor.delete_temp_files_after_processing);
        assert_eq!(config.callback.retry_attempts, 3);
        assert_eq!(config.callback.max_message_length, 512);
    }

    #[test]
    fn test_media_config_defaults() {
        let media = MediaConfig::default();
        assert_eq!(media.max_file_size_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(media.download_chunk_size, 1024 * 1024);
        assert!(media.platform_headers.is_empty());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();

        assert!(toml_str.contains("[store]"));
        assert!(toml_str.contains("[pool]"));
        assert!(toml_str.contains("[pool.engine_params]"));
        assert!(toml_str.contains("[processor]"));
        assert!(toml_str.contains("[callback]"));
    }

    #[test]
    fn test_platform_headers_roundtrip() {
        let mut config = Config::default();
        config.media.platform_headers.push(PlatformHeaders {
            url_contains: "douyin".to_string(),
            referer: Some("https://www.douyin.com/".to_string()),
            origin: Some("https://www.douyin.com".to_string()),
        });
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.media.platform_headers, config.media.platform_headers);
    }
}

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use builder::TestConfigBuilder;
pub use service::{ConfigService, ProductionConfigService};
pub use validator::validate_config;
