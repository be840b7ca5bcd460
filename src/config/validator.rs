//! High-level configuration validation.
//!
//! Called once at load time; rejects configurations the runtime could only
//! fail on later, with a message naming the offending key.

use crate::config::Config;
use crate::error::WhisperdError;
use crate::Result;
use url::Url;

/// Engine names the pool knows how to construct.
pub const KNOWN_ENGINES: &[&str] = &["openai_whisper", "faster_whisper"];

/// Validate a full configuration.
///
/// # Errors
///
/// Returns a [`WhisperdError::Config`] naming the first invalid value.
pub fn validate_config(config: &Config) -> Result<()> {
    if !KNOWN_ENGINES.contains(&config.pool.engine.as_str()) {
        return Err(WhisperdError::config(format!(
            "pool.engine must be one of {:?}, got '{}'",
            KNOWN_ENGINES, config.pool.engine
        )));
    }
    if config.pool.min_size == 0 {
        return Err(WhisperdError::config("pool.min_size must be at least 1"));
    }
    if config.pool.min_size > config.pool.max_size {
        return Err(WhisperdError::config(format!(
            "pool.min_size ({}) cannot be greater than pool.max_size ({})",
            config.pool.min_size, config.pool.max_size
        )));
    }
    if config.pool.max_instances_per_gpu == 0 {
        return Err(WhisperdError::config(
            "pool.max_instances_per_gpu must be at least 1",
        ));
    }
    if config.pool.acquire_timeout_seconds == 0 {
        return Err(WhisperdError::config(
            "pool.acquire_timeout_seconds must be positive",
        ));
    }

    if config.processor.max_concurrent_tasks == 0 {
        return Err(WhisperdError::config(
            "processor.max_concurrent_tasks must be at least 1",
        ));
    }
    if config.processor.status_check_interval_seconds == 0 {
        return Err(WhisperdError::config(
            "processor.status_check_interval_seconds must be positive",
        ));
    }

    if config.media.max_file_size_bytes == 0 {
        return Err(WhisperdError::config(
            "media.max_file_size_bytes must be positive",
        ));
    }
    if config.media.download_chunk_size == 0 {
        return Err(WhisperdError::config(
            "media.download_chunk_size must be positive",
        ));
    }

    if config.callback.retry_attempts == 0 {
        return Err(WhisperdError::config(
            "callback.retry_attempts must be at least 1",
        ));
    }
    if config.callback.max_message_length == 0 {
        return Err(WhisperdError::config(
            "callback.max_message_length must be positive",
        ));
    }

    Url::parse(&config.general.base_url).map_err(|e| {
        WhisperdError::config(format!(
            "general.base_url is not a valid URL ('{}'): {}",
            config.general.base_url, e
        ))
    })?;

    Url::parse(&config.pool.engine_params.base_url).map_err(|e| {
        WhisperdError::config(format!(
            "pool.engine_params.base_url is not a valid URL ('{}'): {}",
            config.pool.engine_params.base_url, e
        ))
    })?;

    Ok(())
}
