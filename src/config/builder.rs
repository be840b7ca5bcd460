//! Builder for constructing configurations in tests.
//!
//! Integration suites need configurations pointing at temp directories,
//! in-memory databases and wiremock servers; the builder keeps those
//! adjustments in one place.

use crate::config::Config;
use std::path::Path;

/// Fluent builder over [`Config`] for test scenarios.
///
/// # Examples
///
/// ```rust
/// use whisperd::config::TestConfigBuilder;
///
/// let config = TestConfigBuilder::new()
///     .with_engine("openai_whisper")
///     .with_pool_size(1, 2)
///     .with_in_memory_store()
///     .build();
/// assert_eq!(config.pool.max_size, 2);
/// ```
#[derive(Default)]
pub struct TestConfigBuilder {
    config: Config,
}

impl TestConfigBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Select the engine by name.
    pub fn with_engine(mut self, engine: &str) -> Self {
        self.config.pool.engine = engine.to_string();
        self
    }

    /// Set pool bounds.
    pub fn with_pool_size(mut self, min_size: usize, max_size: usize) -> Self {
        self.config.pool.min_size = min_size;
        self.config.pool.max_size = max_size;
        self
    }

    /// Point the engine runtime at a mock server.
    pub fn with_engine_base_url(mut self, base_url: &str) -> Self {
        self.config.pool.engine_params.base_url = base_url.to_string();
        self
    }

    /// Use an in-memory SQLite database.
    pub fn with_in_memory_store(mut self) -> Self {
        self.config.store.database_path = ":memory:".into();
        self
    }

    /// Use the given temp directory for media files.
    pub fn with_temp_dir(mut self, dir: &Path) -> Self {
        self.config.media.temp_dir = dir.to_path_buf();
        self
    }

    /// Cap accepted media size.
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.config.media.max_file_size_bytes = bytes;
        self
    }

    /// Set processor concurrency.
    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.config.processor.max_concurrent_tasks = n;
        self
    }

    /// Force the visible GPU count instead of auto-detection.
    pub fn with_gpu_count(mut self, count: i32) -> Self {
        self.config.general.gpu_count = count;
        self
    }

    /// Shorten the idle poll interval for fast tests.
    pub fn with_status_check_interval(mut self, seconds: u64) -> Self {
        self.config.processor.status_check_interval_seconds = seconds;
        self
    }

    /// Finalize the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}
