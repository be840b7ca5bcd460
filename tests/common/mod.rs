//! Shared helpers for integration tests: a scriptable mock engine, a
//! file-backed store both sides can open, and audio fixtures.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use whisperd::config::{
    CallbackConfig, MediaConfig, PoolConfig, ProcessorConfig, StoreConfig,
};
use whisperd::core::engine::{EngineFactory, EngineOutput, SpeechEngine};
use whisperd::core::pool::device::DeviceAllocation;
use whisperd::core::pool::ModelPool;
use whisperd::core::processor::{ProcessorHandle, StoreFactory, TaskProcessor};
use whisperd::core::task::{DecodeOptions, Task, TaskStatus, TaskType};
use whisperd::services::callback::CallbackDispatcher;
use whisperd::services::files::TempFiles;
use whisperd::services::media::MediaFetcher;
use whisperd::store::{SqliteTaskStore, TaskStore};

/// Engine stand-in that records execution order and concurrency, sleeps a
/// configurable amount, and fails on marked file names.
#[allow(dead_code)]
#[derive(Debug)]
pub struct MockEngineFactory {
    pub delay: Duration,
    pub executions: Arc<Mutex<Vec<String>>>,
    pub active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
    pub fail_markers: Vec<String>,
}

#[allow(dead_code)]
impl MockEngineFactory {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(50),
            executions: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            fail_markers: Vec::new(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Any task whose file name contains `marker` fails with "boom".
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_markers.push(marker.to_string());
        self
    }

    pub fn execution_order(&self) -> Vec<String> {
        self.executions.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct MockEngine {
    allocation: DeviceAllocation,
    delay: Duration,
    executions: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    fail_markers: Vec<String>,
}

#[async_trait]
impl SpeechEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn allocation(&self) -> &DeviceAllocation {
        &self.allocation
    }

    async fn transcribe(
        &self,
        path: &Path,
        _task_type: TaskType,
        language: Option<&str>,
        _options: &DecodeOptions,
    ) -> whisperd::Result<EngineOutput> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.executions.lock().unwrap().push(name.clone());

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail_markers.iter().any(|m| name.contains(m)) {
            return Err(whisperd::error::WhisperdError::engine("mock", "boom"));
        }

        let segments = vec![
            serde_json::json!({"id": 0, "start": 0.0, "end": 1.05, "text": " hello"}),
            serde_json::json!({"id": 1, "start": 1.05, "end": 2.1, "text": " world"}),
        ];
        let mut info = serde_json::Map::new();
        info.insert("language".to_string(), serde_json::json!("en"));
        info.insert("duration".to_string(), serde_json::json!(2.1));
        Ok(EngineOutput {
            text: "hello world".to_string(),
            segments,
            info,
            language: Some(language.unwrap_or("en").to_string()),
        })
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn shutdown(&self) {}
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    fn engine_name(&self) -> &'static str {
        "mock"
    }

    async fn create(
        &self,
        allocation: DeviceAllocation,
    ) -> whisperd::Result<Box<dyn SpeechEngine>> {
        Ok(Box::new(MockEngine {
            allocation,
            delay: self.delay,
            executions: Arc::clone(&self.executions),
            active: Arc::clone(&self.active),
            max_active: Arc::clone(&self.max_active),
            fail_markers: self.fail_markers.clone(),
        }))
    }
}

/// A fully wired test service over a file-backed store.
#[allow(dead_code)]
pub struct TestService {
    pub dir: TempDir,
    pub store_config: StoreConfig,
    pub store: Arc<dyn TaskStore>,
    pub temp: Arc<TempFiles>,
    pub factory: Arc<MockEngineFactory>,
    pub pool: Arc<ModelPool>,
    fetcher: Arc<MediaFetcher>,
    dispatcher: Arc<CallbackDispatcher>,
    processor_config: ProcessorConfig,
    pub handle: Option<ProcessorHandle>,
}

#[allow(dead_code)]
impl TestService {
    /// Wire everything except the processor, so tests can seed tasks with
    /// a deterministic order before claiming begins.
    pub async fn build(
        factory: MockEngineFactory,
        max_concurrent: usize,
        pool_max: usize,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let store_config = StoreConfig {
            database_path: dir.path().join("tasks.db"),
            ..StoreConfig::default()
        };
        let store: Arc<dyn TaskStore> = Arc::new(
            SqliteTaskStore::connect(&store_config).await.unwrap(),
        );

        let media_config = MediaConfig {
            temp_dir: dir.path().join("media"),
            ..MediaConfig::default()
        };
        let temp = Arc::new(TempFiles::new(&media_config).unwrap());
        let fetcher = Arc::new(MediaFetcher::new(media_config, Arc::clone(&temp)).unwrap());
        let dispatcher = Arc::new(
            CallbackDispatcher::new(CallbackConfig {
                retry_delay_seconds: 0,
                ..CallbackConfig::default()
            })
            .unwrap(),
        );

        let factory = Arc::new(factory);
        let pool_config = PoolConfig {
            min_size: 1,
            max_size: pool_max,
            acquire_timeout_seconds: 1,
            health_check_enabled: false,
            ..PoolConfig::default()
        };
        // Pretend there are plenty of GPUs so the topology clamp stays out
        // of the way of the requested pool size.
        let pool = Arc::new(ModelPool::new(&pool_config, 8, factory.clone()).unwrap());
        pool.initialize().await.unwrap();

        let processor_config = ProcessorConfig {
            max_concurrent_tasks: max_concurrent,
            status_check_interval_seconds: 1,
            delete_temp_files_after_processing: true,
        };

        Self {
            dir,
            store_config,
            store,
            temp,
            factory,
            pool,
            fetcher,
            dispatcher,
            processor_config,
            handle: None,
        }
    }

    /// Start the processor; it opens its own connection pool onto the same
    /// database file.
    pub fn launch(&mut self) {
        let factory_config = self.store_config.clone();
        let store_factory: StoreFactory = Box::new(move || {
            Box::pin(async move {
                let store = SqliteTaskStore::connect(&factory_config).await?;
                Ok(Arc::new(store) as Arc<dyn TaskStore>)
            })
        });

        let handle = TaskProcessor::start(
            self.processor_config.clone(),
            store_factory,
            Arc::clone(&self.pool),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.temp),
            Arc::clone(&self.dispatcher),
        )
        .unwrap();
        self.handle = Some(handle);
    }

    /// Build and immediately start.
    pub async fn start(
        factory: MockEngineFactory,
        max_concurrent: usize,
        pool_max: usize,
    ) -> Self {
        let mut service = Self::build(factory, max_concurrent, pool_max).await;
        service.launch();
        service
    }

    /// Write a small WAV fixture into the temp root and return its path.
    pub fn wav_fixture(&self, name: &str) -> PathBuf {
        let path = self.temp.root().join(name);
        write_wav(&path, 0.3);
        path
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
        }
    }
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Write a mono 16-bit WAV of roughly `seconds` to `path`.
#[allow(dead_code)]
pub fn write_wav(path: &Path, seconds: f64) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..(seconds * 8000.0) as usize {
        let t = i as f64 / 8000.0;
        let value = (t * 220.0 * std::f64::consts::TAU).sin();
        writer
            .write_sample((value * i16::MAX as f64 * 0.4) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
}

/// In-memory WAV bytes for upload tests.
#[allow(dead_code)]
pub fn wav_bytes(seconds: f64) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..(seconds * 8000.0) as usize {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Poll the store until the task reaches `status` or the deadline passes.
#[allow(dead_code)]
pub async fn wait_for_status(
    store: &Arc<dyn TaskStore>,
    id: i64,
    status: TaskStatus,
    timeout: Duration,
) -> Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(task) = store.get(id).await.unwrap() {
            if task.status == status {
                return task;
            }
            assert!(
                !task.status.is_terminal(),
                "task {} reached terminal {:?} while waiting for {:?} (error: {:?})",
                id,
                task.status,
                status,
                task.error_message
            );
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {} did not reach {:?} in time",
            id,
            status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
