//! Bounded, device-aware pool of engine handles.
//!
//! Engine handles are expensive to create and exclusive to one caller at a
//! time. The pool owns at most `max_size` of them, hands them out FIFO,
//! grows on demand up to the cap, and destroys surplus or unhealthy
//! handles on return.
//!
//! Locking layout: the semaphore counts free handles and gates
//! acquisition; `state` protects the size counters; `resize_lock`
//! serializes every size mutation so concurrent growth cannot overshoot
//! `max_size`. Handles are created strictly one at a time to avoid
//! concurrent download contention on the model-weight cache.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::core::engine::{EngineFactory, SpeechEngine};
use crate::error::WhisperdError;
use crate::Result;

pub mod device;

use device::{allocate_device, normalize_max_size, visible_gpu_count, Device};

/// How [`ModelPool::acquire`] behaves when no handle is immediately free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStrategy {
    /// Wait for a free handle; on timeout, grow once if below the cap.
    Existing,
    /// Grow first if below the cap, then wait as `Existing`.
    Dynamic,
}

/// One pooled engine instance.
pub struct ModelHandle {
    id: Uuid,
    engine: Box<dyn SpeechEngine>,
    created_at: std::time::Instant,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl ModelHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The engine bound to this handle.
    pub fn engine(&self) -> &dyn SpeechEngine {
        self.engine.as_ref()
    }

    /// Age of the handle since creation.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

struct PoolState {
    current_size: usize,
    min_size: usize,
    max_size: usize,
}

/// Bounded pool of [`ModelHandle`]s.
pub struct ModelPool {
    factory: Arc<dyn EngineFactory>,
    free: Mutex<VecDeque<ModelHandle>>,
    available: Arc<Semaphore>,
    state: Mutex<PoolState>,
    resize_lock: Mutex<()>,
    gpu_count: usize,
    max_instances_per_gpu: usize,
    health_check_enabled: bool,
    acquire_timeout: Duration,
    init_target: usize,
    next_instance: AtomicUsize,
}

impl std::fmt::Debug for ModelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPool")
            .field("gpu_count", &self.gpu_count)
            .field("max_instances_per_gpu", &self.max_instances_per_gpu)
            .field("health_check_enabled", &self.health_check_enabled)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("init_target", &self.init_target)
            .finish()
    }
}

impl ModelPool {
    /// Construct a pool from configuration.
    ///
    /// The requested `max_size` is clamped against the visible topology;
    /// the adjustment is logged. Construction fails when `min_size` exceeds
    /// the clamped maximum.
    pub fn new(
        config: &PoolConfig,
        gpu_count_override: i32,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self> {
        let gpu_count = visible_gpu_count(gpu_count_override);
        let cpu_threads = num_cpus::get();
        let max_size = normalize_max_size(
            config.max_size,
            gpu_count,
            config.max_instances_per_gpu,
            cpu_threads,
        );
        if max_size != config.max_size {
            warn!(
                "pool max_size adjusted from {} to {} ({} GPU(s), {} CPU threads)",
                config.max_size, max_size, gpu_count, cpu_threads
            );
        }
        if config.min_size > max_size {
            return Err(WhisperdError::config(format!(
                "pool.min_size ({}) cannot be greater than effective max_size ({})",
                config.min_size, max_size
            )));
        }

        let init_target = if config.init_with_max_size {
            max_size
        } else {
            config.min_size
        };

        info!(
            "model pool configured: engine={} min={} max={} gpus={} init_target={}",
            factory.engine_name(),
            config.min_size,
            max_size,
            gpu_count,
            init_target
        );

        Ok(Self {
            factory,
            free: Mutex::new(VecDeque::new()),
            available: Arc::new(Semaphore::new(0)),
            state: Mutex::new(PoolState {
                current_size: 0,
                min_size: config.min_size,
                max_size,
            }),
            resize_lock: Mutex::new(()),
            gpu_count,
            max_instances_per_gpu: config.max_instances_per_gpu,
            health_check_enabled: config.health_check_enabled,
            acquire_timeout: Duration::from_secs(config.acquire_timeout_seconds),
            init_target,
            next_instance: AtomicUsize::new(0),
        })
    }

    /// Engine name this pool produces handles for.
    pub fn engine_name(&self) -> &'static str {
        self.factory.engine_name()
    }

    /// Populate the pool with its initial handles, one at a time.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.resize_lock.lock().await;
        loop {
            {
                let state = self.state.lock().await;
                if state.current_size >= self.init_target {
                    break;
                }
            }
            self.create_into_pool().await?;
        }
        info!(
            "model pool initialized with {} handle(s)",
            self.init_target
        );
        Ok(())
    }

    async fn create_handle(&self) -> Result<ModelHandle> {
        let index = self.next_instance.fetch_add(1, Ordering::SeqCst);
        let allocation = allocate_device(index, self.gpu_count);
        debug!(
            "creating {} handle #{} on {} ({})",
            self.factory.engine_name(),
            index,
            allocation.device,
            allocation.compute_type.as_str()
        );
        let engine = self.factory.create(allocation).await?;
        Ok(ModelHandle {
            id: Uuid::new_v4(),
            engine,
            created_at: std::time::Instant::now(),
        })
    }

    /// Create one handle and put it into the free queue.
    ///
    /// Caller must hold `resize_lock`.
    async fn create_into_pool(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.current_size >= state.max_size {
                return Ok(());
            }
            state.current_size += 1;
        }
        match self.create_handle().await {
            Ok(handle) => {
                self.free.lock().await.push_back(handle);
                self.available.add_permits(1);
                info!("model handle created and added to the pool");
                Ok(())
            }
            Err(e) => {
                self.state.lock().await.current_size -= 1;
                Err(e)
            }
        }
    }

    /// Acquire a handle, waiting up to `timeout` (pool default when `None`).
    ///
    /// Waiters are served FIFO. On timeout the pool grows once if below the
    /// cap; otherwise the call fails with [`WhisperdError::PoolExhausted`].
    pub async fn acquire(
        &self,
        timeout: Option<Duration>,
        strategy: AcquireStrategy,
    ) -> Result<ModelHandle> {
        let timeout = timeout.unwrap_or(self.acquire_timeout);

        if strategy == AcquireStrategy::Dynamic {
            let _guard = self.resize_lock.lock().await;
            self.create_into_pool().await?;
        }

        match tokio::time::timeout(timeout, self.available.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                let handle = self
                    .free
                    .lock()
                    .await
                    .pop_front()
                    .ok_or_else(|| WhisperdError::store("pool permit without free handle"))?;
                debug!("model handle {} acquired from pool", handle.id);
                Ok(handle)
            }
            Ok(Err(_)) => Err(WhisperdError::store("model pool semaphore closed")),
            Err(_) => {
                let _guard = self.resize_lock.lock().await;
                {
                    let mut state = self.state.lock().await;
                    if state.current_size >= state.max_size {
                        error!("model pool exhausted and all handles are in use");
                        return Err(WhisperdError::PoolExhausted);
                    }
                    state.current_size += 1;
                }
                match self.create_handle().await {
                    Ok(handle) => {
                        warn!(
                            "model pool was empty; created handle {} due to pool exhaustion",
                            handle.id
                        );
                        Ok(handle)
                    }
                    Err(e) => {
                        self.state.lock().await.current_size -= 1;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Return a handle to the pool.
    ///
    /// Unhealthy handles and handles above the (possibly shrunk) cap are
    /// destroyed instead of being made available again.
    pub async fn release(&self, handle: ModelHandle) {
        if self.health_check_enabled && !handle.engine.health_check().await {
            warn!("unhealthy model handle {} detected and destroyed", handle.id);
            self.destroy(handle).await;
            return;
        }

        let over_cap = {
            let state = self.state.lock().await;
            state.current_size > state.max_size
        };
        if over_cap {
            debug!("pool above cap; destroying returned handle {}", handle.id);
            self.destroy(handle).await;
            return;
        }

        debug!("model handle {} returned to the pool", handle.id);
        self.free.lock().await.push_back(handle);
        self.available.add_permits(1);
    }

    /// Destroy a handle and shrink the live count.
    async fn destroy(&self, handle: ModelHandle) {
        let device = *handle.engine.allocation();
        handle.engine.shutdown().await;
        if let Device::Cuda(_) = device.device {
            info!("released CUDA memory for destroyed handle on {}", device.device);
        }
        let mut state = self.state.lock().await;
        state.current_size = state.current_size.saturating_sub(1);
        info!(
            "model handle destroyed, updated pool size: {}",
            state.current_size
        );
    }

    /// Resize the pool bounds, growing to `new_min` or shrinking idle
    /// handles down to `new_max`.
    pub async fn resize(&self, new_min: usize, new_max: usize) -> Result<()> {
        if new_min > new_max {
            return Err(WhisperdError::config(
                "new_min_size cannot be greater than new_max_size",
            ));
        }
        let _guard = self.resize_lock.lock().await;

        let clamped_max = normalize_max_size(
            new_max,
            self.gpu_count,
            self.max_instances_per_gpu,
            num_cpus::get(),
        );
        if clamped_max != new_max {
            warn!(
                "resize max_size adjusted from {} to {} for topology",
                new_max, clamped_max
            );
        }

        {
            let mut state = self.state.lock().await;
            state.min_size = new_min.min(clamped_max);
            state.max_size = clamped_max;
        }

        // Grow to the new minimum.
        loop {
            let (current, min) = {
                let state = self.state.lock().await;
                (state.current_size, state.min_size)
            };
            if current >= min {
                break;
            }
            self.create_into_pool().await?;
        }

        // Shrink by draining idle handles; busy handles are destroyed on
        // return by the over-cap check in `release`.
        loop {
            let over = {
                let state = self.state.lock().await;
                state.current_size > state.max_size
            };
            if !over {
                break;
            }
            let handle = {
                if self.available.try_acquire().map(|p| p.forget()).is_err() {
                    break;
                }
                self.free.lock().await.pop_front()
            };
            match handle {
                Some(handle) => self.destroy(handle).await,
                None => break,
            }
        }

        let state = self.state.lock().await;
        info!(
            "model pool resized: min={} max={} current={}",
            state.min_size, state.max_size, state.current_size
        );
        Ok(())
    }

    /// Number of currently existing handles (free + in use).
    pub async fn current_size(&self) -> usize {
        self.state.lock().await.current_size
    }

    /// Effective maximum number of handles.
    pub async fn max_size(&self) -> usize {
        self.state.lock().await.max_size
    }

    /// Number of handles free for immediate acquisition.
    pub fn idle(&self) -> usize {
        self.available.available_permits()
    }
}

static GLOBAL_POOL: OnceCell<Arc<ModelPool>> = OnceCell::new();

/// Install the process-wide pool instance.
///
/// Exactly one pool exists per process; a second call is rejected.
pub fn init_global(pool: Arc<ModelPool>) -> Result<()> {
    GLOBAL_POOL
        .set(pool)
        .map_err(|_| WhisperdError::config("model pool already initialized"))
}

/// The process-wide pool, if one was installed.
pub fn global() -> Option<Arc<ModelPool>> {
    GLOBAL_POOL.get().cloned()
}
