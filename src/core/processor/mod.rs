//! The background task processor.
//!
//! A dedicated OS thread runs its own single-threaded tokio runtime with
//! five cooperating workers connected by bounded queues:
//!
//! 1. **fetcher**: claims queued tasks from the store on request,
//! 2. **driver**: paces claiming against free capacity and spawns the
//!    per-task pipeline,
//! 3. **updater**: the single writer serializing task mutations into the
//!    store,
//! 4. **cleaner**: deletes temp media after a task finishes,
//! 5. **callback**: delivers result callbacks.
//!
//! The processor owns its own store handle, created inside its runtime; it
//! shares no connections with the ingress side. The driver never lets more
//! than `max_concurrent` tasks leave the queued state at once, and
//! `max_concurrent` is clamped to the model pool's capacity at startup so
//! the queue can never outrun the pool.

use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::config::ProcessorConfig;
use crate::core::pool::ModelPool;
use crate::core::task::{Task, TaskUpdate};
use crate::error::WhisperdError;
use crate::services::callback::CallbackDispatcher;
use crate::services::files::TempFiles;
use crate::services::media::MediaFetcher;
use crate::store::TaskStore;
use crate::Result;

mod pipeline;

pub use pipeline::PipelineContext;

/// A pending store mutation for one task.
#[derive(Debug)]
pub struct UpdateMessage {
    pub task_id: i64,
    pub update: TaskUpdate,
}

/// Deferred store construction so the connection pool is created inside
/// the processor's own runtime.
pub type StoreFactory =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<Arc<dyn TaskStore>>> + Send>;

/// Control handle for a running processor.
pub struct ProcessorHandle {
    shutdown_tx: watch::Sender<bool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ProcessorHandle {
    /// Signal shutdown, wait for in-flight tasks to drain, and join the
    /// processor thread.
    pub fn shutdown(mut self) {
        info!("task processor shutdown requested");
        let _ = self.shutdown_tx.send(true);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("task processor thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ProcessorHandle {
    fn drop(&mut self) {
        // Signal only; join happens in `shutdown` where blocking is safe.
        let _ = self.shutdown_tx.send(true);
    }
}

/// The continuous execution engine turning queued tasks into terminal ones.
pub struct TaskProcessor;

impl TaskProcessor {
    /// Start the processor on its own thread.
    pub fn start(
        config: ProcessorConfig,
        store_factory: StoreFactory,
        pool: Arc<ModelPool>,
        fetcher: Arc<MediaFetcher>,
        temp: Arc<TempFiles>,
        dispatcher: Arc<CallbackDispatcher>,
    ) -> Result<ProcessorHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let thread = std::thread::Builder::new()
            .name("whisperd-processor".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("failed to build processor runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(run(
                    config,
                    store_factory,
                    pool,
                    fetcher,
                    temp,
                    dispatcher,
                    shutdown_rx,
                ));
            })
            .map_err(|e| {
                WhisperdError::CommandExecution(format!("failed to spawn processor thread: {}", e))
            })?;

        Ok(ProcessorHandle {
            shutdown_tx,
            thread: Some(thread),
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    config: ProcessorConfig,
    store_factory: StoreFactory,
    pool: Arc<ModelPool>,
    fetcher: Arc<MediaFetcher>,
    temp: Arc<TempFiles>,
    dispatcher: Arc<CallbackDispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let store = match store_factory().await {
        Ok(store) => store,
        Err(e) => {
            error!("processor could not open its task store: {}", e);
            return;
        }
    };

    let pool_cap = pool.max_size().await;
    let max_concurrent = config.max_concurrent_tasks.min(pool_cap).max(1);
    if max_concurrent != config.max_concurrent_tasks {
        warn!(
            "max_concurrent_tasks clamped from {} to {} (pool capacity {})",
            config.max_concurrent_tasks, max_concurrent, pool_cap
        );
    }

    let (fetch_tx, fetch_rx) = mpsc::channel::<usize>(1);
    let (processing_tx, mut processing_rx) = mpsc::channel::<Vec<Task>>(1);
    let (update_tx, update_rx) = mpsc::channel::<UpdateMessage>(64);
    let (cleanup_tx, cleanup_rx) = mpsc::channel::<PathBuf>(64);
    let (callback_tx, callback_rx) = mpsc::channel::<i64>(64);

    let fetcher_worker = tokio::spawn(fetch_worker(
        Arc::clone(&store),
        fetch_rx,
        processing_tx,
        max_concurrent,
    ));
    let update_worker = tokio::spawn(update_worker(Arc::clone(&store), update_rx));
    let cleanup_worker = tokio::spawn(cleanup_worker(
        Arc::clone(&temp),
        cleanup_rx,
        config.delete_temp_files_after_processing,
    ));
    let callback_worker = tokio::spawn(callback_worker(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        callback_rx,
    ));

    let ctx = Arc::new(PipelineContext {
        pool: Arc::clone(&pool),
        fetcher,
        engine_name: pool.engine_name().to_string(),
        update_tx: update_tx.clone(),
        cleanup_tx: cleanup_tx.clone(),
        callback_tx: callback_tx.clone(),
    });

    let limiter = Arc::new(Semaphore::new(max_concurrent));
    let interval = Duration::from_secs(config.status_check_interval_seconds);
    info!(
        "task processor started (max_concurrent={}, interval={:?})",
        max_concurrent, interval
    );

    // Driver loop: gather free capacity, ask the fetcher to claim that
    // much, then hand each claimed task one capacity permit. A task claim
    // is only ever requested for capacity the driver already holds, so
    // tasks in the processing state never exceed `max_concurrent`.
    'driver: loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let first_permit = tokio::select! {
            permit = limiter.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break 'driver,
            },
            _ = shutdown_rx.changed() => continue 'driver,
        };
        let mut permits = vec![first_permit];
        while let Ok(extra) = limiter.clone().try_acquire_owned() {
            permits.push(extra);
        }
        if *shutdown_rx.borrow() {
            break;
        }

        if fetch_tx.send(permits.len()).await.is_err() {
            break;
        }
        // Prefer a claimed batch over the shutdown signal so claimed tasks
        // are dispatched rather than stranded in the processing state.
        let batch = tokio::select! {
            biased;
            batch = processing_rx.recv() => match batch {
                Some(batch) => batch,
                None => break 'driver,
            },
            _ = shutdown_rx.changed() => continue 'driver,
        };

        if batch.is_empty() {
            drop(permits);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {}
            }
            continue;
        }

        for task in batch {
            let permit = match permits.pop() {
                Some(permit) => permit,
                None => match limiter.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break 'driver,
                },
            };
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                pipeline::process_task(ctx, task).await;
                drop(permit);
            });
        }
        drop(permits);
    }

    // Drain: dispatch any batch the fetcher claimed before the shutdown
    // landed, wait for every in-flight pipeline to finish, then let the
    // queue workers run dry and exit.
    debug!("task processor draining in-flight work");
    drop(fetch_tx);
    processing_rx.close();
    while let Some(batch) = processing_rx.recv().await {
        for task in batch {
            let permit = match limiter.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                pipeline::process_task(ctx, task).await;
                drop(permit);
            });
        }
    }
    drop(processing_rx);
    let _ = limiter.acquire_many(max_concurrent as u32).await;
    drop(ctx);
    drop(update_tx);
    drop(cleanup_tx);
    drop(callback_tx);

    let _ = fetcher_worker.await;
    let _ = update_worker.await;
    let _ = cleanup_worker.await;
    let _ = callback_worker.await;
    info!("task processor stopped");
}

/// Claims queued tasks on request from the driver.
async fn fetch_worker(
    store: Arc<dyn TaskStore>,
    mut fetch_rx: mpsc::Receiver<usize>,
    processing_tx: mpsc::Sender<Vec<Task>>,
    max_concurrent: usize,
) {
    while let Some(requested) = fetch_rx.recv().await {
        let n = requested.min(max_concurrent);
        let batch = match store.claim_queued(n).await {
            Ok(batch) => batch,
            Err(e) => {
                error!("error while pulling tasks from the store: {}", e);
                Vec::new()
            }
        };
        if let Err(e) = processing_tx.send(batch).await {
            if !e.0.is_empty() {
                warn!(
                    "shutdown raced a claim; {} task(s) left in processing",
                    e.0.len()
                );
            }
            break;
        }
    }
    debug!("fetch worker exited");
}

/// Serializes all task mutations into the store.
///
/// This channel is the single writer for result and error fields; store
/// latency never sits on the transcription path, and per-task updates
/// apply in the order they were enqueued.
async fn update_worker(store: Arc<dyn TaskStore>, mut update_rx: mpsc::Receiver<UpdateMessage>) {
    while let Some(message) = update_rx.recv().await {
        match store.update(message.task_id, message.update).await {
            Ok(true) => {}
            Ok(false) => {
                // Deleted while processing; the work is simply discarded.
                debug!(
                    "task {} no longer exists, skipping update",
                    message.task_id
                );
            }
            Err(e) => error!("failed to update task {}: {}", message.task_id, e),
        }
    }
    debug!("update worker exited");
}

/// Deletes task media once the pipeline is done with it.
async fn cleanup_worker(temp: Arc<TempFiles>, mut cleanup_rx: mpsc::Receiver<PathBuf>, enabled: bool) {
    while let Some(path) = cleanup_rx.recv().await {
        if enabled {
            temp.delete(&path).await;
        } else {
            debug!("keeping temporary file: {}", path.display());
        }
    }
    debug!("cleanup worker exited");
}

/// Drains the callback queue.
async fn callback_worker(
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<CallbackDispatcher>,
    mut callback_rx: mpsc::Receiver<i64>,
) {
    while let Some(task_id) = callback_rx.recv().await {
        if let Err(e) = dispatcher.notify(store.as_ref(), task_id).await {
            error!("failed to record callback for task {}: {}", task_id, e);
        }
    }
    debug!("callback worker exited");
}
