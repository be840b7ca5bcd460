//! Per-task pipeline: resolve media, acquire a model handle, transcribe,
//! and enqueue the terminal update.
//!
//! Every failure path converts into a `Failed` update; nothing propagates
//! out of the pipeline. The model handle is always returned to the pool,
//! and a cleanup and a callback work item are always enqueued.

use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::core::engine::EngineOutput;
use crate::core::pool::{AcquireStrategy, ModelPool};
use crate::core::processor::UpdateMessage;
use crate::core::task::{Task, TaskUpdate, TranscriptionResult};
use crate::error::WhisperdError;
use crate::services::media::MediaFetcher;
use crate::Result;

/// Shared dependencies for pipeline invocations.
pub struct PipelineContext {
    pub pool: Arc<ModelPool>,
    pub fetcher: Arc<MediaFetcher>,
    pub engine_name: String,
    pub update_tx: mpsc::Sender<UpdateMessage>,
    pub cleanup_tx: mpsc::Sender<PathBuf>,
    pub callback_tx: mpsc::Sender<i64>,
}

impl PipelineContext {
    async fn enqueue_update(&self, task_id: i64, update: TaskUpdate) {
        if self
            .update_tx
            .send(UpdateMessage { task_id, update })
            .await
            .is_err()
        {
            warn!("update queue closed; dropping update for task {}", task_id);
        }
    }
}

/// Run one task to a terminal state.
pub(super) async fn process_task(ctx: Arc<PipelineContext>, task: Task) {
    let task_id = task.id;
    debug!(
        "processing queued task: id={} priority={:?} file={:?}",
        task_id, task.priority, task.file_name
    );

    // Record which engine owns this task before any real work happens.
    ctx.enqueue_update(
        task_id,
        TaskUpdate {
            engine_name: Some(ctx.engine_name.clone()),
            ..TaskUpdate::default()
        },
    )
    .await;

    let mut media_path = task.file_path.clone();
    match run_stages(&ctx, &task, &mut media_path).await {
        Ok(update) => {
            info!("task {} completed", task_id);
            ctx.enqueue_update(task_id, update).await;
        }
        Err(e) => {
            warn!("task {} failed: {}", task_id, e);
            ctx.enqueue_update(task_id, TaskUpdate::failed(e.to_string()))
                .await;
        }
    }

    // Cleanup and callback happen for every outcome.
    if let Some(path) = media_path {
        if ctx.cleanup_tx.send(path).await.is_err() {
            warn!("cleanup queue closed; task {} media not swept", task_id);
        }
    }
    if ctx.callback_tx.send(task_id).await.is_err() {
        warn!("callback queue closed; task {} callback skipped", task_id);
    }
}

async fn run_stages(
    ctx: &PipelineContext,
    task: &Task,
    media_path: &mut Option<PathBuf>,
) -> Result<TaskUpdate> {
    // Stage a: resolve the media file, downloading lazily for URL tasks.
    let (path, file_name, size_bytes, duration) = match &task.file_path {
        Some(path) => (
            path.clone(),
            task.file_name.clone(),
            task.file_size_bytes,
            task.file_duration,
        ),
        None => {
            let url = task.file_url.as_deref().ok_or_else(|| {
                WhisperdError::invalid_submission("task has neither file_path nor file_url")
            })?;
            let fetched = ctx.fetcher.download(url).await?;
            *media_path = Some(fetched.path.clone());
            (
                fetched.path,
                Some(fetched.file_name),
                Some(fetched.size_bytes),
                Some(fetched.duration_seconds),
            )
        }
    };

    // Stage b: acquire a model handle, blocking up to the pool timeout.
    let handle = ctx.pool.acquire(None, AcquireStrategy::Existing).await?;

    // Stage c/d: run the engine and time the call. The handle goes back to
    // the pool before the engine outcome is inspected.
    let task_start_time = Instant::now();
    let outcome = handle
        .engine()
        .transcribe(
            &path,
            task.task_type,
            task.language.as_deref(),
            &task.decode_options,
        )
        .await;
    let task_processing_time = task_start_time.elapsed().as_secs_f64();
    ctx.pool.release(handle).await;
    let output = outcome?;

    // Stage e: assemble the terminal update.
    let language = output.language.clone().or_else(|| task.language.clone());
    let result = into_result(output);
    Ok(TaskUpdate {
        status: Some(crate::core::task::TaskStatus::Completed),
        language,
        result: Some(result),
        file_path: Some(path),
        file_name,
        file_size_bytes: size_bytes,
        file_duration: duration,
        task_processing_time: Some(task_processing_time),
        ..TaskUpdate::default()
    })
}

fn into_result(output: EngineOutput) -> TranscriptionResult {
    TranscriptionResult {
        text: output.text,
        segments: output.segments,
        info: output.info,
    }
}
