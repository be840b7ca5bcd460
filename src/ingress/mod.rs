//! Ingress adapter: turns validated submissions into queued tasks.
//!
//! This is the thin seam the HTTP layer calls into. It validates the
//! submission shape (exactly one media input), persists uploads into the
//! temp root with their probed attributes, creates the queued task, and
//! stamps its `output_url`. Everything heavier happens in the processor.

use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use url::Url;

use crate::core::task::{DecodeOptions, NewTask, Task, TaskPriority, TaskStatus, TaskType, TaskUpdate};
use crate::error::WhisperdError;
use crate::services::files::TempFiles;
use crate::services::media::probe;
use crate::store::TaskStore;
use crate::Result;

/// External submission shape accepted by the service.
///
/// Decode options ride at the top level of the submission and are stored
/// verbatim on the task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskSubmission {
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    /// BCP-47-ish language code; empty means auto-detect.
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(flatten)]
    pub decode_options: DecodeOptions,
}

/// An uploaded media file: raw bytes plus the caller's file name.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Accepts submissions and persists them as queued tasks.
pub struct TaskIngress {
    store: Arc<dyn TaskStore>,
    temp: Arc<TempFiles>,
    base_url: String,
}

impl TaskIngress {
    pub fn new(store: Arc<dyn TaskStore>, temp: Arc<TempFiles>, base_url: String) -> Self {
        Self {
            store,
            temp,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Validate a submission and persist it as a queued task.
    ///
    /// Exactly one of `upload` and `submission.file_url` must be given.
    /// Uploads are stored eagerly with probed size and duration; URL tasks
    /// are fetched lazily by the processor.
    pub async fn submit(
        &self,
        submission: TaskSubmission,
        upload: Option<UploadedFile>,
    ) -> Result<Task> {
        let file_url = submission
            .file_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        match (&upload, &file_url) {
            (Some(_), Some(_)) => {
                return Err(WhisperdError::invalid_submission(
                    "provide either an uploaded file or a file_url, not both",
                ));
            }
            (None, None) => {
                return Err(WhisperdError::invalid_submission(
                    "either an uploaded file or a file_url is required",
                ));
            }
            _ => {}
        }
        if let Some(url) = &file_url {
            Url::parse(url)?;
        }
        if let Some(callback_url) = submission
            .callback_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            Url::parse(callback_url)?;
        }

        let mut new_task = NewTask {
            priority: submission.priority,
            task_type: submission.task_type,
            platform: submission.platform.clone(),
            decode_options: submission.decode_options.clone(),
            callback_url: submission
                .callback_url
                .clone()
                .filter(|s| !s.trim().is_empty()),
            language: submission.language.clone().filter(|s| !s.is_empty()),
            file_url,
            ..NewTask::default()
        };

        if let Some(upload) = upload {
            let path = self
                .temp
                .save_bytes(&upload.bytes, &upload.file_name)
                .await?;
            let duration = match probe::probe_duration_async(&path).await {
                Ok(duration) => duration,
                Err(e) => {
                    self.temp.delete(&path).await;
                    return Err(e);
                }
            };
            new_task.file_size_bytes = Some(upload.bytes.len() as i64);
            new_task.file_duration = Some(duration);
            new_task.file_name = Some(upload.file_name);
            new_task.file_path = Some(path);
        }

        let id = self.store.create(new_task).await?;
        let output_url = format!("{}/api/v1/tasks/{}", self.base_url, id);
        self.store
            .update(
                id,
                TaskUpdate {
                    output_url: Some(output_url),
                    ..TaskUpdate::default()
                },
            )
            .await?;

        let task = self
            .store
            .get(id)
            .await?
            .ok_or(WhisperdError::TaskNotFound(id))?;
        debug!("task {} accepted ({:?})", id, task.task_type);
        Ok(task)
    }
}

/// HTTP status code the read endpoints answer with for a task state.
///
/// Queued and processing tasks are `202 Accepted`; completed is `200`;
/// failed is `500` with the task's `error_message` in the body. A missing
/// task is `404` and an unreachable store `503`, handled at the HTTP layer.
pub fn http_status_for(status: TaskStatus) -> u16 {
    match status {
        TaskStatus::Queued | TaskStatus::Processing => 202,
        TaskStatus::Completed => 200,
        TaskStatus::Failed => 500,
    }
}

/// Static health payload for the HTTP layer's liveness endpoint.
pub fn health() -> Value {
    json!({ "status": "ok" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaConfig, StoreConfig};
    use crate::store::SqliteTaskStore;
    use tempfile::TempDir;

    async fn ingress(dir: &TempDir) -> TaskIngress {
        let store = SqliteTaskStore::connect(&StoreConfig {
            database_path: ":memory:".into(),
            ..StoreConfig::default()
        })
        .await
        .unwrap();
        let temp = TempFiles::new(&MediaConfig {
            temp_dir: dir.path().to_path_buf(),
            ..MediaConfig::default()
        })
        .unwrap();
        TaskIngress::new(
            Arc::new(store),
            Arc::new(temp),
            "http://127.0.0.1:8000/".to_string(),
        )
    }

    fn wav_bytes(seconds: f64) -> Vec<u8> {
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

    #[tokio::test]
    async fn test_submit_requires_exactly_one_input() {
        let dir = TempDir::new().unwrap();
        let ingress = ingress(&dir).await;

        let err = ingress
            .submit(TaskSubmission::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("required"));

        let both = TaskSubmission {
            file_url: Some("https://host/a.mp3".to_string()),
            ..TaskSubmission::default()
        };
        let upload = UploadedFile {
            file_name: "a.wav".to_string(),
            bytes: wav_bytes(0.2),
        };
        let err = ingress.submit(both, Some(upload)).await.unwrap_err();
        assert!(err.to_string().contains("not both"));
    }

    #[tokio::test]
    async fn test_submit_rejects_malformed_url() {
        let dir = TempDir::new().unwrap();
        let ingress = ingress(&dir).await;
        let submission = TaskSubmission {
            file_url: Some("not a url".to_string()),
            ..TaskSubmission::default()
        };
        assert!(ingress.submit(submission, None).await.is_err());
    }

    #[tokio::test]
    async fn test_submit_upload_populates_attributes() {
        let dir = TempDir::new().unwrap();
        let ingress = ingress(&dir).await;
        let bytes = wav_bytes(1.0);
        let size = bytes.len() as i64;
        let task = ingress
            .submit(
                TaskSubmission {
                    language: Some("en".to_string()),
                    ..TaskSubmission::default()
                },
                Some(UploadedFile {
                    file_name: "speech.wav".to_string(),
                    bytes,
                }),
            )
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.file_name.as_deref(), Some("speech.wav"));
        assert_eq!(task.file_size_bytes, Some(size));
        assert!(task.file_duration.unwrap() > 0.9);
        assert!(task.file_path.is_some());
        assert_eq!(task.language.as_deref(), Some("en"));
        assert_eq!(
            task.output_url.as_deref(),
            Some(format!("http://127.0.0.1:8000/api/v1/tasks/{}", task.id).as_str())
        );
    }

    #[tokio::test]
    async fn test_submit_url_task_is_lazy() {
        let dir = TempDir::new().unwrap();
        let ingress = ingress(&dir).await;
        let task = ingress
            .submit(
                TaskSubmission {
                    file_url: Some("https://host/clip.mp4".to_string()),
                    priority: TaskPriority::High,
                    ..TaskSubmission::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(task.priority, TaskPriority::High);
        assert!(task.file_path.is_none());
        assert_eq!(task.file_url.as_deref(), Some("https://host/clip.mp4"));
        assert!(task.file_duration.is_none());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(http_status_for(TaskStatus::Queued), 202);
        assert_eq!(http_status_for(TaskStatus::Processing), 202);
        assert_eq!(http_status_for(TaskStatus::Completed), 200);
        assert_eq!(http_status_for(TaskStatus::Failed), 500);
    }

    #[test]
    fn test_health_payload() {
        assert_eq!(health()["status"], "ok");
    }

    #[test]
    fn test_submission_deserialization_defaults() {
        let submission: TaskSubmission =
            serde_json::from_str(r#"{"file_url": "https://h/a.mp3"}"#).unwrap();
        assert_eq!(submission.task_type, TaskType::Transcribe);
        assert_eq!(submission.priority, TaskPriority::Normal);
        assert_eq!(submission.decode_options.no_speech_threshold, 0.6);
    }
}
