//! Task entity and related value types.
//!
//! A [`Task`] is the central record of the service: one media file plus the
//! requested transcription parameters, persisted by the task store and
//! driven to a terminal state by the processor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::WhisperdError;

/// Lifecycle state of a task.
///
/// Transitions are monotonic: `Queued` -> `Processing` -> terminal
/// (`Completed` xor `Failed`). A terminal state is reached at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Stable string form used in the database and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = WhisperdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(WhisperdError::store(format!(
                "unknown task status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim priority among queued tasks: `High` before `Normal` before `Low`.
///
/// Immutable after creation. The numeric form is what the store sorts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl TaskPriority {
    /// Numeric rank persisted in the store; higher sorts first.
    pub fn rank(&self) -> i64 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 1,
            TaskPriority::High => 2,
        }
    }

    /// Inverse of [`TaskPriority::rank`].
    pub fn from_rank(rank: i64) -> Result<Self, WhisperdError> {
        match rank {
            0 => Ok(TaskPriority::Low),
            1 => Ok(TaskPriority::Normal),
            2 => Ok(TaskPriority::High),
            other => Err(WhisperdError::store(format!(
                "unknown task priority rank: {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
        }
    }
}

impl FromStr for TaskPriority {
    type Err = WhisperdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            other => Err(WhisperdError::invalid_submission(format!(
                "unknown priority: {}",
                other
            ))),
        }
    }
}

/// Requested engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Transcribe,
    Translate,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Transcribe => "transcribe",
            TaskType::Translate => "translate",
        }
    }
}

impl FromStr for TaskType {
    type Err = WhisperdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcribe" => Ok(TaskType::Transcribe),
            "translate" => Ok(TaskType::Translate),
            other => Err(WhisperdError::invalid_submission(format!(
                "unknown task type: {}",
                other
            ))),
        }
    }
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::Transcribe
    }
}

/// A value that accepts either a single float or a comma-separated list.
///
/// Whisper's `temperature` and `clip_timestamps` parameters come in both
/// shapes; the setting is stored exactly as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FloatOrList {
    Single(f64),
    List(String),
}

impl Default for FloatOrList {
    fn default() -> Self {
        FloatOrList::Single(0.0)
    }
}

impl FloatOrList {
    /// Parse into the concrete list of floats.
    pub fn values(&self) -> Result<Vec<f64>, WhisperdError> {
        match self {
            FloatOrList::Single(v) => Ok(vec![*v]),
            FloatOrList::List(s) => s
                .split(',')
                .map(|part| {
                    part.trim().parse::<f64>().map_err(|_| {
                        WhisperdError::invalid_submission(format!(
                            "not a float list: '{}'",
                            s
                        ))
                    })
                })
                .collect(),
        }
    }
}

fn default_compression_ratio_threshold() -> f64 {
    1.8
}
fn default_no_speech_threshold() -> f64 {
    0.6
}
fn default_logprob_threshold() -> f64 {
    -1.0
}
fn default_condition_on_previous_text() -> bool {
    true
}

/// Engine decode parameters, stored verbatim on the task and forwarded to
/// the engine unchanged. Unknown keys survive the round trip via `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeOptions {
    #[serde(default)]
    pub temperature: FloatOrList,
    #[serde(default = "default_compression_ratio_threshold")]
    pub compression_ratio_threshold: f64,
    #[serde(default = "default_logprob_threshold")]
    pub logprob_threshold: f64,
    #[serde(default = "default_no_speech_threshold")]
    pub no_speech_threshold: f64,
    #[serde(default = "default_condition_on_previous_text")]
    pub condition_on_previous_text: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub word_timestamps: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepend_punctuations: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_punctuations: Option<String>,
    #[serde(default)]
    pub clip_timestamps: FloatOrList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hallucination_silence_threshold: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            temperature: FloatOrList::default(),
            compression_ratio_threshold: default_compression_ratio_threshold(),
            logprob_threshold: default_logprob_threshold(),
            no_speech_threshold: default_no_speech_threshold(),
            condition_on_previous_text: default_condition_on_previous_text(),
            initial_prompt: None,
            word_timestamps: false,
            prepend_punctuations: None,
            append_punctuations: None,
            clip_timestamps: FloatOrList::default(),
            hallucination_silence_threshold: None,
            extra: Map::new(),
        }
    }
}

/// Structured transcription output: `text` is the trimmed concatenation of
/// the segment texts; `segments` and `info` are pure JSON trees produced by
/// the engine normalization layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub segments: Vec<Value>,
    pub info: Map<String, Value>,
}

/// The central task entity, owned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Monotonically assigned identifier.
    pub id: i64,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Engine used for this task, recorded at processing start.
    pub engine_name: Option<String>,
    pub task_type: TaskType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Wall-clock seconds spent in the transcription call.
    pub task_processing_time: Option<f64>,
    /// Local path to the stored media file.
    pub file_path: Option<PathBuf>,
    /// Remote URL fetched lazily by the processor.
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size_bytes: Option<i64>,
    /// Media duration in seconds.
    pub file_duration: Option<f64>,
    /// Free-form grouping tag (e.g. source platform).
    pub platform: Option<String>,
    pub decode_options: DecodeOptions,
    /// Detected language code, populated on success.
    pub language: Option<String>,
    pub result: Option<TranscriptionResult>,
    pub error_message: Option<String>,
    /// Convenience URL pointing at this task's result endpoint.
    pub output_url: Option<String>,
    pub callback_url: Option<String>,
    pub callback_status_code: Option<i32>,
    pub callback_message: Option<String>,
    pub callback_time: Option<DateTime<Utc>>,
}

impl Task {
    /// The JSON dictionary sent to callbacks and returned by queries.
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A task as constructed by the ingress adapter, before the store assigns
/// its identifier and timestamps. Always persisted as `Queued`.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub priority: TaskPriority,
    pub task_type: TaskType,
    pub file_path: Option<PathBuf>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub file_duration: Option<f64>,
    pub platform: Option<String>,
    pub decode_options: DecodeOptions,
    pub callback_url: Option<String>,
    pub language: Option<String>,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// Partial update applied by [`crate::store::TaskStore::update`]; `None`
/// fields are left untouched. `updated_at` is refreshed by the store.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub engine_name: Option<String>,
    pub language: Option<String>,
    pub result: Option<TranscriptionResult>,
    pub error_message: Option<String>,
    pub file_path: Option<PathBuf>,
    pub file_name: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub file_duration: Option<f64>,
    pub task_processing_time: Option<f64>,
    pub output_url: Option<String>,
}

impl TaskUpdate {
    /// Update marking the task completed with its transcription output.
    pub fn completed(result: TranscriptionResult, language: Option<String>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            language,
            result: Some(result),
            ..Default::default()
        }
    }

    /// Update marking the task failed with the error text.
    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::High.rank(), 2);
        assert_eq!(TaskPriority::from_rank(0).unwrap(), TaskPriority::Low);
        assert!(TaskPriority::from_rank(9).is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn test_float_or_list_values() {
        assert_eq!(FloatOrList::Single(0.2).values().unwrap(), vec![0.2]);
        assert_eq!(
            FloatOrList::List("0.0, 0.2,0.4".to_string()).values().unwrap(),
            vec![0.0, 0.2, 0.4]
        );
        assert!(FloatOrList::List("a,b".to_string()).values().is_err());
    }

    #[test]
    fn test_decode_options_defaults() {
        let options: DecodeOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.compression_ratio_threshold, 1.8);
        assert_eq!(options.no_speech_threshold, 0.6);
        assert_eq!(options.logprob_threshold, -1.0);
        assert!(options.condition_on_previous_text);
        assert!(!options.word_timestamps);
    }

    #[test]
    fn test_decode_options_preserve_unknown_keys() {
        let json = r#"{"temperature": "0.0,0.2", "beam_size": 5}"#;
        let options: DecodeOptions = serde_json::from_str(json).unwrap();
        assert_eq!(
            options.temperature,
            FloatOrList::List("0.0,0.2".to_string())
        );
        assert_eq!(options.extra.get("beam_size"), Some(&Value::from(5)));

        let back = serde_json::to_value(&options).unwrap();
        assert_eq!(back.get("beam_size"), Some(&Value::from(5)));
    }

    #[test]
    fn test_task_update_constructors() {
        let failed = TaskUpdate::failed("boom");
        assert_eq!(failed.status, Some(TaskStatus::Failed));
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert!(failed.result.is_none());

        let result = TranscriptionResult {
            text: "hi".to_string(),
            segments: vec![],
            info: Map::new(),
        };
        let done = TaskUpdate::completed(result, Some("en".to_string()));
        assert_eq!(done.status, Some(TaskStatus::Completed));
        assert!(done.result.is_some());
        assert!(done.error_message.is_none());
    }
}
