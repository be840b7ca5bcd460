//! Speech engine abstraction.
//!
//! Engines are black boxes with a fixed operation set: given a local media
//! path, a task type, and decode options, they produce segments and an
//! optional info object. The pool creates device-bound handles through an
//! [`EngineFactory`]; the processor only ever talks to the
//! [`SpeechEngine`] trait.
//!
//! Two engines are built in:
//!
//! - `openai_whisper`: an OpenAI-Whisper-compatible runtime; responds with
//!   `{text, segments, language}` and no info object.
//! - `faster_whisper`: a faster-whisper runtime; responds with a segment
//!   list plus a transcription-info object carrying the detected language.
//!
//! Any other engine name is rejected at boot.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

use crate::config::EngineParams;
use crate::core::pool::device::DeviceAllocation;
use crate::core::task::{DecodeOptions, TaskType};
use crate::error::WhisperdError;
use crate::Result;

pub mod faster_whisper;
pub mod openai_whisper;
pub mod plain;

pub use faster_whisper::FasterWhisperFactory;
pub use openai_whisper::OpenAiWhisperFactory;
pub use plain::to_plain;

/// Normalized output common to all engines.
///
/// `segments` and `info` are pure JSON trees (see [`plain`]); `text` is the
/// trimmed concatenation of the segment texts.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub text: String,
    pub segments: Vec<Value>,
    pub info: Map<String, Value>,
    pub language: Option<String>,
}

/// One initialized, device-bound engine instance.
///
/// Handles are expensive to create and not safe for concurrent use; the
/// model pool enforces exclusive acquisition.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Engine name as recorded on tasks ("openai_whisper", "faster_whisper").
    fn name(&self) -> &'static str;

    /// The device this handle is bound to.
    fn allocation(&self) -> &DeviceAllocation;

    /// Run one transcription or translation call.
    ///
    /// Blocking/GPU-bound from the caller's perspective; the processor
    /// bounds concurrent calls by pool capacity. Engine errors are terminal
    /// for the task and are never retried by the core.
    async fn transcribe(
        &self,
        path: &Path,
        task_type: TaskType,
        language: Option<&str>,
        options: &DecodeOptions,
    ) -> Result<EngineOutput>;

    /// Cheap liveness probe; a handle that fails is destroyed rather than
    /// returned to the pool.
    async fn health_check(&self) -> bool;

    /// Release any resources held by this handle.
    async fn shutdown(&self);
}

/// Creates device-bound engine handles for the pool.
#[async_trait]
pub trait EngineFactory: Send + Sync + std::fmt::Debug {
    /// Name of the engine this factory produces.
    fn engine_name(&self) -> &'static str;

    /// Create one handle bound to the given device.
    async fn create(&self, allocation: DeviceAllocation) -> Result<Box<dyn SpeechEngine>>;
}

/// Resolve the factory for a configured engine name.
///
/// # Errors
///
/// Unknown engine names fail fatally with a configuration error.
pub fn factory_for(engine: &str, params: EngineParams) -> Result<Arc<dyn EngineFactory>> {
    match engine {
        "openai_whisper" => Ok(Arc::new(OpenAiWhisperFactory::new(params)?)),
        "faster_whisper" => Ok(Arc::new(FasterWhisperFactory::new(params)?)),
        other => Err(WhisperdError::config(format!(
            "unsupported engine: '{}'",
            other
        ))),
    }
}

/// Concatenate segment texts into the result text.
///
/// Segment texts carry their own leading whitespace (Whisper emits
/// " Hello" style tokens), so segments are joined without a separator and
/// the final string is trimmed.
pub fn join_segment_text(segments: &[Value]) -> String {
    let mut text = String::new();
    for segment in segments {
        if let Some(piece) = segment.get("text").and_then(Value::as_str) {
            text.push_str(piece);
        }
    }
    text.trim().to_string()
}

/// Append decode options to a multipart form as text fields.
///
/// Options are forwarded verbatim; unknown keys from the submission ride
/// along as their JSON string form.
pub(crate) fn apply_decode_options(
    mut form: reqwest::multipart::Form,
    options: &DecodeOptions,
) -> reqwest::multipart::Form {
    use crate::core::task::FloatOrList;

    let float_or_list = |value: &FloatOrList| match value {
        FloatOrList::Single(v) => v.to_string(),
        FloatOrList::List(s) => s.clone(),
    };

    form = form
        .text("temperature", float_or_list(&options.temperature))
        .text(
            "compression_ratio_threshold",
            options.compression_ratio_threshold.to_string(),
        )
        .text("logprob_threshold", options.logprob_threshold.to_string())
        .text(
            "no_speech_threshold",
            options.no_speech_threshold.to_string(),
        )
        .text(
            "condition_on_previous_text",
            options.condition_on_previous_text.to_string(),
        )
        .text("word_timestamps", options.word_timestamps.to_string())
        .text("clip_timestamps", float_or_list(&options.clip_timestamps));

    if let Some(prompt) = &options.initial_prompt {
        form = form.text("initial_prompt", prompt.clone());
    }
    if let Some(prepend) = &options.prepend_punctuations {
        form = form.text("prepend_punctuations", prepend.clone());
    }
    if let Some(append) = &options.append_punctuations {
        form = form.text("append_punctuations", append.clone());
    }
    if let Some(threshold) = options.hallucination_silence_threshold {
        form = form.text("hallucination_silence_threshold", threshold.to_string());
    }
    for (key, value) in &options.extra {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        form = form.text(key.clone(), text);
    }
    form
}
