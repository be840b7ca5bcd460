//! OpenAI-Whisper-compatible engine adapter.
//!
//! Talks to an OpenAI-Whisper-style inference runtime over its
//! `/audio/{transcriptions,translations}` endpoints with
//! `response_format=verbose_json`. The runtime reports segments and the
//! detected language but no separate info object.

use async_trait::async_trait;
use reqwest::multipart::Form;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio_util::codec::{BytesCodec, FramedRead};

use crate::config::EngineParams;
use crate::core::engine::{
    apply_decode_options, join_segment_text, EngineFactory, EngineOutput, SpeechEngine,
};
use crate::core::pool::device::DeviceAllocation;
use crate::core::task::{DecodeOptions, TaskType};
use crate::error::WhisperdError;
use crate::Result;

const ENGINE_NAME: &str = "openai_whisper";

/// Factory producing [`OpenAiWhisperEngine`] handles.
#[derive(Debug)]
pub struct OpenAiWhisperFactory {
    params: EngineParams,
}

impl OpenAiWhisperFactory {
    pub fn new(params: EngineParams) -> Result<Self> {
        Ok(Self { params })
    }
}

#[async_trait]
impl EngineFactory for OpenAiWhisperFactory {
    fn engine_name(&self) -> &'static str {
        ENGINE_NAME
    }

    async fn create(&self, allocation: DeviceAllocation) -> Result<Box<dyn SpeechEngine>> {
        let engine = OpenAiWhisperEngine::new(self.params.clone(), allocation)?;
        Ok(Box::new(engine))
    }
}

/// One device-bound OpenAI-Whisper runtime client.
pub struct OpenAiWhisperEngine {
    client: Client,
    params: EngineParams,
    allocation: DeviceAllocation,
}

impl OpenAiWhisperEngine {
    pub fn new(params: EngineParams, allocation: DeviceAllocation) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(params.request_timeout_seconds))
            .build()
            .map_err(|e| {
                WhisperdError::engine(ENGINE_NAME, format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            params,
            allocation,
        })
    }

    fn endpoint(&self, task_type: TaskType) -> String {
        let operation = match task_type {
            TaskType::Transcribe => "transcriptions",
            TaskType::Translate => "translations",
        };
        format!("{}/audio/{}", self.params.base_url, operation)
    }

    async fn media_part(&self, path: &Path) -> Result<reqwest::multipart::Part> {
        let file = File::open(path).await.map_err(|e| {
            WhisperdError::engine(ENGINE_NAME, format!("Failed to open media file: {}", e))
        })?;
        let stream = FramedRead::new(file, BytesCodec::new());
        let body = reqwest::Body::wrap_stream(stream);

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.wav".to_string());
        reqwest::multipart::Part::stream(body)
            .file_name(filename)
            .mime_str("application/octet-stream")
            .map_err(|e| WhisperdError::engine(ENGINE_NAME, e.to_string()))
    }
}

/// Verbose-JSON response of an OpenAI-Whisper runtime.
#[derive(Debug, Deserialize)]
struct VerboseResponse {
    #[serde(default)]
    segments: Vec<Value>,
    language: Option<String>,
}

#[async_trait]
impl SpeechEngine for OpenAiWhisperEngine {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn allocation(&self) -> &DeviceAllocation {
        &self.allocation
    }

    async fn transcribe(
        &self,
        path: &Path,
        task_type: TaskType,
        language: Option<&str>,
        options: &DecodeOptions,
    ) -> Result<EngineOutput> {
        let mut form = Form::new()
            .text("model", self.params.model.clone())
            .text("response_format", "verbose_json")
            .text("device", self.allocation.device.to_string())
            .text("compute_type", self.allocation.compute_type.as_str())
            .part("file", self.media_part(path).await?);
        if let Some(language) = language {
            if !language.is_empty() {
                form = form.text("language", language.to_string());
            }
        }
        form = apply_decode_options(form, options);

        let mut request = self.client.post(self.endpoint(task_type)).multipart(form);
        if let Some(api_key) = &self.params.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request.send().await.map_err(|e| {
            WhisperdError::engine(ENGINE_NAME, format!("runtime request failed: {}", e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(WhisperdError::engine(
                ENGINE_NAME,
                format!("runtime error {}: {}", status, text),
            ));
        }

        let parsed: VerboseResponse = response.json().await.map_err(|e| {
            WhisperdError::engine(ENGINE_NAME, format!("failed to parse response: {}", e))
        })?;

        // This engine reports no info object; normalize to an empty map.
        Ok(EngineOutput {
            text: join_segment_text(&parsed.segments),
            segments: parsed.segments,
            info: Map::new(),
            language: parsed.language,
        })
    }

    async fn health_check(&self) -> bool {
        match self.client.get(&self.params.base_url).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(_) => false,
        }
    }

    async fn shutdown(&self) {
        log::debug!(
            "openai_whisper handle on {} shut down",
            self.allocation.device
        );
    }
}
