//! faster-whisper engine adapter.
//!
//! Talks to a faster-whisper inference runtime. The runtime's native result
//! is a pair of (segment iterator, transcription info); on the wire that
//! arrives as a segment list plus an `info` object, which this adapter
//! materializes into plain records. The detected language is read from the
//! info object, never from the segments.

use async_trait::async_trait;
use reqwest::multipart::Form;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio_util::codec::{BytesCodec, FramedRead};

use crate::config::EngineParams;
use crate::core::engine::plain::as_info_map;
use crate::core::engine::{
    apply_decode_options, join_segment_text, EngineFactory, EngineOutput, SpeechEngine,
};
use crate::core::pool::device::DeviceAllocation;
use crate::core::task::{DecodeOptions, TaskType};
use crate::error::WhisperdError;
use crate::Result;

const ENGINE_NAME: &str = "faster_whisper";

/// Factory producing [`FasterWhisperEngine`] handles.
#[derive(Debug)]
pub struct FasterWhisperFactory {
    params: EngineParams,
}

impl FasterWhisperFactory {
    pub fn new(params: EngineParams) -> Result<Self> {
        Ok(Self { params })
    }
}

#[async_trait]
impl EngineFactory for FasterWhisperFactory {
    fn engine_name(&self) -> &'static str {
        ENGINE_NAME
    }

    async fn create(&self, allocation: DeviceAllocation) -> Result<Box<dyn SpeechEngine>> {
        let engine = FasterWhisperEngine::new(self.params.clone(), allocation)?;
        Ok(Box::new(engine))
    }
}

/// One device-bound faster-whisper runtime client.
pub struct FasterWhisperEngine {
    client: Client,
    params: EngineParams,
    allocation: DeviceAllocation,
}

impl FasterWhisperEngine {
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

    fn endpoint(&self) -> String {
        format!("{}/audio/transcriptions", self.params.base_url)
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

/// Wire form of the runtime's (segments, info) pair.
#[derive(Debug, Deserialize)]
struct SegmentsAndInfo {
    #[serde(default)]
    segments: Vec<Value>,
    info: Option<Value>,
}

#[async_trait]
impl SpeechEngine for FasterWhisperEngine {
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
            .text("task", task_type.as_str())
            .text("response_format", "verbose_json")
            .text("device", self.allocation.device.to_string())
            .text("compute_type", self.allocation.compute_type.as_str())
            .text("num_workers", self.params.num_workers.to_string())
            .part("file", self.media_part(path).await?);
        if self.params.cpu_threads > 0 {
            form = form.text("cpu_threads", self.params.cpu_threads.to_string());
        }
        if let Some(language) = language {
            if !language.is_empty() {
                form = form.text("language", language.to_string());
            }
        }
        form = apply_decode_options(form, options);

        let mut request = self.client.post(self.endpoint()).multipart(form);
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

        let parsed: SegmentsAndInfo = response.json().await.map_err(|e| {
            WhisperdError::engine(ENGINE_NAME, format!("failed to parse response: {}", e))
        })?;

        let info = as_info_map(parsed.info);
        let language = info
            .get("language")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(EngineOutput {
            text: join_segment_text(&parsed.segments),
            segments: parsed.segments,
            info,
            language,
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
            "faster_whisper handle on {} shut down",
            self.allocation.device
        );
    }
}
