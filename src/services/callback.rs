//! Callback delivery: best-effort, at-least-once POST of the final task
//! payload to the caller-supplied URL.
//!
//! The dispatcher re-fetches the task before posting so the body is the
//! authoritative snapshot, retries with a fixed wait, and always records
//! the final outcome on the task. A callback never fails the task it
//! belongs to.

use chrono::Utc;
use log::{debug, warn};
use reqwest::Client;
use std::time::Duration;

use crate::config::CallbackConfig;
use crate::error::WhisperdError;
use crate::store::TaskStore;
use crate::Result;

/// Delivers task payloads to callback URLs.
pub struct CallbackDispatcher {
    client: Client,
    config: CallbackConfig,
}

impl CallbackDispatcher {
    pub fn new(config: CallbackConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!("whisperd/{}", crate::VERSION))
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| {
                WhisperdError::media_fetch(format!("failed to create callback client: {}", e))
            })?;
        Ok(Self { client, config })
    }

    /// Deliver the callback for `task_id` and record the outcome.
    ///
    /// Skips silently when the task has no callback URL or no longer
    /// exists. Transport errors and non-2xx responses are retried up to the
    /// configured attempt count; whatever the final attempt produced is
    /// persisted via [`TaskStore::record_callback`].
    pub async fn notify(&self, store: &dyn TaskStore, task_id: i64) -> Result<()> {
        let task = match store.get(task_id).await? {
            Some(task) => task,
            None => {
                debug!("callback skipped: task {} no longer exists", task_id);
                return Ok(());
            }
        };
        let url = match task.callback_url.as_deref() {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => return Ok(()),
        };

        let payload = task.to_payload();
        let mut outcome: (Option<i32>, String) = (None, String::new());

        let attempts = self.config.retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self.client.post(&url).json(&payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    outcome = (Some(status.as_u16() as i32), body);
                    if status.is_success() {
                        break;
                    }
                    warn!(
                        "callback for task {} got {} (attempt {}/{})",
                        task_id, status, attempt, attempts
                    );
                }
                Err(e) => {
                    warn!(
                        "callback for task {} failed: {} (attempt {}/{})",
                        task_id, e, attempt, attempts
                    );
                    outcome = (None, e.to_string());
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(self.config.retry_delay_seconds)).await;
            }
        }

        let (status_code, message) = outcome;
        let message = truncate_utf8(&message, self.config.max_message_length);
        store
            .record_callback(task_id, status_code, &message, Utc::now())
            .await?;
        debug!(
            "callback for task {} recorded: status={:?}",
            task_id, status_code
        );
        Ok(())
    }
}

/// Truncate to at most `max_bytes`, respecting character boundaries.
fn truncate_utf8(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}
