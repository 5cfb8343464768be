use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::error::ExecutorError;

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Posts notification text to an incoming-webhook URL (Slack-compatible body).
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub async fn send(&self, text: &str) -> Result<(), ExecutorError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { text })
            .send()
            .await
            .map_err(|e| ExecutorError::Failed(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ExecutorError::Failed(format!(
                "webhook returned {}: {body}",
                status.as_u16()
            )));
        }
        debug!(status = status.as_u16(), "notification delivered");
        Ok(())
    }
}
