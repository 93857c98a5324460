//! Built-in job tasks

use async_trait::async_trait;
use cadence_queue::{Job, Task, TaskError};
use serde::Deserialize;
use std::time::Duration;

/// Job kind handled by [`WebhookTask`]
pub const WEBHOOK_KIND: &str = "webhook";

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    url: String,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

/// POSTs the job's `body` to its `url`.
///
/// Failures are worded so the dead-letter reason is useful: transport
/// errors start with `network`, non-2xx responses with `http`.
#[derive(Debug, Clone)]
pub struct WebhookTask {
    client: reqwest::Client,
}

impl WebhookTask {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Task for WebhookTask {
    async fn run(&self, job: &Job) -> Result<(), TaskError> {
        let payload: WebhookPayload = serde_json::from_value(job.payload.clone())?;

        let mut req = self
            .client
            .post(&payload.url)
            .header("x-cadence-job-id", job.id.to_string())
            .header("x-cadence-attempt", job.attempts.to_string());
        if let Some(body) = &payload.body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TaskError::failed(format!("network error calling {}: {}", payload.url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TaskError::failed(format!(
                "http {} from {}",
                status.as_u16(),
                payload.url
            )));
        }
        Ok(())
    }
}
