//! Alert delivery.
//!
//! The orchestrator calls a [`Notifier`] at most once per failing run. The
//! decay branch of the weather pipeline uses the same channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use crate::PipelineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub fields: Vec<(String, String)>,
}

impl Notification {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Slack-flavoured markdown body.
    pub fn render(&self) -> String {
        let mut text = format!(":red_circle: {}\n", self.title);
        for (name, value) in &self.fields {
            text.push_str(&format!("*{}*: {}\n", name, value));
        }
        text
    }
}

/// What gets reported when a task fails for good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureAlert {
    pub run_id: String,
    pub dag_name: String,
    pub task_name: String,
    pub execution_time: DateTime<Utc>,
    pub detail: String,
    pub log_reference: String,
}

impl From<&FailureAlert> for Notification {
    fn from(alert: &FailureAlert) -> Self {
        Notification::new("Task Failed.")
            .field("DAG", &alert.dag_name)
            .field("Task", &alert.task_name)
            .field("Execution Time", alert.execution_time.to_rfc3339())
            .field("Dag Run", &alert.run_id)
            .field("Detail", &alert.detail)
            .field("Log URL", &alert.log_reference)
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &Notification) -> Result<(), PipelineError>;
}

/// Posts to a Slack incoming webhook.
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    channel: Option<String>,
    username: String,
}

impl SlackNotifier {
    pub fn new(
        webhook_url: impl Into<String>,
        channel: Option<String>,
        username: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("slack client: {}", e)))?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
            channel,
            username: username.into(),
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &Notification) -> Result<(), PipelineError> {
        let mut body = json!({
            "text": message.render(),
            "username": self.username,
        });
        if let Some(channel) = &self.channel {
            body["channel"] = json!(channel);
        }

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(format!("slack: {}", e)))?;

        if !response.status().is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "slack responded with {}",
                response.status()
            )));
        }
        info!(title = %message.title, "slack notification delivered");
        Ok(())
    }
}

/// Used when no webhook is configured: the alert only goes to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &Notification) -> Result<(), PipelineError> {
        warn!(title = %message.title, fields = ?message.fields, "alert");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn failure_alert_carries_every_field() {
        let alert = FailureAlert {
            run_id: "weather__2025-05-23".into(),
            dag_name: "weather_data_ingestion".into(),
            task_name: "DataValidation".into(),
            execution_time: Utc.with_ymd_and_hms(2025, 5, 23, 6, 0, 0).unwrap(),
            detail: "1 of 24 expectations failed".into(),
            log_reference: "logs/weather_data_ingestion/weather__2025-05-23/DataValidation".into(),
        };
        let text = Notification::from(&alert).render();
        assert!(text.starts_with(":red_circle: Task Failed."));
        assert!(text.contains("*Task*: DataValidation"));
        assert!(text.contains("*Dag Run*: weather__2025-05-23"));
        assert!(text.contains("*Execution Time*: 2025-05-23T06:00:00+00:00"));
        assert!(text.contains("*Log URL*: logs/"));
    }
}
