//! Email delivery through the Resend HTTP API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use axion_common::error::AppError;
use axion_common::types::{NotificationJob, TodoNotification};

use super::ChannelHandler;
use crate::store::RecipientDirectory;

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Debug, Serialize)]
struct EmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    text: String,
}

pub struct EmailHandler {
    client: reqwest::Client,
    api_key: String,
    from: String,
    endpoint: String,
    directory: Arc<dyn RecipientDirectory>,
}

impl EmailHandler {
    pub fn new(api_key: String, from: String, directory: Arc<dyn RecipientDirectory>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_key,
            from,
            endpoint: RESEND_ENDPOINT.to_string(),
            directory,
        })
    }

    /// Point at a different Resend-compatible endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn build_request<'a>(&'a self, to: &'a str, job: &NotificationJob) -> EmailRequest<'a> {
        EmailRequest {
            from: &self.from,
            to: [to],
            subject: format!("Reminder: {}", job.display_message()),
            text: format!(
                "{}\n\nScheduled for {}.",
                job.display_message(),
                job.scheduled_at.format("%Y-%m-%d %H:%M UTC")
            ),
        }
    }
}

#[async_trait]
impl ChannelHandler for EmailHandler {
    async fn deliver(&self, record: &TodoNotification, job: &NotificationJob) -> Result<bool, AppError> {
        let Some(address) = self.directory.owner_email(record.user_id).await? else {
            tracing::info!(
                notification_id = record.id,
                user_id = record.user_id,
                "Owner has no email address, nothing to send"
            );
            return Ok(true);
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(&address, job))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Delivery(format!(
                "email provider returned {}: {}",
                status, body
            )));
        }

        tracing::info!(notification_id = record.id, "Email notification sent");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axion_common::types::{Channel, DeviceToken};
    use chrono::Utc;

    struct NoEmail;

    #[async_trait]
    impl RecipientDirectory for NoEmail {
        async fn owner_email(&self, _: i64) -> Result<Option<String>, AppError> {
            Ok(None)
        }
        async fn active_device_tokens(&self, _: i64) -> Result<Vec<DeviceToken>, AppError> {
            Ok(Vec::new())
        }
        async fn deactivate_device_token(&self, _: &str) -> Result<bool, AppError> {
            Ok(false)
        }
    }

    fn handler() -> EmailHandler {
        EmailHandler::new("re_test".to_string(), "AxionSync <noreply@axionsync.app>".to_string(), Arc::new(NoEmail))
            .unwrap()
            // unroutable; any request attempt would fail the test
            .with_endpoint("http://127.0.0.1:9/emails")
    }

    #[test]
    fn test_request_uses_display_message() {
        let handler = handler();
        let job = NotificationJob::new(1, 2, 3, Channel::Email, None, Utc::now());
        let request = handler.build_request("user@example.com", &job);
        assert_eq!(request.to, ["user@example.com"]);
        assert_eq!(request.subject, "Reminder: Todo reminder");
        assert!(request.text.starts_with("Todo reminder"));

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["from"], "AxionSync <noreply@axionsync.app>");
        assert_eq!(json["to"][0], "user@example.com");
    }

    #[tokio::test]
    async fn test_missing_address_is_nothing_to_deliver() {
        let handler = handler();
        let record = TodoNotification {
            id: 1,
            todo_id: 2,
            user_id: 3,
            notify_time: Utc::now(),
            is_sent: false,
            channel: Channel::Email,
            message: Some("Pay rent".to_string()),
            created_at: Utc::now(),
        };
        let job = NotificationJob::from_record(&record);
        assert!(handler.deliver(&record, &job).await.unwrap());
    }
}
