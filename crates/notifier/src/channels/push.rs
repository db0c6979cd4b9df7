//! Push delivery to every active device of the owner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use axion_common::error::AppError;
use axion_common::types::{DevicePlatform, DeviceToken, NotificationJob, TodoNotification};

use super::ChannelHandler;
use crate::store::RecipientDirectory;

/// What the gateway said about one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The token is permanently dead and should be deactivated.
    InvalidToken,
    /// Temporary refusal; worth retrying later.
    Rejected,
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, device: &DeviceToken, title: &str, body: &str) -> Result<PushOutcome, AppError>;
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    token: &'a str,
    platform: DevicePlatform,
    title: &'a str,
    body: &'a str,
}

/// Generic HTTP push relay (FCM/APNs bridge).
pub struct HttpPushGateway {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpPushGateway {
    pub fn new(url: String, token: Option<String>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url, token })
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send(&self, device: &DeviceToken, title: &str, body: &str) -> Result<PushOutcome, AppError> {
        let mut request = self.client.post(&self.url).json(&PushRequest {
            token: &device.device_token,
            platform: device.platform,
            title,
            body,
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let status = request.send().await?.status();
        Ok(match status.as_u16() {
            200..=299 => PushOutcome::Accepted,
            404 | 410 => PushOutcome::InvalidToken,
            _ => {
                tracing::warn!(status = %status, platform = %device.platform, "Push gateway rejected message");
                PushOutcome::Rejected
            }
        })
    }
}

pub struct PushHandler {
    gateway: Arc<dyn PushGateway>,
    directory: Arc<dyn RecipientDirectory>,
}

impl PushHandler {
    pub fn new(gateway: Arc<dyn PushGateway>, directory: Arc<dyn RecipientDirectory>) -> Self {
        Self { gateway, directory }
    }
}

#[async_trait]
impl ChannelHandler for PushHandler {
    async fn deliver(&self, record: &TodoNotification, job: &NotificationJob) -> Result<bool, AppError> {
        let devices = self.directory.active_device_tokens(record.user_id).await?;
        if devices.is_empty() {
            tracing::info!(
                notification_id = record.id,
                user_id = record.user_id,
                "No active devices, nothing to push"
            );
            return Ok(true);
        }

        let mut accepted = 0usize;
        let mut invalid = 0usize;
        for device in &devices {
            match self.gateway.send(device, "Todo reminder", job.display_message()).await {
                Ok(PushOutcome::Accepted) => accepted += 1,
                Ok(PushOutcome::InvalidToken) => {
                    invalid += 1;
                    if let Err(e) = self.directory.deactivate_device_token(&device.device_token).await {
                        tracing::warn!(
                            notification_id = record.id,
                            error = %e,
                            "Failed to deactivate invalid device token"
                        );
                    }
                }
                Ok(PushOutcome::Rejected) => {}
                Err(e) => {
                    tracing::warn!(notification_id = record.id, error = %e, "Push send failed");
                }
            }
        }

        tracing::info!(
            notification_id = record.id,
            devices = devices.len(),
            accepted,
            invalid,
            "Push notification dispatched"
        );

        // every token turned out dead: nothing deliverable remains
        Ok(accepted > 0 || invalid == devices.len())
    }
}
