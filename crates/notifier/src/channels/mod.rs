//! Delivery handlers, one per notification channel.

pub mod email;
pub mod in_app;
pub mod push;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use axion_common::error::AppError;
use axion_common::types::{Channel, NotificationJob, TodoNotification};

pub use email::EmailHandler;
pub use in_app::InAppHandler;
pub use push::{HttpPushGateway, PushGateway, PushHandler, PushOutcome};

/// Sends one notification over one transport.
///
/// `Ok(true)` means the transport accepted it (or there was nobody to send
/// to). `Ok(false)` and `Err(_)` are both delivery failures and feed the
/// retry schedule.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn deliver(&self, record: &TodoNotification, job: &NotificationJob) -> Result<bool, AppError>;
}

/// Channel → handler lookup. In-app is always present and catches any
/// channel that has no handler of its own.
#[derive(Clone)]
pub struct ChannelRegistry {
    in_app: Arc<dyn ChannelHandler>,
    handlers: HashMap<Channel, Arc<dyn ChannelHandler>>,
}

impl ChannelRegistry {
    pub fn new(in_app: Arc<dyn ChannelHandler>) -> Self {
        Self {
            in_app,
            handlers: HashMap::new(),
        }
    }

    pub fn with_handler(mut self, channel: Channel, handler: Arc<dyn ChannelHandler>) -> Self {
        if channel == Channel::InApp {
            self.in_app = handler;
        } else {
            self.handlers.insert(channel, handler);
        }
        self
    }

    pub fn handler_for(&self, channel: Channel) -> &Arc<dyn ChannelHandler> {
        self.handlers.get(&channel).unwrap_or(&self.in_app)
    }
}
