use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod telegram_web;

/// One post read from a news channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChannelMessage {
    pub fn new(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            timestamp,
        }
    }
}

/// A channel the pipeline polls for news.
#[async_trait::async_trait]
pub trait ChannelSource: Send + Sync {
    /// Fetch up to `limit` of the newest messages of `channel`, oldest first.
    async fn fetch(&self, channel: &str, limit: usize) -> Result<Vec<ChannelMessage>>;
}
