use anyhow::Result;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::sources::{ChannelMessage, ChannelSource};
use crate::store::ContentStore;
use crate::time_window::TimeWindow;

/// Promotional markers; a message containing any of them is skipped.
pub const DEFAULT_DENY_WORDS: &[&str] = &[
    "курс",
    "подпишись",
    "промокод",
    "обучение",
    "трейдинг",
    "вебинар",
    "записаться",
    "тренинг",
    "марафон",
    "youtube",
    "appstore",
];

/// Hex-encoded SHA-256 of the UTF-8 bytes of `text`.
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Why a message was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    OutsideWindow,
    Advertisement,
    AlreadyProcessed,
}

/// Filters one run's messages down to novel, in-window, non-promotional texts
/// and records the fingerprint of each accepted one.
#[derive(Debug, Clone)]
pub struct MessageDeduplicator {
    window: TimeWindow,
    deny_words: Vec<String>,
}

impl MessageDeduplicator {
    pub fn new(window: TimeWindow, deny_words: &[String]) -> Self {
        let deny_words = deny_words
            .iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        Self { window, deny_words }
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn is_advertisement(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.deny_words.iter().any(|w| lowered.contains(w.as_str()))
    }

    /// Decide on a single message. On acceptance the fingerprint is recorded
    /// before returning, so a repeat later in the same run is rejected too.
    /// Store failures are returned as errors, never as a rejection.
    pub async fn admit(
        &self,
        store: &ContentStore,
        message: &ChannelMessage,
    ) -> Result<std::result::Result<String, Rejection>> {
        let text = message.text.trim();
        if text.is_empty() {
            return Ok(Err(Rejection::Empty));
        }
        if !self.window.contains(message.timestamp) {
            return Ok(Err(Rejection::OutsideWindow));
        }
        if self.is_advertisement(text) {
            return Ok(Err(Rejection::Advertisement));
        }

        let hash = fingerprint(text);
        if store.has_message(&hash).await? {
            return Ok(Err(Rejection::AlreadyProcessed));
        }
        store.record_message(&hash).await?;
        Ok(Ok(text.to_string()))
    }

    /// Accepted texts of `messages`, in input order.
    pub async fn filter<I>(&self, store: &ContentStore, messages: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = ChannelMessage>,
    {
        let mut accepted = Vec::new();
        for message in messages {
            match self.admit(store, &message).await? {
                Ok(text) => accepted.push(text),
                Err(reason) => debug!(?reason, timestamp = %message.timestamp, "message skipped"),
            }
        }
        Ok(accepted)
    }
}

/// Poll every channel in order and return the accepted texts.
///
/// A channel that fails to load is logged and skipped. A store failure aborts
/// the whole collection.
pub async fn collect_new_posts(
    source: &dyn ChannelSource,
    channels: &[String],
    limit_per_channel: usize,
    dedup: &MessageDeduplicator,
    store: &ContentStore,
) -> Result<Vec<String>> {
    let mut posts = Vec::new();

    for channel in channels {
        let messages = match source.fetch(channel, limit_per_channel).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(channel = %channel, "failed to fetch channel: {:#}", e);
                continue;
            }
        };

        let fetched = messages.len();
        let accepted = dedup.filter(store, messages).await?;
        info!(channel = %channel, fetched, accepted = accepted.len(), "channel processed");
        posts.extend(accepted);
    }

    Ok(posts)
}
