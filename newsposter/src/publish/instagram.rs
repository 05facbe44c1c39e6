use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use super::{truncate_chars, PostPayload, PublishTarget};
use crate::retry::{RemoteError, RetryPolicy};

const SERVICE: &str = "instagram";
pub const DEFAULT_API_URL: &str = "https://graph.facebook.com/v18.0";
pub const MAX_CAPTION_CHARS: usize = 2200;

/// Graph API error code for an invalid or expired access token.
const INVALID_TOKEN_CODE: i64 = 190;
/// Graph API codes documented as temporary / throttling.
const TRANSIENT_CODES: &[i64] = &[1, 2, 4, 17, 32, 341, 613];

/// Two-step Graph API publish: create a media container from the hosted
/// image URL, then publish the container.
pub struct InstagramTarget {
    api_url: String,
    user_id: String,
    access_token: String,
    publish_delay: Duration,
    client: Client,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct CreatedMedia {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
    #[serde(default)]
    is_transient: bool,
}

impl InstagramTarget {
    pub fn new(
        api_url: impl Into<String>,
        user_id: impl Into<String>,
        access_token: impl Into<String>,
        timeout_secs: u64,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            access_token: access_token.into(),
            publish_delay: Duration::from_secs(5),
            client,
            retry,
        })
    }

    /// Wait between container creation and publish, giving the platform time
    /// to fetch the image.
    pub fn with_publish_delay(mut self, delay: Duration) -> Self {
        self.publish_delay = delay;
        self
    }

    async fn post_form(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<String, RemoteError> {
        let url = format!("{}/{}/{}", self.api_url, self.user_id, endpoint);
        let response = self
            .client
            .post(url)
            .form(params)
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest(SERVICE, e))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_failure(status, body))
        }
    }

    async fn create_container(&self, image_url: &str, caption: &str) -> Result<String, RemoteError> {
        let body = self
            .post_form(
                "media",
                &[
                    ("image_url", image_url),
                    ("caption", caption),
                    ("access_token", self.access_token.as_str()),
                ],
            )
            .await?;
        let created: CreatedMedia = serde_json::from_str(&body).map_err(|e| RemoteError::InvalidResponse {
            service: SERVICE,
            message: format!("{}: {}", e, body),
        })?;
        Ok(created.id)
    }

    async fn publish_container(&self, creation_id: &str) -> Result<(), RemoteError> {
        self.post_form(
            "media_publish",
            &[("creation_id", creation_id), ("access_token", self.access_token.as_str())],
        )
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PublishTarget for InstagramTarget {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn create_post(&self, post: &PostPayload) -> Result<(), RemoteError> {
        let caption = truncate_chars(&post.caption, MAX_CAPTION_CHARS);

        let creation_id = self
            .retry
            .run("instagram create media", || self.create_container(&post.image_url, &caption))
            .await?;
        info!(media_id = %creation_id, "instagram media container created");

        tokio::time::sleep(self.publish_delay).await;

        self.retry
            .run("instagram publish media", || self.publish_container(&creation_id))
            .await?;
        info!(media_id = %creation_id, "instagram post published");
        Ok(())
    }
}

/// Map a Graph API failure body onto a [`RemoteError`]. An invalid token is
/// reported as `Unauthorized` whatever the HTTP status.
fn classify_failure(status: reqwest::StatusCode, body: String) -> RemoteError {
    let Ok(envelope) = serde_json::from_str::<GraphErrorEnvelope>(&body) else {
        return RemoteError::from_status(SERVICE, status, body);
    };
    let error = envelope.error;

    if error.code == INVALID_TOKEN_CODE {
        RemoteError::Unauthorized {
            service: SERVICE,
            message: format!("access token invalid (code 190): {}", error.message),
        }
    } else if error.is_transient || TRANSIENT_CODES.contains(&error.code) {
        RemoteError::Transient {
            service: SERVICE,
            message: format!("code {}: {}", error.code, error.message),
        }
    } else {
        RemoteError::from_status(SERVICE, status, body)
    }
}
