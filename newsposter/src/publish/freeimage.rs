use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use super::AssetHost;
use crate::retry::{RemoteError, RetryPolicy};

const SERVICE: &str = "freeimage";
pub const DEFAULT_API_URL: &str = "https://freeimage.host/api/1/upload";

/// Uploads the cover to freeimage.host so that URL-only targets can fetch it.
pub struct FreeImageHost {
    api_url: String,
    api_key: String,
    client: Client,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct UploadReply {
    #[serde(default)]
    image: Option<UploadedImage>,
    #[serde(default)]
    error: Option<UploadError>,
}

#[derive(Debug, Deserialize)]
struct UploadedImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct UploadError {
    #[serde(default)]
    message: String,
}

impl FreeImageHost {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout_secs: u64,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            client,
            retry,
        })
    }

    async fn upload_once(&self, bytes: &[u8], filename: &str) -> Result<String, RemoteError> {
        let source = Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str("image/jpeg")
            .map_err(|e| RemoteError::InvalidResponse {
                service: SERVICE,
                message: e.to_string(),
            })?;
        let form = Form::new()
            .text("key", self.api_key.clone())
            .text("action", "upload")
            .text("format", "json")
            .part("source", source);

        let response = self
            .client
            .post(&self.api_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest(SERVICE, e))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let reply: Option<UploadReply> = serde_json::from_str(&body).ok();

        if !status.is_success() {
            let message = reply
                .as_ref()
                .and_then(|r| r.error.as_ref())
                .map(|e| e.message.to_lowercase())
                .unwrap_or_default();
            if message.contains("api key") {
                return Err(RemoteError::Unauthorized {
                    service: SERVICE,
                    message: body,
                });
            }
            return Err(RemoteError::from_status(SERVICE, status, body));
        }

        reply
            .and_then(|r| r.image)
            .map(|image| image.url)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| RemoteError::InvalidResponse {
                service: SERVICE,
                message: format!("upload reply without image url: {}", body),
            })
    }
}

#[async_trait::async_trait]
impl AssetHost for FreeImageHost {
    async fn upload_asset(&self, bytes: &[u8], filename: &str) -> Result<String, RemoteError> {
        let url = self
            .retry
            .run("freeimage upload", || self.upload_once(bytes, filename))
            .await?;
        info!(%url, "cover uploaded");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn upload_returns_public_url() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/1/upload")
            .match_body(Matcher::Regex("name=\"action\"".into()))
            .with_status(200)
            .with_body(r#"{"status_code":200,"image":{"url":"https://iili.io/abc.jpg"}}"#)
            .create_async()
            .await;

        let host = FreeImageHost::new(
            format!("{}/api/1/upload", server.url()),
            "key",
            5,
            RetryPolicy::once(),
        )
        .unwrap();
        let url = host.upload_asset(&[1, 2, 3], "cover.jpg").await.unwrap();
        assert_eq!(url, "https://iili.io/abc.jpg");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn invalid_key_is_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/upload")
            .with_status(400)
            .with_body(r#"{"status_code":400,"error":{"message":"Invalid API key","code":100}}"#)
            .expect(1)
            .create_async()
            .await;

        let host = FreeImageHost::new(
            format!("{}/upload", server.url()),
            "bad",
            5,
            RetryPolicy::new(3, Duration::ZERO),
        )
        .unwrap();
        let err = host.upload_asset(&[1], "cover.jpg").await.unwrap_err();
        assert!(err.is_unauthorized());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn reply_without_url_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/upload")
            .with_status(200)
            .with_body(r#"{"status_code":200}"#)
            .create_async()
            .await;

        let host = FreeImageHost::new(format!("{}/upload", server.url()), "k", 5, RetryPolicy::once()).unwrap();
        let err = host.upload_asset(&[1], "cover.jpg").await.unwrap_err();
        assert!(matches!(err, RemoteError::InvalidResponse { .. }));
    }
}
