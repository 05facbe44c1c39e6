use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;

use super::ImageDownloader;
use crate::retry::{RemoteError, RetryPolicy};

const SERVICE: &str = "image-download";

/// Plain HTTP GET of the selected cover.
pub struct HttpDownloader {
    client: Client,
    retry: RetryPolicy,
}

impl HttpDownloader {
    pub fn new(timeout_secs: u64, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("Newsposter/0.1.0")
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client, retry })
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(SERVICE, status, body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RemoteError::from_reqwest(SERVICE, e))?;
        if bytes.is_empty() {
            return Err(RemoteError::InvalidResponse {
                service: SERVICE,
                message: format!("empty body from {}", url),
            });
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait::async_trait]
impl ImageDownloader for HttpDownloader {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self
            .retry
            .run("image download", || self.fetch_once(url))
            .await?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn downloads_bytes_and_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let downloader = HttpDownloader::new(5, RetryPolicy::new(2, Duration::ZERO)).unwrap();
        let url = format!("{}/cover.jpg", server.url());

        let flaky = server
            .mock("GET", "/cover.jpg")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;
        assert!(downloader.fetch_bytes(&url).await.is_err());
        flaky.assert_async().await;

        flaky.remove_async().await;
        let ok = server
            .mock("GET", "/cover.jpg")
            .with_status(200)
            .with_body(vec![0xff, 0xd8, 0xff])
            .create_async()
            .await;
        let bytes = downloader.fetch_bytes(&url).await.unwrap();
        assert_eq!(bytes, vec![0xff, 0xd8, 0xff]);
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn missing_image_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let missing = server
            .mock("GET", "/gone.jpg")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let downloader = HttpDownloader::new(5, RetryPolicy::new(3, Duration::ZERO)).unwrap();
        let err = downloader
            .fetch_bytes(&format!("{}/gone.jpg", server.url()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
        missing.assert_async().await;
    }
}
