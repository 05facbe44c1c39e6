use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{ImageCandidate, ImageSearch};
use crate::retry::{RemoteError, RetryPolicy};

const SERVICE: &str = "pexels";
pub const DEFAULT_API_URL: &str = "https://api.pexels.com/v1";

/// Pexels photo search (`GET /v1/search`).
pub struct PexelsSearch {
    api_url: String,
    api_key: String,
    per_page: u32,
    client: Client,
    retry: RetryPolicy,
}

impl PexelsSearch {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        per_page: u32,
        timeout_secs: u64,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            per_page,
            client,
            retry,
        })
    }

    async fn search_once(&self, query: &str) -> Result<SearchResponse, RemoteError> {
        let per_page = self.per_page.to_string();
        let response = self
            .client
            .get(format!("{}/search", self.api_url))
            .header("Authorization", &self.api_key)
            .query(&[
                ("query", query),
                ("per_page", per_page.as_str()),
                ("orientation", "square"),
                ("size", "large"),
            ])
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(SERVICE, status, body));
        }

        response.json().await.map_err(|e| RemoteError::InvalidResponse {
            service: SERVICE,
            message: e.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ImageSearch for PexelsSearch {
    fn provider(&self) -> &str {
        SERVICE
    }

    async fn search(&self, query: &str) -> Result<Vec<ImageCandidate>> {
        let response = self
            .retry
            .run(&format!("pexels search '{}'", query), || self.search_once(query))
            .await?;

        let candidates: Vec<ImageCandidate> = response
            .photos
            .into_iter()
            .filter_map(Photo::into_candidate)
            .collect();
        debug!(query, count = candidates.len(), "pexels search returned");
        Ok(candidates)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    photos: Vec<Photo>,
}

#[derive(Debug, Deserialize)]
struct Photo {
    id: u64,
    /// Photo page, e.g. https://www.pexels.com/photo/stock-chart-on-screen-210607/
    url: Option<String>,
    alt: Option<String>,
    src: Option<PhotoSrc>,
}

#[derive(Debug, Deserialize)]
struct PhotoSrc {
    large2x: Option<String>,
    large: Option<String>,
    medium: Option<String>,
    original: Option<String>,
}

impl Photo {
    fn into_candidate(self) -> Option<ImageCandidate> {
        let src = self.src?;
        let image_url = src.large2x.or(src.large).or(src.medium).or(src.original)?;

        let mut tags = Vec::new();
        if let Some(alt) = self.alt.filter(|a| !a.trim().is_empty()) {
            tags.push(alt);
        }
        if let Some(slug) = self.url.as_deref().and_then(slug_words) {
            tags.push(slug);
        }

        Some(ImageCandidate {
            id: self.id.to_string(),
            url: image_url,
            tags,
        })
    }
}

/// Words of the photo page slug, without the trailing numeric id.
fn slug_words(page_url: &str) -> Option<String> {
    let parsed = url::Url::parse(page_url).ok()?;
    let slug = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let words: Vec<&str> = slug
        .split('-')
        .filter(|w| !w.is_empty() && !w.chars().all(|c| c.is_ascii_digit()))
        .collect();
    (!words.is_empty()).then(|| words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_words_drop_numeric_id() {
        assert_eq!(
            slug_words("https://www.pexels.com/photo/stock-chart-on-screen-210607/"),
            Some("stock chart on screen".into())
        );
        assert_eq!(slug_words("https://www.pexels.com/photo/210607/"), None);
        assert_eq!(slug_words("not a url"), None);
    }

    #[test]
    fn photo_prefers_large2x_and_collects_tags() {
        let photo: Photo = serde_json::from_str(
            r#"{
                "id": 210607,
                "url": "https://www.pexels.com/photo/stock-chart-210607/",
                "alt": "Trading chart on a monitor",
                "src": {"large": "https://images.pexels.com/l.jpg", "large2x": "https://images.pexels.com/l2.jpg"}
            }"#,
        )
        .unwrap();
        let candidate = photo.into_candidate().unwrap();
        assert_eq!(candidate.id, "210607");
        assert_eq!(candidate.url, "https://images.pexels.com/l2.jpg");
        assert_eq!(candidate.tags, vec!["Trading chart on a monitor", "stock chart"]);
    }

    #[test]
    fn photo_without_source_is_skipped() {
        let photo: Photo = serde_json::from_str(r#"{"id": 1, "alt": "x"}"#).unwrap();
        assert!(photo.into_candidate().is_none());
    }
}
