use serde::Serialize;

use crate::retry::RemoteError;

pub mod freeimage;
pub mod instagram;
pub mod telegram;

/// Everything a target may need to publish one post.
#[derive(Debug, Clone, Serialize)]
pub struct PostPayload {
    pub caption: String,
    /// Public URL of the uploaded cover
    pub image_url: String,
    /// Raw cover bytes, for targets that take an upload
    #[serde(skip)]
    pub image_bytes: Vec<u8>,
    pub filename: String,
}

/// A platform the digest is posted to.
#[async_trait::async_trait]
pub trait PublishTarget: Send + Sync {
    fn name(&self) -> &str;

    async fn create_post(&self, post: &PostPayload) -> Result<(), RemoteError>;
}

/// Public hosting for the cover image.
#[async_trait::async_trait]
pub trait AssetHost: Send + Sync {
    /// Upload `bytes` and return a publicly reachable URL.
    async fn upload_asset(&self, bytes: &[u8], filename: &str) -> Result<String, RemoteError>;
}

/// Split `text` into a head of at most `max_chars` characters and the
/// remainder. The cut prefers the last line break or space in the second half
/// of the head.
pub fn split_caption(text: &str, max_chars: usize) -> (String, Option<String>) {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return (text.to_string(), None);
    }

    let hard_cut = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..hard_cut];
    let soft_floor = head
        .char_indices()
        .nth(max_chars / 2)
        .map(|(i, _)| i)
        .unwrap_or(0);

    let cut = head
        .rfind('\n')
        .filter(|&i| i >= soft_floor)
        .or_else(|| head.rfind(' ').filter(|&i| i >= soft_floor))
        .unwrap_or(hard_cut);

    let first = text[..cut].trim_end().to_string();
    let rest = text[cut..].trim();
    (first, (!rest.is_empty()).then(|| rest.to_string()))
}

/// At most `max_chars` characters of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_caption_is_not_split() {
        let (head, rest) = split_caption("  короткий пост ", 1024);
        assert_eq!(head, "короткий пост");
        assert_eq!(rest, None);
    }

    #[test]
    fn long_caption_breaks_on_whitespace() {
        let text = format!("{}\n{}", "а".repeat(700), "б".repeat(700));
        let (head, rest) = split_caption(&text, 1024);
        assert_eq!(head, "а".repeat(700));
        assert_eq!(rest.unwrap(), "б".repeat(700));
    }

    #[test]
    fn unbroken_text_is_cut_at_limit() {
        let text = "x".repeat(1500);
        let (head, rest) = split_caption(&text, 1024);
        assert_eq!(head.chars().count(), 1024);
        assert_eq!(rest.unwrap().chars().count(), 476);
    }

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate_chars("привет", 3), "при");
    }
}
