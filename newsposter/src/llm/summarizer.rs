// Prompt-level helpers: digest summary, image brief, search query.
// Each one retries locally and then falls back to a fixed literal.
use anyhow::{bail, Result};
use tracing::{info, warn};

use super::{LlmProvider, LlmRequest};
use crate::retry::RetryPolicy;

pub const FALLBACK_SUMMARY: &str = "📊 Главное на финансовых рынках: за этот период существенных новостей не поступило. \
Следите за обновлениями канала.\n\n#финансы #рынки #экономика";
pub const FALLBACK_IMAGE_BRIEF: &str = "Financial news and market analysis";
pub const FALLBACK_SEARCH_QUERY: &str = "finance business";

const SUMMARY_PROMPT: &str = "Ты финансовый аналитик. На основе списка новостей сформируй лаконичную и связную сводку. \
Пиши в деловом тоне, избегай повторов, не используй 'Вывод:'. \
При оформлении поста используй эмодзи, но в меру, не перегружая пост. \
Пост не должен превышать 2200 символов. Не используй хештеги из полученных новостей, не добавляй ссылки на сторонние ресурсы. \
В конце добавь хештеги, которые соответствуют сгенерированному посту.";

const IMAGE_BRIEF_PROMPT: &str = "Ты помощник для поиска изображений. На основе финансовой сводки создай текст, \
который поможет найти подходящее изображение. Сосредоточься на основных темах новостей: финансы, экономика, \
криптовалюты, фондовый рынок, банки, инвестиции, технологии, промышленность. \
Создай короткое описание (1-2 предложения) основной темы новостей.";

const SEARCH_QUERY_PROMPT: &str = "Ты помощник для поиска изображений. На основе описания создай короткий \
английский запрос (1-3 слова) для РЕАЛЬНОГО фото (не AI). Темы: finance, business, stock market, crypto, \
economy, banking, money, investment, technology, industry. Верни только запрос.";

/// Text produced by a prompt, and whether it is the literal fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOutcome {
    pub text: String,
    pub fallback: bool,
}

impl PromptOutcome {
    fn generated(text: String) -> Self {
        Self { text, fallback: false }
    }

    fn fallback(text: &str) -> Self {
        Self {
            text: text.to_string(),
            fallback: true,
        }
    }
}

async fn generate_with_retries<P: LlmProvider + ?Sized>(
    provider: &P,
    request: LlmRequest,
    policy: RetryPolicy,
    label: &str,
) -> Result<String> {
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            let backoff = policy.step * (attempt - 1);
            info!("Retrying {} (attempt {}/{}) after {:?}...", label, attempt, attempts, backoff);
            tokio::time::sleep(backoff).await;
        }

        match provider.generate(request.clone()).await {
            Ok(response) => {
                let content = response.content.trim();
                if content.is_empty() {
                    last_error = Some(anyhow::anyhow!("{} returned empty content", label));
                    continue;
                }
                info!(
                    "{} generated: {} chars, {} tokens",
                    label,
                    content.chars().count(),
                    response.usage.total_tokens
                );
                return Ok(content.to_string());
            }
            Err(e) => {
                warn!("{} attempt {} failed: {:#}", label, attempt, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(e),
        None => bail!("{} produced no attempts", label),
    }
}

/// Merge the accepted channel posts into one publishable digest.
pub async fn summarize_posts<P: LlmProvider + ?Sized>(
    provider: &P,
    posts: &[String],
    policy: RetryPolicy,
    fallback: &str,
) -> PromptOutcome {
    if posts.is_empty() {
        return PromptOutcome::fallback(fallback);
    }

    let request = LlmRequest {
        system: Some(SUMMARY_PROMPT.to_string()),
        prompt: posts.join("\n"),
        temperature: Some(0.7),
        ..Default::default()
    };

    match generate_with_retries(provider, request, policy, "summary").await {
        Ok(text) => PromptOutcome::generated(text),
        Err(e) => {
            warn!("Summary generation failed: {:#}, using fallback summary", e);
            PromptOutcome::fallback(fallback)
        }
    }
}

/// Describe the main topic of the digest in one or two sentences.
pub async fn image_brief<P: LlmProvider + ?Sized>(
    provider: &P,
    summary: &str,
    policy: RetryPolicy,
    fallback: &str,
) -> PromptOutcome {
    let request = LlmRequest {
        system: Some(IMAGE_BRIEF_PROMPT.to_string()),
        prompt: summary.to_string(),
        temperature: Some(0.5),
        max_tokens: Some(200),
        ..Default::default()
    };

    match generate_with_retries(provider, request, policy, "image brief").await {
        Ok(text) => PromptOutcome::generated(text),
        Err(e) => {
            warn!("Image brief generation failed: {:#}, using fallback", e);
            PromptOutcome::fallback(fallback)
        }
    }
}

/// Turn an image brief into a short English stock-photo query.
pub async fn search_query<P: LlmProvider + ?Sized>(
    provider: &P,
    brief: &str,
    policy: RetryPolicy,
    fallback: &str,
) -> PromptOutcome {
    let request = LlmRequest {
        system: Some(SEARCH_QUERY_PROMPT.to_string()),
        prompt: brief.to_string(),
        temperature: Some(0.3),
        max_tokens: Some(20),
        ..Default::default()
    };

    match generate_with_retries(provider, request, policy, "search query").await {
        Ok(text) => match clean_query(&text) {
            Some(query) => PromptOutcome::generated(query),
            None => PromptOutcome::fallback(fallback),
        },
        Err(e) => {
            warn!("Search query generation failed: {:#}, using fallback", e);
            PromptOutcome::fallback(fallback)
        }
    }
}

/// First line of the model output, without quotes or trailing punctuation,
/// limited to a few words.
fn clean_query(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.');
    let words: Vec<&str> = line.split_whitespace().take(4).collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" ").to_lowercase())
    }
}
