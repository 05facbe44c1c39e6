//! Publishing orchestrator.
//!
//! One run walks a fixed sequence of stages:
//!
//! `collect -> summarize -> build-image-prompt -> acquire-image -> upload-image
//! -> publish-primary-channel -> publish-secondary-channel -> done`
//!
//! Every transition is reported to the event sink. Store errors end the run
//! with an `Err`; any other stage failure ends it with
//! [`RunOutcome::Aborted`], except a failed primary publish, which only
//! downgrades the result to [`RunOutcome::PartiallyPublished`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use common::Config;
use tracing::{error, info, warn};

use crate::dedup::{collect_new_posts, MessageDeduplicator, DEFAULT_DENY_WORDS};
use crate::events::{EventSink, EventStatus, PipelineEvent};
use crate::images::{
    content_hash, derive_variants, noisy_variants, ImageDownloader, ImageSearch, ImageSelector,
    KeywordFilter, SelectedImage, SelectionError, DEFAULT_ALLOW_KEYWORDS, DEFAULT_ANCHORS,
    DEFAULT_DENY_KEYWORDS, DEFAULT_GENERIC_SUFFIXES, DEFAULT_MAX_ROUNDS, DEFAULT_MAX_VARIANTS,
};
use crate::llm::summarizer::{
    image_brief, search_query, summarize_posts, FALLBACK_IMAGE_BRIEF, FALLBACK_SEARCH_QUERY,
    FALLBACK_SUMMARY,
};
use crate::llm::LlmProvider;
use crate::publish::{AssetHost, PostPayload, PublishTarget};
use crate::retry::RetryPolicy;
use crate::sources::ChannelSource;
use crate::store::ContentStore;
use crate::time_window::{RunMode, TimeWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Collect,
    Summarize,
    BuildImagePrompt,
    AcquireImage,
    UploadImage,
    PublishPrimary,
    PublishSecondary,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Collect => "collect",
            Stage::Summarize => "summarize",
            Stage::BuildImagePrompt => "build-image-prompt",
            Stage::AcquireImage => "acquire-image",
            Stage::UploadImage => "upload-image",
            Stage::PublishPrimary => "publish-primary-channel",
            Stage::PublishSecondary => "publish-secondary-channel",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run that did not hit a fatal error ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing new in the window and the run was not forced.
    NoNews,
    /// Both targets accepted the post.
    Published,
    /// The secondary target accepted the post, the primary did not.
    PartiallyPublished { failed: String },
    Aborted { stage: Stage, reason: String },
}

impl RunOutcome {
    /// Whether the process should exit with status zero.
    pub fn is_success(&self) -> bool {
        !matches!(self, RunOutcome::Aborted { .. })
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::NoNews => f.write_str("no news in window"),
            RunOutcome::Published => f.write_str("published"),
            RunOutcome::PartiallyPublished { failed } => {
                write!(f, "partially published ({})", failed)
            }
            RunOutcome::Aborted { stage, reason } => write!(f, "aborted at {}: {}", stage, reason),
        }
    }
}

/// Capability handles used by a run. Injected so tests can swap in fakes.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn ChannelSource>,
    pub llm: Arc<dyn LlmProvider>,
    pub image_search: Arc<dyn ImageSearch>,
    pub downloader: Arc<dyn ImageDownloader>,
    pub asset_host: Arc<dyn AssetHost>,
    pub primary: Arc<dyn PublishTarget>,
    pub secondary: Arc<dyn PublishTarget>,
    pub events: Arc<dyn EventSink>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub channels: Vec<String>,
    pub limit_per_channel: usize,
    pub deny_words: Vec<String>,
    pub allow_keywords: Vec<String>,
    pub deny_keywords: Vec<String>,
    pub anchors: Vec<String>,
    pub generic_suffixes: Vec<String>,
    pub max_variants: usize,
    pub max_rounds: u32,
    pub default_topic: String,
    pub cover_dir: PathBuf,
    pub fallback_summary: String,
    pub fallback_image_brief: String,
    pub fallback_search_query: String,
    /// Local retries of each language-model prompt before its fallback
    pub llm_retry: RetryPolicy,
    pub retention_days: Option<u32>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            limit_per_channel: 20,
            deny_words: owned(DEFAULT_DENY_WORDS),
            allow_keywords: owned(DEFAULT_ALLOW_KEYWORDS),
            deny_keywords: owned(DEFAULT_DENY_KEYWORDS),
            anchors: owned(DEFAULT_ANCHORS),
            generic_suffixes: owned(DEFAULT_GENERIC_SUFFIXES),
            max_variants: DEFAULT_MAX_VARIANTS,
            max_rounds: DEFAULT_MAX_ROUNDS,
            default_topic: FALLBACK_SEARCH_QUERY.to_string(),
            cover_dir: PathBuf::from("images"),
            fallback_summary: FALLBACK_SUMMARY.to_string(),
            fallback_image_brief: FALLBACK_IMAGE_BRIEF.to_string(),
            fallback_search_query: FALLBACK_SEARCH_QUERY.to_string(),
            llm_retry: RetryPolicy::default(),
            retention_days: None,
        }
    }
}

impl PipelineSettings {
    /// Settings from the loaded configuration; missing keys keep their defaults.
    pub fn from_config(config: &Config) -> Self {
        let mut settings = Self::default();

        if let Some(sources) = &config.sources {
            settings.channels = sources.channels.clone();
            if let Some(limit) = sources.limit_per_channel {
                settings.limit_per_channel = limit;
            }
        }
        if let Some(filters) = &config.filters {
            if !filters.deny_words.is_empty() {
                settings.deny_words = filters.deny_words.clone();
            }
        }
        if let Some(images) = &config.images {
            if let Some(v) = &images.allow_keywords {
                settings.allow_keywords = v.clone();
            }
            if let Some(v) = &images.deny_keywords {
                settings.deny_keywords = v.clone();
            }
            if let Some(v) = &images.anchors {
                settings.anchors = v.clone();
            }
            if let Some(v) = &images.generic_suffixes {
                settings.generic_suffixes = v.clone();
            }
            if let Some(v) = images.max_variants {
                settings.max_variants = v.max(1);
            }
            if let Some(v) = images.max_rounds {
                settings.max_rounds = v.max(1);
            }
            if let Some(v) = &images.default_topic {
                settings.default_topic = v.clone();
            }
            if let Some(v) = &images.cover_dir {
                settings.cover_dir = PathBuf::from(v);
            }
        }
        if let Some(pipeline) = &config.pipeline {
            if let Some(v) = &pipeline.fallback_summary {
                settings.fallback_summary = v.clone();
            }
            if let Some(v) = &pipeline.fallback_image_brief {
                settings.fallback_image_brief = v.clone();
            }
            if let Some(v) = &pipeline.fallback_search_query {
                settings.fallback_search_query = v.clone();
            }
        }

        let backoff = config
            .retry
            .as_ref()
            .and_then(|r| r.backoff_seconds)
            .unwrap_or(3);
        let llm_attempts = config
            .llm
            .as_ref()
            .and_then(|l| l.attempts)
            .or_else(|| config.retry.as_ref().and_then(|r| r.attempts))
            .unwrap_or(3);
        settings.llm_retry = RetryPolicy::new(llm_attempts, std::time::Duration::from_secs(backoff));
        settings.retention_days = config.store.as_ref().and_then(|s| s.retention_days);

        settings
    }
}

/// Why a stage stopped. `Fatal` failures end the run with an error.
enum StageError {
    Failed(String),
    Fatal(anyhow::Error),
}

impl From<SelectionError> for StageError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::Store(e) => StageError::Fatal(e),
            other => StageError::Failed(other.to_string()),
        }
    }
}

struct Cover {
    image: SelectedImage,
    bytes: Vec<u8>,
    filename: String,
}

/// Stamps events with the run id and mode.
struct RunLog<'a> {
    run_id: String,
    mode: RunMode,
    sink: &'a dyn EventSink,
}

impl RunLog<'_> {
    fn emit(&self, stage: Stage, status: EventStatus, detail: Option<String>) {
        self.sink.record(&PipelineEvent {
            timestamp: Utc::now(),
            run_id: self.run_id.clone(),
            mode: self.mode.to_string(),
            stage: stage.as_str().to_string(),
            status,
            detail,
        });
    }

    fn finish(&self, outcome: RunOutcome) -> RunOutcome {
        let status = match &outcome {
            RunOutcome::Published | RunOutcome::PartiallyPublished { .. } => EventStatus::Succeeded,
            RunOutcome::NoNews => EventStatus::Skipped,
            RunOutcome::Aborted { .. } => EventStatus::Failed,
        };
        self.emit(Stage::Done, status, Some(outcome.to_string()));
        match &outcome {
            RunOutcome::Aborted { .. } => error!(run_id = %self.run_id, "run finished: {}", outcome),
            _ => info!(run_id = %self.run_id, "run finished: {}", outcome),
        }
        outcome
    }

    fn abort(&self, stage: Stage, reason: String) -> RunOutcome {
        error!(run_id = %self.run_id, %stage, "stage failed: {}", reason);
        self.emit(stage, EventStatus::Failed, Some(reason.clone()));
        self.finish(RunOutcome::Aborted { stage, reason })
    }

    fn fatal(&self, stage: Stage, err: anyhow::Error) -> anyhow::Error {
        self.emit(stage, EventStatus::Failed, Some(format!("{:#}", err)));
        err.context(format!("{} failed", stage))
    }
}

pub struct Pipeline {
    store: ContentStore,
    collaborators: Collaborators,
    settings: PipelineSettings,
    selector: ImageSelector,
}

impl Pipeline {
    pub fn new(store: ContentStore, collaborators: Collaborators, settings: PipelineSettings) -> Self {
        let filter = KeywordFilter::new(&settings.allow_keywords, &settings.deny_keywords);
        Self {
            store,
            collaborators,
            settings,
            selector: ImageSelector::new(filter),
        }
    }

    /// Replace the image selector, e.g. with a seeded one.
    pub fn with_selector(mut self, selector: ImageSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Execute one run for `window`. With `force`, an empty collection is
    /// replaced by the fallback summary instead of ending the run.
    pub async fn run(&self, mode: RunMode, window: TimeWindow, force: bool) -> Result<RunOutcome> {
        let run = RunLog {
            run_id: uuid::Uuid::new_v4().to_string(),
            mode,
            sink: self.collaborators.events.as_ref(),
        };
        info!(run_id = %run.run_id, %mode, %window, force, "run started");

        if let Some(days) = self.settings.retention_days {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
            let removed = self
                .store
                .prune(cutoff)
                .await
                .context("failed to prune content store")?;
            info!(removed, retention_days = days, "content store pruned");
        }

        // collect
        run.emit(Stage::Collect, EventStatus::Started, Some(window.to_string()));
        let dedup = MessageDeduplicator::new(window, &self.settings.deny_words);
        let posts = collect_new_posts(
            self.collaborators.source.as_ref(),
            &self.settings.channels,
            self.settings.limit_per_channel,
            &dedup,
            &self.store,
        )
        .await
        .map_err(|e| run.fatal(Stage::Collect, e))?;

        let summary = if posts.is_empty() {
            if !force {
                info!("no new messages in window");
                run.emit(Stage::Collect, EventStatus::Skipped, Some("no messages in window".into()));
                return Ok(run.finish(RunOutcome::NoNews));
            }
            warn!("no new messages in window, forced run uses the fallback summary");
            run.emit(
                Stage::Collect,
                EventStatus::Succeeded,
                Some("no messages, forced".into()),
            );
            run.emit(Stage::Summarize, EventStatus::Skipped, Some("fallback summary".into()));
            self.settings.fallback_summary.clone()
        } else {
            info!(count = posts.len(), "messages collected");
            run.emit(
                Stage::Collect,
                EventStatus::Succeeded,
                Some(format!("{} messages", posts.len())),
            );

            // summarize
            run.emit(Stage::Summarize, EventStatus::Started, None);
            let outcome = summarize_posts(
                self.collaborators.llm.as_ref(),
                &posts,
                self.settings.llm_retry,
                &self.settings.fallback_summary,
            )
            .await;
            if outcome.text.trim().is_empty() {
                return Ok(run.abort(Stage::Summarize, "summary is empty".into()));
            }
            run.emit(
                Stage::Summarize,
                EventStatus::Succeeded,
                Some(if outcome.fallback { "fallback".into() } else { "generated".into() }),
            );
            outcome.text
        };

        // build-image-prompt
        run.emit(Stage::BuildImagePrompt, EventStatus::Started, None);
        let brief = image_brief(
            self.collaborators.llm.as_ref(),
            &summary,
            self.settings.llm_retry,
            &self.settings.fallback_image_brief,
        )
        .await;
        let query = search_query(
            self.collaborators.llm.as_ref(),
            &brief.text,
            self.settings.llm_retry,
            &self.settings.fallback_search_query,
        )
        .await;
        info!(brief = %brief.text, query = %query.text, "image prompt built");
        run.emit(Stage::BuildImagePrompt, EventStatus::Succeeded, Some(query.text.clone()));

        // acquire-image
        run.emit(Stage::AcquireImage, EventStatus::Started, None);
        let cover = match self.acquire_image(&query.text).await {
            Ok(cover) => cover,
            Err(StageError::Failed(reason)) => return Ok(run.abort(Stage::AcquireImage, reason)),
            Err(StageError::Fatal(e)) => return Err(run.fatal(Stage::AcquireImage, e)),
        };
        run.emit(
            Stage::AcquireImage,
            EventStatus::Succeeded,
            Some(format!("{}:{}", cover.image.provider, cover.image.id)),
        );

        // upload-image
        run.emit(Stage::UploadImage, EventStatus::Started, None);
        let image_url = match self
            .collaborators
            .asset_host
            .upload_asset(&cover.bytes, &cover.filename)
            .await
        {
            Ok(url) => url,
            Err(e) => return Ok(run.abort(Stage::UploadImage, e.to_string())),
        };
        run.emit(Stage::UploadImage, EventStatus::Succeeded, Some(image_url.clone()));

        let payload = PostPayload {
            caption: summary,
            image_url,
            image_bytes: cover.bytes,
            filename: cover.filename,
        };

        // publish-primary-channel
        let primary = self.collaborators.primary.as_ref();
        run.emit(Stage::PublishPrimary, EventStatus::Started, Some(primary.name().to_string()));
        let primary_failure = match primary.create_post(&payload).await {
            Ok(()) => {
                run.emit(Stage::PublishPrimary, EventStatus::Succeeded, Some(primary.name().to_string()));
                None
            }
            Err(e) => {
                error!(target_name = primary.name(), unauthorized = e.is_unauthorized(), "primary publish failed: {}", e);
                run.emit(Stage::PublishPrimary, EventStatus::Failed, Some(e.to_string()));
                Some(format!("{}: {}", primary.name(), e))
            }
        };

        // publish-secondary-channel
        let secondary = self.collaborators.secondary.as_ref();
        run.emit(Stage::PublishSecondary, EventStatus::Started, Some(secondary.name().to_string()));
        if let Err(e) = secondary.create_post(&payload).await {
            return Ok(run.abort(Stage::PublishSecondary, format!("{}: {}", secondary.name(), e)));
        }
        run.emit(Stage::PublishSecondary, EventStatus::Succeeded, Some(secondary.name().to_string()));

        Ok(run.finish(match primary_failure {
            None => RunOutcome::Published,
            Some(failed) => RunOutcome::PartiallyPublished { failed },
        }))
    }

    /// Select, download and persist a cover.
    ///
    /// Round zero tries the plain variants; later rounds append a random
    /// generic suffix to each. A download whose bytes match a previously saved
    /// file is held back while one alternate selection is made. If that
    /// alternate is unavailable or also a repeat, the held cover is used.
    async fn acquire_image(&self, query: &str) -> Result<Cover, StageError> {
        let settings = &self.settings;
        let bases = vec![query.to_string(), settings.default_topic.clone()];
        let search = self.collaborators.image_search.as_ref();

        let mut held: Option<(SelectedImage, Vec<u8>, String)> = None;
        let mut last_reason = String::from("no query variants");
        let mut round = 0;

        while round < settings.max_rounds {
            let variants = if round == 0 {
                derive_variants(&bases, &settings.anchors, settings.max_variants)
            } else {
                let mut rng = rand::thread_rng();
                noisy_variants(
                    &bases,
                    &settings.anchors,
                    &settings.generic_suffixes,
                    settings.max_variants,
                    &mut rng,
                )
            };

            let image = match self.selector.select(&self.store, search, &variants).await {
                Ok(image) => image,
                Err(SelectionError::Exhausted { tried }) => {
                    if let Some(repeat) = held.take() {
                        warn!(tried, "no alternate image, accepting the repeat");
                        return self.keep_cover(repeat).await;
                    }
                    warn!(round, tried, "no usable image this round");
                    last_reason = format!("no suitable image after {} rounds", round + 1);
                    round += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let bytes = match self.collaborators.downloader.fetch_bytes(&image.url).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(url = %image.url, "cover download failed: {:#}", e);
                    if let Some(repeat) = held.take() {
                        return self.keep_cover(repeat).await;
                    }
                    last_reason = format!("download failed: {:#}", e);
                    round += 1;
                    continue;
                }
            };

            let hash = content_hash(&bytes);
            if self
                .store
                .has_file_hash(&hash)
                .await
                .map_err(StageError::Fatal)?
            {
                if let Some(repeat) = held.take() {
                    warn!(image_id = %image.id, "alternate is a repeat too, accepting the first");
                    return self.keep_cover(repeat).await;
                }
                warn!(image_id = %image.id, "downloaded bytes match a saved file, selecting another");
                held = Some((image, bytes, hash));
                continue;
            }

            return self.keep_cover((image, bytes, hash)).await;
        }

        Err(StageError::Failed(last_reason))
    }

    async fn keep_cover(
        &self,
        (image, bytes, hash): (SelectedImage, Vec<u8>, String),
    ) -> Result<Cover, StageError> {
        let filename = cover_filename(&image);
        self.save_cover(&filename, &hash, &bytes).await?;
        Ok(Cover { image, bytes, filename })
    }

    async fn save_cover(&self, filename: &str, hash: &str, bytes: &[u8]) -> Result<(), StageError> {
        let dir = &self.settings.cover_dir;
        let path = dir.join(filename);
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StageError::Failed(format!("cannot create {}: {}", dir.display(), e)))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StageError::Failed(format!("cannot write {}: {}", path.display(), e)))?;
        self.store
            .record_file(filename, hash)
            .await
            .map_err(StageError::Fatal)?;
        info!(path = %path.display(), bytes = bytes.len(), "cover saved");
        Ok(())
    }
}

/// `<provider>-<id>.jpg`, keeping only filename-safe characters of the id.
fn cover_filename(image: &SelectedImage) -> String {
    let safe = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    };
    format!("{}-{}.jpg", safe(&image.provider), safe(&image.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_filename_is_sanitized() {
        let image = SelectedImage {
            provider: "pexels".into(),
            id: "12/34".into(),
            url: String::new(),
            query: String::new(),
        };
        assert_eq!(cover_filename(&image), "pexels-12_34.jpg");
    }

    #[test]
    fn settings_from_config_override_defaults() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "x.db"

            [sources]
            channels = ["markettwits"]
            limit_per_channel = 5

            [images]
            max_rounds = 2
            cover_dir = "covers"

            [store]
            retention_days = 30
            "#,
        )
        .unwrap();

        let settings = PipelineSettings::from_config(&config);
        assert_eq!(settings.channels, vec!["markettwits"]);
        assert_eq!(settings.limit_per_channel, 5);
        assert_eq!(settings.max_rounds, 2);
        assert_eq!(settings.cover_dir, PathBuf::from("covers"));
        assert_eq!(settings.retention_days, Some(30));
        assert_eq!(settings.max_variants, DEFAULT_MAX_VARIANTS);
        assert!(settings.deny_words.iter().any(|w| w == "подпишись"));
    }

    #[test]
    fn publish_stages_name_their_channel() {
        assert_eq!(Stage::PublishPrimary.to_string(), "publish-primary-channel");
        assert_eq!(Stage::PublishSecondary.as_str(), "publish-secondary-channel");
    }

    #[test]
    fn only_aborted_runs_fail() {
        assert!(RunOutcome::NoNews.is_success());
        assert!(RunOutcome::PartiallyPublished { failed: "x".into() }.is_success());
        assert!(!RunOutcome::Aborted {
            stage: Stage::UploadImage,
            reason: "x".into()
        }
        .is_success());
    }
}
