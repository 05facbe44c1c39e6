//! Cover image selection.
//!
//! A run asks the search provider for a handful of query variants in order and
//! takes one random, unused, on-topic candidate from the first variant that has
//! any. Every chosen image is recorded in the content store at the moment it
//! is picked so that no later run can select it again.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::ContentStore;

pub mod download;
pub mod pexels;

pub const DEFAULT_ANCHORS: &[&str] = &[
    "stock market",
    "finance",
    "business",
    "economy",
    "banking",
    "investment",
];

pub const DEFAULT_GENERIC_SUFFIXES: &[&str] = &[
    "photo",
    "concept",
    "background",
    "closeup",
    "office",
    "city",
    "abstract",
    "desk",
    "modern",
    "professional",
];

pub const DEFAULT_ALLOW_KEYWORDS: &[&str] = &[
    "finance",
    "financial",
    "business",
    "money",
    "stock",
    "market",
    "bank",
    "economy",
    "economic",
    "invest",
    "currency",
    "coin",
    "crypto",
    "bitcoin",
    "chart",
    "graph",
    "trading",
    "trader",
    "office",
    "dollar",
    "euro",
    "ruble",
    "cash",
    "gold",
    "oil",
    "industry",
    "industrial",
    "factory",
    "technology",
    "computer",
    "analytics",
    "exchange",
    "wall street",
    "skyscraper",
];

pub const DEFAULT_DENY_KEYWORDS: &[&str] = &[
    "war",
    "weapon",
    "gun",
    "soldier",
    "military",
    "blood",
    "protest",
    "religio",
    "church",
    "mosque",
    "politic",
    "election",
    "nude",
    "child",
    "baby",
    "wedding",
    "halloween",
    "christmas",
];

pub const DEFAULT_MAX_VARIANTS: usize = 8;
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

/// One search result, before filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCandidate {
    /// Provider-native id
    pub id: String,
    pub url: String,
    /// Free-text labels: tags, alt text, slug words
    pub tags: Vec<String>,
}

/// A stock-photo search backend.
#[async_trait::async_trait]
pub trait ImageSearch: Send + Sync {
    /// Provider identifier stored alongside used image ids.
    fn provider(&self) -> &str;

    async fn search(&self, query: &str) -> Result<Vec<ImageCandidate>>;
}

/// Fetches the bytes behind an image URL.
#[async_trait::async_trait]
pub trait ImageDownloader: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

/// The image picked as cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedImage {
    pub provider: String,
    pub id: String,
    pub url: String,
    /// The variant that produced it
    pub query: String,
}

#[derive(Debug, Error)]
pub enum SelectionError {
    /// Every variant came back empty, failed, or offered only used or
    /// off-topic images.
    #[error("no suitable image found after {tried} query variants")]
    Exhausted { tried: usize },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Hex SHA-256 of downloaded image bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Ordered, deduplicated query variants: each base as-is, followed by the base
/// joined with every anchor it does not already mention. At most `max` items.
pub fn derive_variants(bases: &[String], anchors: &[String], max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut variants = Vec::new();

    let mut push = |variant: String, variants: &mut Vec<String>| {
        let variant = normalize_query(&variant);
        if !variant.is_empty() && seen.insert(variant.clone()) {
            variants.push(variant);
        }
    };

    for base in bases {
        let base = normalize_query(base);
        if base.is_empty() {
            continue;
        }
        push(base.clone(), &mut variants);
        for anchor in anchors {
            let anchor = normalize_query(anchor);
            if anchor.is_empty() || base.contains(&anchor) {
                continue;
            }
            push(format!("{} {}", base, anchor), &mut variants);
        }
    }

    variants.truncate(max);
    variants
}

/// Variants for a retry round: the regular variants, each with one random
/// generic suffix appended.
pub fn noisy_variants<R: Rng + ?Sized>(
    bases: &[String],
    anchors: &[String],
    suffixes: &[String],
    max: usize,
    rng: &mut R,
) -> Vec<String> {
    let regular = derive_variants(bases, anchors, max);
    if suffixes.is_empty() {
        return regular;
    }
    let noisy: Vec<String> = regular
        .iter()
        .filter_map(|v| suffixes.choose(rng).map(|s| format!("{} {}", v, s)))
        .collect();
    derive_variants(&noisy, &[], max)
}

fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Topical allow/deny keyword check over a candidate's labels.
///
/// Labels and terms are lowercased with punctuation folded to single spaces,
/// then a term matches when the labels contain it anywhere, so "market"
/// matches "supermarket" and "war" matches "postwar". A candidate is rejected
/// if any deny term matches, or if the allow list is non-empty and no allow
/// term matches.
#[derive(Debug, Clone, Default)]
pub struct KeywordFilter {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl KeywordFilter {
    pub fn new(allow: &[String], deny: &[String]) -> Self {
        let prepare = |terms: &[String]| -> Vec<String> {
            terms
                .iter()
                .map(|t| tokens(t).join(" "))
                .filter(|t| !t.is_empty())
                .collect()
        };
        Self {
            allow: prepare(allow),
            deny: prepare(deny),
        }
    }

    pub fn accepts(&self, candidate: &ImageCandidate) -> bool {
        let haystack = tokens(&candidate.tags.join(" ")).join(" ");
        let matches = |term: &String| haystack.contains(term.as_str());

        if self.deny.iter().any(matches) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(matches)
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Picks one unused, on-topic image per run.
pub struct ImageSelector {
    filter: KeywordFilter,
    rng: Mutex<StdRng>,
}

impl ImageSelector {
    pub fn new(filter: KeywordFilter) -> Self {
        Self {
            filter,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic tie-breaks for tests.
    pub fn with_seed(filter: KeywordFilter, seed: u64) -> Self {
        Self {
            filter,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Try `variants` in order and return the first acceptable image.
    ///
    /// A failing search skips to the next variant. Among the acceptable
    /// candidates of a variant one is chosen uniformly at random, recorded as
    /// used, and returned. Store failures abort the selection.
    pub async fn select(
        &self,
        store: &ContentStore,
        search: &dyn ImageSearch,
        variants: &[String],
    ) -> Result<SelectedImage, SelectionError> {
        let provider = search.provider().to_string();

        for (index, variant) in variants.iter().enumerate() {
            let candidates = match search.search(variant).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(variant = %variant, "image search failed: {:#}", e);
                    continue;
                }
            };

            let total = candidates.len();
            let mut seen_ids = HashSet::new();
            let mut eligible = Vec::new();
            for candidate in candidates {
                if !seen_ids.insert(candidate.id.clone()) || !self.filter.accepts(&candidate) {
                    continue;
                }
                if store.is_image_used(&provider, &candidate.id).await? {
                    continue;
                }
                eligible.push(candidate);
            }
            debug!(variant = %variant, total, eligible = eligible.len(), "image candidates filtered");

            let Some(chosen) = self.pick(eligible) else {
                continue;
            };

            store
                .record_image_used(&provider, &chosen.id, &chosen.url, variant)
                .await?;
            info!(
                provider = %provider,
                image_id = %chosen.id,
                variant = %variant,
                attempt = index + 1,
                "cover image selected"
            );
            return Ok(SelectedImage {
                provider,
                id: chosen.id,
                url: chosen.url,
                query: variant.clone(),
            });
        }

        Err(SelectionError::Exhausted {
            tried: variants.len(),
        })
    }

    fn pick(&self, mut eligible: Vec<ImageCandidate>) -> Option<ImageCandidate> {
        if eligible.is_empty() {
            return None;
        }
        let index = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..eligible.len()),
            Err(poisoned) => poisoned.into_inner().gen_range(0..eligible.len()),
        };
        Some(eligible.swap_remove(index))
    }
}
