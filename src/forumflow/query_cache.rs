//! Completed-query result cache.
//!
//! Finished reports are cached so that a repeated (or nearly repeated) query
//! completes immediately instead of running every agent again. Entries are
//! kept apart per execution mode, since a phased and a standard report differ.
//! Two keys are written per query:
//!
//! - `cache:query:{mode}:{sha256}` holds the report document (exact match)
//! - `cache:query:{mode}:{sha256}:meta` holds the query and its tokens
//!   (similarity match)
//!
//! A lookup first tries the exact hash, then compares token sets of up to
//! `scan_limit` cached queries of the same mode and returns the best one whose
//! Jaccard similarity reaches the threshold.

use crate::blackboard::{BlackboardError, BlackboardStore};
use crate::task::ExecutionMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const KEY_PREFIX: &str = "cache:query:";
const META_SUFFIX: &str = ":meta";

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "the", "to", "with", "what", "how", "about",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheMeta {
    query: String,
    tokens: Vec<String>,
    result_key: String,
    created_at: DateTime<Utc>,
}

/// How a cached result matched.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheMatch {
    Exact,
    Similar { cached_query: String, similarity: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub result: Value,
    pub matched: CacheMatch,
}

/// Hex SHA-256 of the query text.
pub fn query_hash(query: &str) -> String {
    let digest = Sha256::digest(query.as_bytes());
    digest.iter().map(|byte| format!("{:02x}", byte)).collect()
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32, 0x2E80..=0x9FFF | 0xAC00..=0xD7AF | 0xF900..=0xFAFF)
}

/// Tokens used for similarity matching.
///
/// Latin words are lower-cased, single letters and stopwords dropped. Text
/// without word boundaries (CJK) contributes one token per character.
///
/// ```
/// use forumflow::query_cache::tokenize;
///
/// let tokens = tokenize("The EV battery market, 2024");
/// assert!(tokens.contains("battery"));
/// assert!(!tokens.contains("the"));
/// assert_eq!(tokenize("电池").len(), 2);
/// ```
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let mut word = String::new();

    let flush = |word: &mut String, tokens: &mut BTreeSet<String>| {
        if word.chars().count() > 1 && !STOPWORDS.contains(&word.as_str()) {
            tokens.insert(word.clone());
        }
        word.clear();
    };

    for c in text.chars() {
        if is_cjk(c) {
            flush(&mut word, &mut tokens);
            tokens.insert(c.to_string());
        } else if c.is_alphanumeric() {
            word.extend(c.to_lowercase());
        } else {
            flush(&mut word, &mut tokens);
        }
    }
    flush(&mut word, &mut tokens);
    tokens
}

/// Jaccard similarity of two token sets; 0 when either is empty.
pub fn jaccard_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Query result cache over a [`BlackboardStore`].
#[derive(Clone)]
pub struct QueryCache {
    store: Arc<dyn BlackboardStore>,
    ttl: Duration,
    threshold: f64,
    scan_limit: usize,
}

impl QueryCache {
    pub fn new(store: Arc<dyn BlackboardStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            threshold: 0.8,
            scan_limit: 100,
        }
    }

    pub fn with_similarity(mut self, threshold: f64, scan_limit: usize) -> Self {
        self.threshold = threshold;
        self.scan_limit = scan_limit;
        self
    }

    fn mode_prefix(mode: ExecutionMode) -> String {
        format!("{}{}:", KEY_PREFIX, mode)
    }

    fn result_key(mode: ExecutionMode, hash: &str) -> String {
        format!("{}{}", Self::mode_prefix(mode), hash)
    }

    /// Cache `result` as the answer to `query` run in `mode`.
    pub async fn store(
        &self,
        query: &str,
        mode: ExecutionMode,
        result: &Value,
    ) -> Result<(), BlackboardError> {
        let hash = query_hash(query);
        let result_key = Self::result_key(mode, &hash);
        self.store
            .put(&result_key, serde_json::to_string(result)?, Some(self.ttl))
            .await?;
        let meta = CacheMeta {
            query: query.to_string(),
            tokens: tokenize(query).into_iter().collect(),
            result_key: result_key.clone(),
            created_at: Utc::now(),
        };
        self.store
            .put(
                &format!("{}{}", result_key, META_SUFFIX),
                serde_json::to_string(&meta)?,
                Some(self.ttl),
            )
            .await?;
        log::debug!("cached result for query {:?} under {}", query, result_key);
        Ok(())
    }

    /// Find a cached `mode` result for `query`, exact match first.
    pub async fn lookup(
        &self,
        query: &str,
        mode: ExecutionMode,
    ) -> Result<Option<CacheHit>, BlackboardError> {
        let exact_key = Self::result_key(mode, &query_hash(query));
        if let Some(raw) = self.store.get(&exact_key).await? {
            return Ok(Some(CacheHit {
                result: serde_json::from_str(&raw)?,
                matched: CacheMatch::Exact,
            }));
        }

        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Ok(None);
        }

        let mut best: Option<(f64, CacheMeta)> = None;
        let meta_keys = self
            .store
            .keys_with_prefix(&Self::mode_prefix(mode))
            .await?
            .into_iter()
            .filter(|key| key.ends_with(META_SUFFIX))
            .take(self.scan_limit);
        for key in meta_keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let meta: CacheMeta = match serde_json::from_str(&raw) {
                Ok(meta) => meta,
                Err(err) => {
                    log::warn!("skipping unreadable cache entry {}: {}", key, err);
                    continue;
                }
            };
            let cached_tokens: BTreeSet<String> = meta.tokens.iter().cloned().collect();
            let similarity = jaccard_similarity(&tokens, &cached_tokens);
            if similarity >= self.threshold
                && best.as_ref().map_or(true, |(score, _)| similarity > *score)
            {
                best = Some((similarity, meta));
            }
        }

        let Some((similarity, meta)) = best else {
            return Ok(None);
        };
        let Some(raw) = self.store.get(&meta.result_key).await? else {
            return Ok(None);
        };
        log::info!(
            "query {:?} matched cached query {:?} (similarity {:.2})",
            query,
            meta.query,
            similarity
        );
        Ok(Some(CacheHit {
            result: serde_json::from_str(&raw)?,
            matched: CacheMatch::Similar {
                cached_query: meta.query,
                similarity,
            },
        }))
    }
}
