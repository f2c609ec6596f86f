//! Configuration for forumflow.
//!
//! [`ForumConfig`] gathers every tunable of the pipeline: worker pool size,
//! phase and review deadlines, key lifetimes, input limits, the revise and
//! supplement budgets and the query cache. Build it in code with the `with_*`
//! helpers, or overlay `FORUM_*` environment variables with
//! [`ForumConfig::from_env`]. No config-file format is involved.
//!
//! # Example
//!
//! ```rust
//! use forumflow::config::{ForumConfig, SupplementScope};
//! use std::time::Duration;
//!
//! let config = ForumConfig::default()
//!     .with_worker_concurrency(8)
//!     .with_research_timeout(Duration::from_secs(900))
//!     .with_supplement_scope(SupplementScope::AllAgents);
//!
//! assert_eq!(config.worker_concurrency, 8);
//! assert_eq!(config.plan_timeout, Duration::from_secs(600));
//! ```

use crate::agent::Phase;
use crate::reviewer::ReviewStage;
use std::str::FromStr;
use std::time::Duration;

/// Which agents re-run research during a supplement round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupplementScope {
    /// Only the agents the reviewer flagged; every agent if none were flagged.
    #[default]
    FlaggedOnly,
    AllAgents,
}

impl FromStr for SupplementScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "flagged" | "flagged_only" => Ok(SupplementScope::FlaggedOnly),
            "all" | "all_agents" => Ok(SupplementScope::AllAgents),
            other => Err(format!("unknown supplement scope: {}", other)),
        }
    }
}

/// Pipeline settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ForumConfig {
    /// Agent phases allowed to run at once, across all tasks.
    pub worker_concurrency: usize,
    pub plan_timeout: Duration,
    pub research_timeout: Duration,
    pub report_timeout: Duration,
    pub plan_review_timeout: Duration,
    pub research_review_timeout: Duration,
    /// Lifetime of every blackboard key.
    pub blackboard_ttl: Duration,
    /// Lifetime of query cache entries.
    pub result_cache_ttl: Duration,
    /// Longest accepted query, in characters.
    pub max_query_chars: usize,
    /// Budget of the forum log summary handed to the synthesizer.
    pub forum_summary_chars: usize,
    /// Plan revisions allowed per task.
    pub plan_revise_budget: u32,
    pub supplement_scope: SupplementScope,
    pub query_cache_enabled: bool,
    /// Token Jaccard similarity at which a cached result is reused.
    pub similarity_threshold: f64,
    /// Cached queries compared per similarity lookup.
    pub similarity_scan_limit: usize,
}

impl Default for ForumConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            plan_timeout: Duration::from_secs(600),
            research_timeout: Duration::from_secs(1800),
            report_timeout: Duration::from_secs(600),
            plan_review_timeout: Duration::from_secs(300),
            research_review_timeout: Duration::from_secs(300),
            blackboard_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            result_cache_ttl: Duration::from_secs(24 * 60 * 60),
            max_query_chars: 500,
            forum_summary_chars: 2000,
            plan_revise_budget: 1,
            supplement_scope: SupplementScope::FlaggedOnly,
            query_cache_enabled: true,
            similarity_threshold: 0.8,
            similarity_scan_limit: 100,
        }
    }
}

impl ForumConfig {
    /// Defaults overlaid with `FORUM_*` environment variables.
    ///
    /// Durations are whole seconds. Unparseable values are logged and ignored.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `FORUM_WORKER_CONCURRENCY` | `worker_concurrency` |
    /// | `FORUM_PLAN_TIMEOUT_SECS` | `plan_timeout` |
    /// | `FORUM_RESEARCH_TIMEOUT_SECS` | `research_timeout` |
    /// | `FORUM_REPORT_TIMEOUT_SECS` | `report_timeout` |
    /// | `FORUM_REVIEW_TIMEOUT_SECS` | both review timeouts |
    /// | `FORUM_BLACKBOARD_TTL_SECS` | `blackboard_ttl` |
    /// | `FORUM_RESULT_CACHE_TTL_SECS` | `result_cache_ttl` |
    /// | `FORUM_MAX_QUERY_CHARS` | `max_query_chars` |
    /// | `FORUM_SUMMARY_CHARS` | `forum_summary_chars` |
    /// | `FORUM_PLAN_REVISE_BUDGET` | `plan_revise_budget` |
    /// | `FORUM_SUPPLEMENT_SCOPE` | `supplement_scope` (`flagged` / `all`) |
    /// | `FORUM_QUERY_CACHE` | `query_cache_enabled` (`true` / `false`) |
    /// | `FORUM_SIMILARITY_THRESHOLD` | `similarity_threshold` |
    pub fn from_env() -> Self {
        Self::default().overlay(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any lookup, using the variable names of
    /// [`from_env`](Self::from_env).
    pub fn overlay<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<T> {
            let raw = lookup(name)?;
            match raw.trim().parse::<T>() {
                Ok(value) => Some(value),
                Err(_) => {
                    log::warn!("ignoring {}: cannot parse {:?}", name, raw);
                    None
                }
            }
        }
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        let secs = |name: &str| parsed::<u64>(lookup, name).map(Duration::from_secs);

        if let Some(value) = parsed::<usize>(lookup, "FORUM_WORKER_CONCURRENCY") {
            self.worker_concurrency = value.max(1);
        }
        if let Some(value) = secs("FORUM_PLAN_TIMEOUT_SECS") {
            self.plan_timeout = value;
        }
        if let Some(value) = secs("FORUM_RESEARCH_TIMEOUT_SECS") {
            self.research_timeout = value;
        }
        if let Some(value) = secs("FORUM_REPORT_TIMEOUT_SECS") {
            self.report_timeout = value;
        }
        if let Some(value) = secs("FORUM_REVIEW_TIMEOUT_SECS") {
            self.plan_review_timeout = value;
            self.research_review_timeout = value;
        }
        if let Some(value) = secs("FORUM_BLACKBOARD_TTL_SECS") {
            self.blackboard_ttl = value;
        }
        if let Some(value) = secs("FORUM_RESULT_CACHE_TTL_SECS") {
            self.result_cache_ttl = value;
        }
        if let Some(value) = parsed::<usize>(lookup, "FORUM_MAX_QUERY_CHARS") {
            self.max_query_chars = value;
        }
        if let Some(value) = parsed::<usize>(lookup, "FORUM_SUMMARY_CHARS") {
            self.forum_summary_chars = value;
        }
        if let Some(value) = parsed::<u32>(lookup, "FORUM_PLAN_REVISE_BUDGET") {
            self.plan_revise_budget = value;
        }
        if let Some(value) = parsed::<SupplementScope>(lookup, "FORUM_SUPPLEMENT_SCOPE") {
            self.supplement_scope = value;
        }
        if let Some(value) = parsed::<bool>(lookup, "FORUM_QUERY_CACHE") {
            self.query_cache_enabled = value;
        }
        if let Some(value) = parsed::<f64>(lookup, "FORUM_SIMILARITY_THRESHOLD") {
            self.similarity_threshold = value.clamp(0.0, 1.0);
        }
        self
    }

    /// Deadline for one runnable phase. `Done` never runs and gets zero.
    pub fn phase_timeout(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Plan => self.plan_timeout,
            Phase::Research => self.research_timeout,
            Phase::Report => self.report_timeout,
            Phase::Done => Duration::ZERO,
        }
    }

    pub fn review_timeout(&self, stage: ReviewStage) -> Duration {
        match stage {
            ReviewStage::Plan => self.plan_review_timeout,
            ReviewStage::Research => self.research_review_timeout,
        }
    }

    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers.max(1);
        self
    }

    pub fn with_plan_timeout(mut self, timeout: Duration) -> Self {
        self.plan_timeout = timeout;
        self
    }

    pub fn with_research_timeout(mut self, timeout: Duration) -> Self {
        self.research_timeout = timeout;
        self
    }

    pub fn with_report_timeout(mut self, timeout: Duration) -> Self {
        self.report_timeout = timeout;
        self
    }

    /// Same deadline for every phase.
    pub fn with_phase_timeout(self, timeout: Duration) -> Self {
        self.with_plan_timeout(timeout)
            .with_research_timeout(timeout)
            .with_report_timeout(timeout)
    }

    /// Same deadline for both reviews.
    pub fn with_review_timeout(mut self, timeout: Duration) -> Self {
        self.plan_review_timeout = timeout;
        self.research_review_timeout = timeout;
        self
    }

    pub fn with_blackboard_ttl(mut self, ttl: Duration) -> Self {
        self.blackboard_ttl = ttl;
        self
    }

    pub fn with_result_cache_ttl(mut self, ttl: Duration) -> Self {
        self.result_cache_ttl = ttl;
        self
    }

    pub fn with_max_query_chars(mut self, max: usize) -> Self {
        self.max_query_chars = max;
        self
    }

    pub fn with_forum_summary_chars(mut self, max: usize) -> Self {
        self.forum_summary_chars = max;
        self
    }

    pub fn with_plan_revise_budget(mut self, budget: u32) -> Self {
        self.plan_revise_budget = budget;
        self
    }

    pub fn with_supplement_scope(mut self, scope: SupplementScope) -> Self {
        self.supplement_scope = scope;
        self
    }

    pub fn with_query_cache(mut self, enabled: bool) -> Self {
        self.query_cache_enabled = enabled;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold.clamp(0.0, 1.0);
        self
    }
}
