//! Shared task state.
//!
//! Everything agents, the orchestrator and the task manager share lives in a
//! [`BlackboardStore`]: a key/value and list store with per-key TTL, atomic list
//! append and a bounded atomic increment. Keys are namespaced per task
//! (`task:{id}:...`) so concurrent tasks never contend on a global lock.
//!
//! [`Blackboard`] is the typed facade over a store. It owns the key layout,
//! serialises records as JSON and enforces that an agent's phase only ever
//! moves forward.
//!
//! | Key | Contents |
//! |-----|----------|
//! | `task:{id}:agent:{name}:phase` | [`PhaseRecord`] |
//! | `task:{id}:agent:{name}:plan` / `research` / `report` | [`OutputRecord`] |
//! | `task:{id}:agent:{name}:progress` | [`AgentProgress`] |
//! | `task:{id}:guidance:plan` / `research` | [`GuidanceRecord`] |
//! | `task:{id}:supplement:round` | integer, 0 or 1 |
//! | `task:{id}:forum:log` | list of [`ForumLogEntry`] |
//!
//! # Example
//!
//! ```rust
//! use forumflow::agent::Phase;
//! use forumflow::blackboard::Blackboard;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let board = Blackboard::in_memory();
//! board.set_agent_phase("t1", "query", Phase::Plan).await?;
//! board.save_plan("t1", "query", json!({ "keywords": ["ev", "battery"] })).await?;
//! board.set_agent_phase("t1", "query", Phase::Research).await?;
//!
//! // Moving backwards is rejected.
//! assert!(board.set_agent_phase("t1", "query", Phase::Plan).await.is_err());
//!
//! assert!(board.try_start_supplement_round("t1").await?);
//! assert!(!board.try_start_supplement_round("t1").await?);
//! # Ok(())
//! # }
//! ```

pub mod memory;

pub use memory::{EntryMetadata, InMemoryStore};

use crate::agent::{AgentProgress, Phase};
use crate::forum::{format_forum_log, summarize_forum_log, ForumLogEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default lifetime of every task key: seven days.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Upper bound of `task:{id}:supplement:round`.
pub const MAX_SUPPLEMENT_ROUNDS: i64 = 1;

/// Errors raised by a store or by the typed facade.
#[derive(Debug, Clone, PartialEq)]
pub enum BlackboardError {
    /// The backend could not serve the request.
    Backend(String),
    /// The key holds a list where a value was expected, or the reverse.
    WrongType(String),
    /// A stored record could not be encoded or decoded.
    Serialization(String),
    /// An agent's phase was asked to move backwards.
    PhaseRegression { agent: String, from: Phase, to: Phase },
}

impl fmt::Display for BlackboardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlackboardError::Backend(msg) => write!(f, "Blackboard backend error: {}", msg),
            BlackboardError::WrongType(key) => {
                write!(f, "Operation against a key holding the wrong kind of value: {}", key)
            }
            BlackboardError::Serialization(msg) => {
                write!(f, "Blackboard serialization error: {}", msg)
            }
            BlackboardError::PhaseRegression { agent, from, to } => write!(
                f,
                "Agent {} cannot move from phase {} back to {}",
                agent, from, to
            ),
        }
    }
}

impl Error for BlackboardError {}

impl From<serde_json::Error> for BlackboardError {
    fn from(err: serde_json::Error) -> Self {
        BlackboardError::Serialization(err.to_string())
    }
}

/// Storage contract behind the [`Blackboard`].
///
/// Implementations must give strong read-after-write consistency per key and
/// make `append` and `incr_bounded` atomic. A `ttl` of `None` means the key
/// never expires; every write refreshes the key's TTL.
#[async_trait]
pub trait BlackboardStore: Send + Sync {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>)
        -> Result<(), BlackboardError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BlackboardError>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, BlackboardError>;

    /// Append to a list, creating it if needed. Returns the new length.
    async fn append(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<usize, BlackboardError>;

    /// The whole list in insertion order, empty if the key is absent.
    async fn range(&self, key: &str) -> Result<Vec<String>, BlackboardError>;

    /// Increment an integer key (absent counts as 0) unless it already reached
    /// `max`. Returns the new value, or `None` when the bound refused it.
    async fn incr_bounded(
        &self,
        key: &str,
        max: i64,
        ttl: Option<Duration>,
    ) -> Result<Option<i64>, BlackboardError>;

    /// Live keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BlackboardError>;
}

/// Key layout helpers.
pub mod keys {
    use crate::agent::Phase;
    use crate::reviewer::ReviewStage;

    pub fn task_prefix(task_id: &str) -> String {
        format!("task:{}:", task_id)
    }

    pub fn agent_phase(task_id: &str, agent: &str) -> String {
        format!("task:{}:agent:{}:phase", task_id, agent)
    }

    /// Output key of a runnable phase (`plan`, `research` or `report`).
    pub fn agent_output(task_id: &str, agent: &str, phase: Phase) -> String {
        format!("task:{}:agent:{}:{}", task_id, agent, phase.as_str())
    }

    pub fn agent_progress(task_id: &str, agent: &str) -> String {
        format!("task:{}:agent:{}:progress", task_id, agent)
    }

    pub fn guidance(task_id: &str, stage: ReviewStage) -> String {
        format!("task:{}:guidance:{}", task_id, stage.as_str())
    }

    pub fn supplement_round(task_id: &str) -> String {
        format!("task:{}:supplement:round", task_id)
    }

    pub fn forum_log(task_id: &str) -> String {
        format!("task:{}:forum:log", task_id)
    }

    pub fn task_meta(task_id: &str) -> String {
        format!("task:{}:meta", task_id)
    }

    pub fn task_result(task_id: &str) -> String {
        format!("task:{}:result", task_id)
    }

    pub const TASK_INDEX: &str = "tasks:all";
}

/// Current phase of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub updated_at: DateTime<Utc>,
}

/// Output an agent produced for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub agent: String,
    pub phase: Phase,
    pub output: Value,
    pub created_at: DateTime<Utc>,
}

/// Reviewer guidance written before a plan re-run or research supplement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceRecord {
    pub guidance: String,
    /// Agents the reviewer singled out. Empty means "everyone".
    #[serde(default)]
    pub flagged_agents: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Both guidance slots of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuidanceSnapshot {
    pub plan: Option<String>,
    pub research: Option<String>,
}

/// Phase inspection view of one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    pub task_id: String,
    pub phases: BTreeMap<String, Option<Phase>>,
    pub plans: BTreeMap<String, Option<Value>>,
    pub research: BTreeMap<String, Option<Value>>,
    pub reports: BTreeMap<String, Option<Value>>,
    pub progress: BTreeMap<String, Option<AgentProgress>>,
    pub supplement_round: i64,
    pub guidance: GuidanceSnapshot,
    pub forum_log: Vec<ForumLogEntry>,
}

/// Typed, namespaced view over a [`BlackboardStore`].
///
/// Cloning shares the underlying store.
#[derive(Clone)]
pub struct Blackboard {
    store: Arc<dyn BlackboardStore>,
    ttl: Duration,
}

impl fmt::Debug for Blackboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blackboard").field("ttl", &self.ttl).finish()
    }
}

impl Blackboard {
    pub fn new(store: Arc<dyn BlackboardStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_TTL,
        }
    }

    /// A blackboard over a fresh [`InMemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The raw store, for records the facade does not model.
    pub fn store(&self) -> &Arc<dyn BlackboardStore> {
        &self.store
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), BlackboardError> {
        let encoded = serde_json::to_string(value)?;
        self.store.put(key, encoded, Some(self.ttl)).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BlackboardError> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    // ── agent phase ──────────────────────────────────────────────────────

    /// Record the agent's current phase.
    ///
    /// Re-entering the current phase is allowed (plan revise, research
    /// supplement). Moving to an earlier phase fails with
    /// [`BlackboardError::PhaseRegression`].
    pub async fn set_agent_phase(
        &self,
        task_id: &str,
        agent: &str,
        phase: Phase,
    ) -> Result<(), BlackboardError> {
        let key = keys::agent_phase(task_id, agent);
        if let Some(current) = self.get_json::<PhaseRecord>(&key).await? {
            if current.phase.rank() > phase.rank() {
                return Err(BlackboardError::PhaseRegression {
                    agent: agent.to_string(),
                    from: current.phase,
                    to: phase,
                });
            }
        }
        self.put_json(
            &key,
            &PhaseRecord {
                phase,
                updated_at: Utc::now(),
            },
        )
        .await
    }

    pub async fn get_agent_phase(
        &self,
        task_id: &str,
        agent: &str,
    ) -> Result<Option<Phase>, BlackboardError> {
        Ok(self
            .get_json::<PhaseRecord>(&keys::agent_phase(task_id, agent))
            .await?
            .map(|record| record.phase))
    }

    // ── phase outputs ────────────────────────────────────────────────────

    /// Store an agent's output for a runnable phase, replacing any earlier one.
    pub async fn save_output(
        &self,
        task_id: &str,
        agent: &str,
        phase: Phase,
        output: Value,
    ) -> Result<(), BlackboardError> {
        let record = OutputRecord {
            agent: agent.to_string(),
            phase,
            output,
            created_at: Utc::now(),
        };
        self.put_json(&keys::agent_output(task_id, agent, phase), &record)
            .await
    }

    pub async fn get_output(
        &self,
        task_id: &str,
        agent: &str,
        phase: Phase,
    ) -> Result<Option<Value>, BlackboardError> {
        Ok(self
            .get_json::<OutputRecord>(&keys::agent_output(task_id, agent, phase))
            .await?
            .map(|record| record.output))
    }

    pub async fn save_plan(
        &self,
        task_id: &str,
        agent: &str,
        plan: Value,
    ) -> Result<(), BlackboardError> {
        self.save_output(task_id, agent, Phase::Plan, plan).await
    }

    pub async fn get_plan(&self, task_id: &str, agent: &str) -> Result<Option<Value>, BlackboardError> {
        self.get_output(task_id, agent, Phase::Plan).await
    }

    pub async fn save_research(
        &self,
        task_id: &str,
        agent: &str,
        research: Value,
    ) -> Result<(), BlackboardError> {
        self.save_output(task_id, agent, Phase::Research, research)
            .await
    }

    pub async fn get_research(
        &self,
        task_id: &str,
        agent: &str,
    ) -> Result<Option<Value>, BlackboardError> {
        self.get_output(task_id, agent, Phase::Research).await
    }

    pub async fn save_report(
        &self,
        task_id: &str,
        agent: &str,
        report: Value,
    ) -> Result<(), BlackboardError> {
        self.save_output(task_id, agent, Phase::Report, report).await
    }

    pub async fn get_report(
        &self,
        task_id: &str,
        agent: &str,
    ) -> Result<Option<Value>, BlackboardError> {
        self.get_output(task_id, agent, Phase::Report).await
    }

    /// Every available output of `phase` for the given agents, in roster order.
    pub async fn collect_outputs(
        &self,
        task_id: &str,
        agents: &[String],
        phase: Phase,
    ) -> Result<Vec<(String, Value)>, BlackboardError> {
        let mut outputs = Vec::new();
        for agent in agents {
            if let Some(output) = self.get_output(task_id, agent, phase).await? {
                outputs.push((agent.clone(), output));
            }
        }
        Ok(outputs)
    }

    // ── progress ─────────────────────────────────────────────────────────

    pub async fn save_agent_progress(
        &self,
        task_id: &str,
        agent: &str,
        progress: &AgentProgress,
    ) -> Result<(), BlackboardError> {
        self.put_json(&keys::agent_progress(task_id, agent), progress)
            .await
    }

    pub async fn get_agent_progress(
        &self,
        task_id: &str,
        agent: &str,
    ) -> Result<Option<AgentProgress>, BlackboardError> {
        self.get_json(&keys::agent_progress(task_id, agent)).await
    }

    // ── guidance and supplement budget ───────────────────────────────────

    pub async fn save_guidance(
        &self,
        task_id: &str,
        stage: crate::reviewer::ReviewStage,
        guidance: &str,
        flagged_agents: &[String],
    ) -> Result<(), BlackboardError> {
        let record = GuidanceRecord {
            guidance: guidance.to_string(),
            flagged_agents: flagged_agents.to_vec(),
            created_at: Utc::now(),
        };
        self.put_json(&keys::guidance(task_id, stage), &record).await
    }

    pub async fn get_guidance(
        &self,
        task_id: &str,
        stage: crate::reviewer::ReviewStage,
    ) -> Result<Option<GuidanceRecord>, BlackboardError> {
        self.get_json(&keys::guidance(task_id, stage)).await
    }

    /// Supplement rounds started so far (0 or 1).
    pub async fn supplement_round(&self, task_id: &str) -> Result<i64, BlackboardError> {
        let key = keys::supplement_round(task_id);
        match self.store.get(&key).await? {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|_| BlackboardError::WrongType(key)),
            None => Ok(0),
        }
    }

    /// Claim the single supplement round. Returns `false` if it was already
    /// taken; the check and the increment are one atomic store operation.
    pub async fn try_start_supplement_round(&self, task_id: &str) -> Result<bool, BlackboardError> {
        let started = self
            .store
            .incr_bounded(
                &keys::supplement_round(task_id),
                MAX_SUPPLEMENT_ROUNDS,
                Some(self.ttl),
            )
            .await?;
        Ok(started.is_some())
    }

    // ── forum log ────────────────────────────────────────────────────────

    /// Append an entry. Returns the new log length.
    pub async fn append_forum_log(
        &self,
        task_id: &str,
        speaker: &str,
        content: &str,
    ) -> Result<usize, BlackboardError> {
        let entry = ForumLogEntry::new(speaker, content);
        let encoded = serde_json::to_string(&entry)?;
        log::debug!("[{}] forum <{}> {}", task_id, speaker, content);
        self.store
            .append(&keys::forum_log(task_id), encoded, Some(self.ttl))
            .await
    }

    pub async fn forum_log(&self, task_id: &str) -> Result<Vec<ForumLogEntry>, BlackboardError> {
        self.store
            .range(&keys::forum_log(task_id))
            .await?
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(BlackboardError::from))
            .collect()
    }

    /// The whole log as text, one line per entry.
    pub async fn forum_log_text(&self, task_id: &str) -> Result<String, BlackboardError> {
        Ok(format_forum_log(&self.forum_log(task_id).await?))
    }

    /// Condensed log for report synthesis. See [`summarize_forum_log`].
    pub async fn forum_log_summary(
        &self,
        task_id: &str,
        max_chars: usize,
    ) -> Result<String, BlackboardError> {
        Ok(summarize_forum_log(
            &self.forum_log(task_id).await?,
            max_chars,
        ))
    }

    // ── inspection and cleanup ───────────────────────────────────────────

    /// Phase inspection view for the given agents.
    pub async fn task_snapshot(
        &self,
        task_id: &str,
        agents: &[String],
    ) -> Result<PhaseSnapshot, BlackboardError> {
        use crate::reviewer::ReviewStage;

        let mut snapshot = PhaseSnapshot {
            task_id: task_id.to_string(),
            ..PhaseSnapshot::default()
        };
        for agent in agents {
            snapshot
                .phases
                .insert(agent.clone(), self.get_agent_phase(task_id, agent).await?);
            snapshot
                .plans
                .insert(agent.clone(), self.get_plan(task_id, agent).await?);
            snapshot
                .research
                .insert(agent.clone(), self.get_research(task_id, agent).await?);
            snapshot
                .reports
                .insert(agent.clone(), self.get_report(task_id, agent).await?);
            snapshot
                .progress
                .insert(agent.clone(), self.get_agent_progress(task_id, agent).await?);
        }
        snapshot.supplement_round = self.supplement_round(task_id).await?;
        snapshot.guidance = GuidanceSnapshot {
            plan: self
                .get_guidance(task_id, ReviewStage::Plan)
                .await?
                .map(|record| record.guidance),
            research: self
                .get_guidance(task_id, ReviewStage::Research)
                .await?
                .map(|record| record.guidance),
        };
        snapshot.forum_log = self.forum_log(task_id).await?;
        Ok(snapshot)
    }

    /// Delete every key of a task. Returns how many keys were removed.
    pub async fn clear_task(&self, task_id: &str) -> Result<usize, BlackboardError> {
        let mut removed = 0;
        for key in self
            .store
            .keys_with_prefix(&keys::task_prefix(task_id))
            .await?
        {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
