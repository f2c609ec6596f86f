//! Agents, phases and the agent registry.
//!
//! An agent is an independent unit of work that turns a research query into a
//! plan, then research findings, then a report. Agents are stateless: every
//! input they need (prior phase outputs, guidance) is handed to them in a
//! [`PhaseRequest`] and every output they produce is written to the
//! blackboard by the [`PhaseCoordinator`](crate::coordinator::PhaseCoordinator).
//! A task can therefore be resumed from the blackboard after a restart.
//!
//! Which agents take part is decided by an [`AgentRegistry`] at submission
//! time, not by the orchestration state machine.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use forumflow::agent::{AgentFailure, AgentRegistry, AgentRunner, Phase, PhaseRequest, PhaseResult};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! struct KeywordAgent;
//!
//! #[async_trait]
//! impl AgentRunner for KeywordAgent {
//!     async fn run_phase(&self, request: PhaseRequest) -> Result<PhaseResult, AgentFailure> {
//!         Ok(match request.phase {
//!             Phase::Plan => PhaseResult::new(json!({ "keywords": [request.query] })),
//!             Phase::Research => PhaseResult::new(json!({ "result": "findings" })),
//!             _ => PhaseResult::report("# Report"),
//!         })
//!     }
//! }
//!
//! let mut registry = AgentRegistry::new();
//! registry.register("query", Arc::new(KeywordAgent)).unwrap();
//! assert_eq!(registry.agent_ids(), vec!["query".to_string()]);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// The phases an agent moves through, in order.
///
/// `Done` is terminal and never dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Plan,
    Research,
    Report,
    Done,
}

impl Phase {
    /// The three phases that agents actually execute.
    pub const RUNNABLE: [Phase; 3] = [Phase::Plan, Phase::Research, Phase::Report];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Research => "research",
            Phase::Report => "report",
            Phase::Done => "done",
        }
    }

    /// Title-cased label for log and forum messages.
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Plan => "Plan",
            Phase::Research => "Research",
            Phase::Report => "Report",
            Phase::Done => "Done",
        }
    }

    /// Position in the forward-only phase order.
    pub fn rank(&self) -> u8 {
        match self {
            Phase::Plan => 0,
            Phase::Research => 1,
            Phase::Report => 2,
            Phase::Done => 3,
        }
    }

    pub fn next(&self) -> Phase {
        match self {
            Phase::Plan => Phase::Research,
            Phase::Research => Phase::Report,
            Phase::Report | Phase::Done => Phase::Done,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outputs of earlier phases handed to the next phase. On a rerun the
/// output of the phase being re-run is included too, so the agent can extend
/// it.
///
/// A field is `None` when the agent did not produce that output (it failed,
/// timed out, or the phase has not run yet).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorOutputs {
    pub plan: Option<Value>,
    pub research: Option<Value>,
}

/// Everything an agent needs to execute one phase.
#[derive(Debug, Clone)]
pub struct PhaseRequest {
    pub task_id: String,
    pub agent_id: String,
    pub query: String,
    pub phase: Phase,
    pub prior: PriorOutputs,
    /// Reviewer guidance for this run, if any.
    pub guidance: Option<String>,
    /// `true` when the phase is being re-run after a plan revision or as a
    /// research supplement.
    pub rerun: bool,
}

/// Successful phase output.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseResult {
    /// Plan object, research object, or report text (as a JSON string).
    pub output: Value,
    /// Agent-local progress, 0..=100.
    pub progress: u8,
}

impl PhaseResult {
    /// A finished output (progress 100).
    pub fn new(output: Value) -> Self {
        Self {
            output,
            progress: 100,
        }
    }

    /// A report phase output.
    pub fn report(text: impl Into<String>) -> Self {
        Self::new(Value::String(text.into()))
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress.min(100);
        self
    }
}

/// Why an agent did not produce a phase output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The runner returned an error.
    Error,
    /// The phase deadline elapsed before the runner finished.
    Timeout,
    /// The task was cancelled while the runner was in flight.
    Cancelled,
    /// The runner panicked or its worker was lost.
    Crashed,
}

/// A per-agent, non-fatal phase failure.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl AgentFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Error,
            reason: reason.into(),
        }
    }

    pub fn timeout() -> Self {
        Self {
            kind: FailureKind::Timeout,
            reason: "timeout".to_string(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            reason: "cancelled".to_string(),
        }
    }

    pub fn crashed(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Crashed,
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::Timeout
    }
}

impl fmt::Display for AgentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Timeout => write!(f, "Agent timed out"),
            FailureKind::Cancelled => write!(f, "Agent cancelled"),
            FailureKind::Error => write!(f, "Agent failed: {}", self.reason),
            FailureKind::Crashed => write!(f, "Agent crashed: {}", self.reason),
        }
    }
}

impl Error for AgentFailure {}

/// Executes one phase for one agent.
///
/// Implementations wrap whatever actually does the work (an LLM-driven search
/// engine, a database crawler, a test double). They must not write to the
/// blackboard themselves.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_phase(&self, request: PhaseRequest) -> Result<PhaseResult, AgentFailure>;
}

/// Run state of an agent's current phase, as persisted on the blackboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl From<FailureKind> for AgentRunStatus {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout => AgentRunStatus::TimedOut,
            FailureKind::Cancelled => AgentRunStatus::Cancelled,
            FailureKind::Error | FailureKind::Crashed => AgentRunStatus::Failed,
        }
    }
}

/// Per-agent progress record (`task:{id}:agent:{name}:progress`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProgress {
    pub phase: Phase,
    pub status: AgentRunStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AgentProgress {
    pub fn new(phase: Phase, status: AgentRunStatus, progress: u8) -> Self {
        Self {
            phase,
            status,
            progress,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn failed(phase: Phase, failure: &AgentFailure) -> Self {
        Self {
            phase,
            status: failure.kind.into(),
            progress: 0,
            error: Some(failure.reason.clone()),
            updated_at: Utc::now(),
        }
    }

    /// Whether `phase` already finished successfully for this agent.
    pub fn completed(&self, phase: Phase) -> bool {
        self.phase == phase && self.status == AgentRunStatus::Completed
    }
}

/// Errors raised while building a registry or resolving a roster.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    DuplicateAgent(String),
    UnknownAgent(String),
    InvalidAgentId(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateAgent(id) => write!(f, "Agent already registered: {}", id),
            RegistryError::UnknownAgent(id) => write!(f, "Agent not found: {}", id),
            RegistryError::InvalidAgentId(id) => write!(f, "Invalid agent id: {:?}", id),
        }
    }
}

impl Error for RegistryError {}

/// One agent in a resolved roster.
#[derive(Clone)]
pub struct RosterEntry {
    pub id: String,
    pub runner: Arc<dyn AgentRunner>,
}

impl fmt::Debug for RosterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RosterEntry").field("id", &self.id).finish()
    }
}

/// The agents taking part in one task, frozen at submission time.
#[derive(Debug, Clone, Default)]
pub struct AgentRoster {
    entries: Vec<RosterEntry>,
}

impl AgentRoster {
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.id.clone()).collect()
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subset of this roster, keeping roster order. Unknown ids are ignored.
    pub fn subset(&self, ids: &[String]) -> AgentRoster {
        AgentRoster {
            entries: self
                .entries
                .iter()
                .filter(|entry| ids.contains(&entry.id))
                .cloned()
                .collect(),
        }
    }
}

/// Configuration-driven mapping from agent id to runner.
///
/// Agent ids become part of blackboard keys, so they must be non-empty and
/// free of `:` and whitespace. Registration order is preserved and is the
/// order agents are listed in prompts and inspection views.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: Vec<RosterEntry>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner under `id`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateAgent`] if the id is taken,
    /// [`RegistryError::InvalidAgentId`] if it cannot be used in a key.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        runner: Arc<dyn AgentRunner>,
    ) -> Result<(), RegistryError> {
        let id = id.into();
        if id.is_empty() || id.contains(':') || id.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidAgentId(id));
        }
        if self.contains(&id) {
            return Err(RegistryError::DuplicateAgent(id));
        }
        self.agents.push(RosterEntry { id, runner });
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_agent(
        mut self,
        id: impl Into<String>,
        runner: Arc<dyn AgentRunner>,
    ) -> Result<Self, RegistryError> {
        self.register(id, runner)?;
        Ok(self)
    }

    pub fn unregister(&mut self, id: &str) -> bool {
        let before = self.agents.len();
        self.agents.retain(|entry| entry.id != id);
        before != self.agents.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.iter().any(|entry| entry.id == id)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.iter().map(|entry| entry.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Snapshot every registered agent.
    pub fn roster(&self) -> AgentRoster {
        AgentRoster {
            entries: self.agents.clone(),
        }
    }

    /// Snapshot the named agents, in the order given.
    pub fn roster_for(&self, ids: &[&str]) -> Result<AgentRoster, RegistryError> {
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = self
                .agents
                .iter()
                .find(|entry| entry.id == *id)
                .ok_or_else(|| RegistryError::UnknownAgent(id.to_string()))?;
            entries.push(entry.clone());
        }
        Ok(AgentRoster { entries })
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agent_ids())
            .finish()
    }
}
