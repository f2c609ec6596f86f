//! Task and orchestration event system.
//!
//! Implement [`EventHandler`] to observe a task as it moves through the
//! pipeline:
//!
//! - **Task lifecycle**: submission, every status transition, completion and
//!   failure
//! - **Phases**: phase boundaries and the per-agent outcome of each phase
//! - **Reviews**: reviewer decisions, and reviews that degraded to approve
//!   because the reviewer failed or timed out
//! - **Supplements**: the start of the single research supplement round
//!
//! The only method, [`on_event`](EventHandler::on_event), has a no-op default.
//! A handler is shared as `Arc<dyn EventHandler>`; register it on the
//! [`TaskManager`](crate::task_manager::TaskManager) and it reaches the
//! orchestrator and the phase coordinator as well.
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use forumflow::event::{EventHandler, ForumEvent};
//!
//! struct PrintHandler;
//!
//! #[async_trait]
//! impl EventHandler for PrintHandler {
//!     async fn on_event(&self, event: &ForumEvent) {
//!         match event {
//!             ForumEvent::StatusChanged { task_id, status, progress } => {
//!                 println!("{} -> {} ({}%)", task_id, status, progress);
//!             }
//!             ForumEvent::ReviewDegraded { task_id, stage, reason } => {
//!                 println!("{}: {} review skipped: {}", task_id, stage, reason);
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```

use crate::agent::{AgentFailure, Phase};
use crate::reviewer::{ReviewDecision, ReviewStage};
use crate::task::{ExecutionMode, TaskStatus};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;

/// Everything observable about a task while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ForumEvent {
    /// A task record was created.
    TaskSubmitted {
        task_id: String,
        query: String,
        mode: ExecutionMode,
    },

    /// The task moved to a new status. `progress` is the value actually
    /// persisted, which never decreases.
    StatusChanged {
        task_id: String,
        status: TaskStatus,
        progress: u8,
    },

    /// A phase was dispatched to `agents`.
    PhaseStarted {
        task_id: String,
        phase: Phase,
        agents: Vec<String>,
        /// `true` for a plan re-run or research supplement.
        rerun: bool,
    },

    /// Every dispatched agent finished, timed out or was cancelled.
    PhaseCompleted {
        task_id: String,
        phase: Phase,
        succeeded: usize,
        failed: usize,
    },

    AgentPhaseCompleted {
        task_id: String,
        agent_id: String,
        phase: Phase,
    },

    AgentPhaseFailed {
        task_id: String,
        agent_id: String,
        phase: Phase,
        failure: AgentFailure,
    },

    /// The reviewer returned a decision. `applied` is `false` when the
    /// decision was overridden because its budget was spent.
    ReviewCompleted {
        task_id: String,
        stage: ReviewStage,
        decision: ReviewDecision,
        applied: bool,
    },

    /// The reviewer failed or timed out and the task advanced without
    /// guidance.
    ReviewDegraded {
        task_id: String,
        stage: ReviewStage,
        reason: String,
    },

    /// The single research supplement round was claimed.
    SupplementStarted {
        task_id: String,
        agents: Vec<String>,
    },

    TaskCompleted {
        task_id: String,
        /// `true` when the result was served from the query cache.
        from_cache: bool,
    },

    TaskFailed {
        task_id: String,
        error: String,
    },
}

impl ForumEvent {
    pub fn task_id(&self) -> &str {
        match self {
            ForumEvent::TaskSubmitted { task_id, .. }
            | ForumEvent::StatusChanged { task_id, .. }
            | ForumEvent::PhaseStarted { task_id, .. }
            | ForumEvent::PhaseCompleted { task_id, .. }
            | ForumEvent::AgentPhaseCompleted { task_id, .. }
            | ForumEvent::AgentPhaseFailed { task_id, .. }
            | ForumEvent::ReviewCompleted { task_id, .. }
            | ForumEvent::ReviewDegraded { task_id, .. }
            | ForumEvent::SupplementStarted { task_id, .. }
            | ForumEvent::TaskCompleted { task_id, .. }
            | ForumEvent::TaskFailed { task_id, .. } => task_id,
        }
    }
}

/// Receives [`ForumEvent`]s. Handlers run inline on the emitting task, so keep
/// them quick. A handler that panics loses that one event; the task goes on.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, _event: &ForumEvent) {}
}

/// Deliver `event` to `handler`, absorbing a panic in the handler.
pub(crate) async fn notify(handler: &dyn EventHandler, event: &ForumEvent) {
    if let Err(payload) = AssertUnwindSafe(handler.on_event(event))
        .catch_unwind()
        .await
    {
        log::warn!(
            "[{}] event handler panicked: {}",
            event.task_id(),
            panic_message(payload.as_ref())
        );
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
