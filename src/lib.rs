//! # forumflow
//!
//! forumflow runs a research query through a forum of independent agents. Every agent
//! works through three phases (plan, research, report) on a shared blackboard, and an
//! orchestrator reviews the phase results in between, steering the agents with written
//! guidance. The final agent reports are synthesised into one report document.
//!
//! The crate provides:
//!
//! * **Blackboard**: [`blackboard::Blackboard`], a typed facade over a TTL key-value and list
//!   store ([`blackboard::BlackboardStore`], in-memory implementation included). All task
//!   state lives there under per-task keys.
//! * **Agents**: the [`agent::AgentRunner`] trait and a configuration-driven
//!   [`agent::AgentRegistry`].
//! * **Phase coordination**: [`coordinator::PhaseCoordinator`] fans a phase out over the
//!   roster on a bounded worker pool, with a phase deadline and cooperative cancellation.
//! * **Orchestration**: [`orchestrator::Orchestrator`] drives the task state machine: one plan
//!   revision at most, a single research supplement round, then report synthesis.
//! * **Review**: [`reviewer::Reviewer`] implementations, including [`reviewer::LlmReviewer`]
//!   backed by any [`ClientWrapper`] (an OpenAI-compatible client is bundled).
//! * **Task management**: [`TaskManager`] validates and submits queries, reports status and
//!   progress, lists tasks, serves results, and cancels or purges tasks. Repeated queries are
//!   answered from the [`query_cache`].
//!
//! ## Quick start
//!
//! ```rust
//! use async_trait::async_trait;
//! use forumflow::agent::{AgentFailure, AgentRegistry, AgentRunner, PhaseRequest, PhaseResult};
//! use forumflow::task::{ExecutionMode, TaskStatus};
//! use forumflow::TaskManager;
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl AgentRunner for Echo {
//!     async fn run_phase(&self, request: PhaseRequest) -> Result<PhaseResult, AgentFailure> {
//!         Ok(PhaseResult::new(json!(format!("{} of {:?}", request.phase, request.query))))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     forumflow::init_logger();
//!
//!     let registry = AgentRegistry::new()
//!         .with_agent("query", Arc::new(Echo))?
//!         .with_agent("media", Arc::new(Echo))?;
//!     let manager = TaskManager::builder(registry).build();
//!
//!     let receipt = manager.submit("EV battery market", ExecutionMode::Phased).await?;
//!     let view = manager
//!         .wait_until_finished(&receipt.task_id, Duration::from_secs(10))
//!         .await?;
//!     assert_eq!(view.status, TaskStatus::Completed);
//!
//!     let report = manager.get_result(&receipt.task_id).await?;
//!     assert_eq!(report["metadata"]["phased"], true);
//!     Ok(())
//! }
//! ```
//!
//! ## Logging
//!
//! Everything logs through the [`log`] facade with the task id as prefix. Call
//! [`init_logger`] to get `RUST_LOG` driven output from [`env_logger`].

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// ```rust
/// forumflow::init_logger();
/// forumflow::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `forumflow` module.
pub mod forumflow;

// Re-exporting key items for easier external access.
pub use forumflow::agent;
pub use forumflow::agent::{AgentRegistry, AgentRunner, Phase};
pub use forumflow::blackboard;
pub use forumflow::blackboard::{Blackboard, BlackboardStore, InMemoryStore};
pub use forumflow::client_wrapper;
pub use forumflow::client_wrapper::{ClientWrapper, Message, Role};
pub use forumflow::clients;
pub use forumflow::config;
pub use forumflow::config::ForumConfig;
pub use forumflow::coordinator;
pub use forumflow::event;
pub use forumflow::event::{EventHandler, ForumEvent};
pub use forumflow::forum;
pub use forumflow::orchestrator;
pub use forumflow::query_cache;
pub use forumflow::reviewer;
pub use forumflow::reviewer::Reviewer;
pub use forumflow::synthesis;
pub use forumflow::synthesis::ReportSynthesizer;
pub use forumflow::task;
pub use forumflow::task::{ExecutionMode, TaskStatus};
pub use forumflow::task_manager;
pub use forumflow::task_manager::TaskManager;
