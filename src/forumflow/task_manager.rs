//! Task submission and lookup.
//!
//! [`TaskManager`] is the entry point applications use: it validates and
//! records a query, spawns the orchestrator on the tokio runtime and answers
//! status, result, listing and inspection requests while tasks run.
//!
//! ```rust,no_run
//! use forumflow::agent::AgentRegistry;
//! use forumflow::task::ExecutionMode;
//! use forumflow::task_manager::TaskManager;
//! use std::time::Duration;
//!
//! # async fn demo(registry: AgentRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! let manager = TaskManager::builder(registry).build();
//! let receipt = manager.submit("EV battery market outlook", ExecutionMode::Phased).await?;
//! let view = manager
//!     .wait_until_finished(&receipt.task_id, Duration::from_secs(3600))
//!     .await?;
//! println!("{} finished as {}", view.task_id, view.status);
//! # Ok(())
//! # }
//! ```

use crate::agent::{AgentProgress, AgentRegistry};
use crate::blackboard::{Blackboard, BlackboardError, BlackboardStore, InMemoryStore, PhaseSnapshot};
use crate::config::ForumConfig;
use crate::coordinator::{deadline_after, CancelFlag, PhaseCoordinator};
use crate::event::{notify, EventHandler, ForumEvent};
use crate::orchestrator::{Orchestrator, TaskRun};
use crate::query_cache::QueryCache;
use crate::reviewer::{AutoApproveReviewer, Reviewer};
use crate::synthesis::{MergeSynthesizer, ReportSynthesizer};
use crate::task::{ExecutionMode, TaskRecord, TaskStats, TaskStatus, TaskStore, TaskView};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

/// Largest page [`TaskManager::list`] returns.
pub const MAX_PAGE_SIZE: usize = 100;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const MIN_PURGE_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq)]
pub enum TaskError {
    /// Rejected before a task was created.
    InvalidInput(String),
    TaskNotFound(String),
    /// The result was requested before the task completed.
    TaskNotReady { status: TaskStatus, progress: u8 },
    /// The task completed but its result has expired.
    ResultMissing(String),
    Store(BlackboardError),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            TaskError::TaskNotFound(id) => write!(f, "Task not found: {}", id),
            TaskError::TaskNotReady { status, progress } => write!(
                f,
                "Task not completed yet (status {}, progress {}%)",
                status, progress
            ),
            TaskError::ResultMissing(id) => write!(f, "Result of task {} is no longer available", id),
            TaskError::Store(err) => write!(f, "Store error: {}", err),
        }
    }
}

impl Error for TaskError {}

impl From<BlackboardError> for TaskError {
    fn from(err: BlackboardError) -> Self {
        TaskError::Store(err)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: String,
    pub status: TaskStatus,
    pub mode: ExecutionMode,
    pub message: String,
}

/// One page of [`TaskManager::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<TaskView>,
    /// Live tasks in total, not just on this page.
    pub total: usize,
    pub stats: TaskStats,
}

/// Assembles a [`TaskManager`].
pub struct TaskManagerBuilder {
    registry: AgentRegistry,
    config: ForumConfig,
    store: Option<Arc<dyn BlackboardStore>>,
    reviewer: Arc<dyn Reviewer>,
    synthesizer: Arc<dyn ReportSynthesizer>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl TaskManagerBuilder {
    pub fn with_config(mut self, config: ForumConfig) -> Self {
        self.config = config;
        self
    }

    /// Backing store. Defaults to a fresh [`InMemoryStore`].
    pub fn with_store(mut self, store: Arc<dyn BlackboardStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to [`AutoApproveReviewer`].
    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = reviewer;
        self
    }

    /// Defaults to [`MergeSynthesizer`].
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn ReportSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn build(self) -> TaskManager {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn BlackboardStore>);
        let board = Blackboard::new(store.clone()).with_ttl(self.config.blackboard_ttl);

        let mut tasks = TaskStore::new(
            store.clone(),
            self.config.blackboard_ttl,
            self.config.result_cache_ttl,
        );
        let mut coordinator = PhaseCoordinator::new(board.clone(), self.config.worker_concurrency);
        if let Some(handler) = &self.event_handler {
            tasks = tasks.with_event_handler(handler.clone());
            coordinator = coordinator.with_event_handler(handler.clone());
        }

        let mut orchestrator = Orchestrator::new(
            coordinator,
            tasks.clone(),
            self.reviewer,
            self.synthesizer,
            self.config.clone(),
        );
        if self.config.query_cache_enabled {
            orchestrator = orchestrator.with_query_cache(
                QueryCache::new(store, self.config.result_cache_ttl).with_similarity(
                    self.config.similarity_threshold,
                    self.config.similarity_scan_limit,
                ),
            );
        }
        if let Some(handler) = &self.event_handler {
            orchestrator = orchestrator.with_event_handler(handler.clone());
        }

        TaskManager {
            registry: Arc::new(self.registry),
            board,
            tasks,
            orchestrator: Arc::new(orchestrator),
            config: Arc::new(self.config),
            running: Arc::new(Mutex::new(HashMap::new())),
            event_handler: self.event_handler,
        }
    }
}

/// Submits tasks and answers questions about them. Cheap to clone.
#[derive(Clone)]
pub struct TaskManager {
    registry: Arc<AgentRegistry>,
    board: Blackboard,
    tasks: TaskStore,
    orchestrator: Arc<Orchestrator>,
    config: Arc<ForumConfig>,
    running: Arc<Mutex<HashMap<String, CancelFlag>>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl TaskManager {
    pub fn builder(registry: AgentRegistry) -> TaskManagerBuilder {
        TaskManagerBuilder {
            registry,
            config: ForumConfig::default(),
            store: None,
            reviewer: Arc::new(AutoApproveReviewer),
            synthesizer: Arc::new(MergeSynthesizer),
            event_handler: None,
        }
    }

    pub fn config(&self) -> &ForumConfig {
        &self.config
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.board
    }

    /// Validate `query`, record a pending task and start it in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn submit(&self, query: &str, mode: ExecutionMode) -> Result<SubmitReceipt, TaskError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(TaskError::InvalidInput("query must not be empty".into()));
        }
        let chars = query.chars().count();
        if chars > self.config.max_query_chars {
            return Err(TaskError::InvalidInput(format!(
                "query is {} characters long, the limit is {}",
                chars, self.config.max_query_chars
            )));
        }
        let roster = self.registry.roster();
        if roster.is_empty() {
            return Err(TaskError::InvalidInput("no agents are registered".into()));
        }

        let task_id = format!("task_{}", uuid::Uuid::new_v4().simple());
        let record = TaskRecord::new(&task_id, query, mode, roster.ids());
        self.tasks.create(&record).await?;
        log::info!("[{}] submitted {} task: {:?}", task_id, mode, query);
        if let Some(handler) = &self.event_handler {
            notify(
                handler.as_ref(),
                &ForumEvent::TaskSubmitted {
                    task_id: task_id.clone(),
                    query: query.to_string(),
                    mode,
                },
            )
            .await;
        }

        let cancel = CancelFlag::new();
        self.running_tasks().insert(task_id.clone(), cancel.clone());
        let run = TaskRun::new(task_id.as_str(), query, mode, roster).with_cancel_flag(cancel);
        let orchestrator = self.orchestrator.clone();
        let running = self.running.clone();
        let worker = {
            let orchestrator = orchestrator.clone();
            let run = run.clone();
            // Failures are recorded on the task itself.
            tokio::spawn(async move { orchestrator.run_task(&run).await })
        };
        tokio::spawn(async move {
            if let Err(err) = worker.await {
                log::error!("[{}] background run died: {}", run.task_id, err);
                orchestrator.record_crash(&run, err.to_string()).await;
            }
            running
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&run.task_id);
        });

        Ok(SubmitReceipt {
            task_id,
            status: TaskStatus::Pending,
            mode,
            message: TaskStatus::Pending.message().to_string(),
        })
    }

    fn running_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelFlag>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ids of tasks whose orchestration is still in flight.
    pub fn running_task_ids(&self) -> Vec<String> {
        self.running_tasks().keys().cloned().collect()
    }

    async fn record(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| TaskError::TaskNotFound(task_id.to_string()))
    }

    /// Current status. Completed tasks include their result while it lasts.
    pub async fn get_status(&self, task_id: &str) -> Result<TaskView, TaskError> {
        let record = self.record(task_id).await?;
        let result = if record.status == TaskStatus::Completed {
            self.tasks.get_result(task_id).await?
        } else {
            None
        };
        Ok(record.view(result))
    }

    pub async fn get_result(&self, task_id: &str) -> Result<Value, TaskError> {
        let record = self.record(task_id).await?;
        if record.status != TaskStatus::Completed {
            return Err(TaskError::TaskNotReady {
                status: record.status,
                progress: record.progress,
            });
        }
        self.tasks
            .get_result(task_id)
            .await?
            .ok_or_else(|| TaskError::ResultMissing(task_id.to_string()))
    }

    /// Tasks newest first. `limit` is clamped to `1..=100`.
    pub async fn list(&self, limit: usize, offset: usize) -> Result<TaskPage, TaskError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let (records, total, stats) = self.tasks.page(limit, offset).await?;
        Ok(TaskPage {
            tasks: records.iter().map(|record| record.view(None)).collect(),
            total,
            stats,
        })
    }

    /// Per-agent phases, outputs, guidance, supplement round and forum log.
    pub async fn inspect_phases(&self, task_id: &str) -> Result<PhaseSnapshot, TaskError> {
        let record = self.record(task_id).await?;
        Ok(self.board.task_snapshot(task_id, &record.agents).await?)
    }

    /// Latest run status of every agent in the task's roster.
    pub async fn agent_progress(
        &self,
        task_id: &str,
    ) -> Result<BTreeMap<String, Option<AgentProgress>>, TaskError> {
        let record = self.record(task_id).await?;
        let mut progress = BTreeMap::new();
        for agent in &record.agents {
            progress.insert(
                agent.clone(),
                self.board.get_agent_progress(task_id, agent).await?,
            );
        }
        Ok(progress)
    }

    /// Cancel a task. Running agents are aborted and the task is marked
    /// failed right away; a task already finished is returned unchanged.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskView, TaskError> {
        let record = self.record(task_id).await?;
        if record.status.is_terminal() {
            return Ok(record.view(None));
        }
        if let Some(flag) = self.running_tasks().get(task_id) {
            flag.cancel();
        }
        log::info!("[{}] cancellation requested", task_id);
        let record = self
            .tasks
            .update_status(task_id, TaskStatus::Failed, Some("task cancelled".into()))
            .await?
            .ok_or_else(|| TaskError::TaskNotFound(task_id.to_string()))?;
        Ok(record.view(None))
    }

    /// Delete every task created more than `retention` ago, with all of its
    /// blackboard keys. Tasks still running are kept. Returns how many tasks
    /// were removed.
    pub async fn purge_expired(&self, retention: Duration) -> Result<usize, TaskError> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|err| TaskError::InvalidInput(format!("retention out of range: {}", err)))?;
        let cutoff = Utc::now() - retention;
        let running: HashSet<String> = self.running_task_ids().into_iter().collect();

        let mut purged = HashSet::new();
        for record in self.tasks.all().await? {
            if record.created_at >= cutoff || running.contains(&record.task_id) {
                continue;
            }
            let keys = self.board.clear_task(&record.task_id).await?;
            log::debug!("[{}] purged {} key(s)", record.task_id, keys);
            purged.insert(record.task_id);
        }
        self.tasks.unindex(&purged).await?;
        if !purged.is_empty() {
            log::info!("purged {} expired task(s)", purged.len());
        }
        Ok(purged.len())
    }

    /// Run [`purge_expired`](Self::purge_expired) every `every` (at least
    /// one millisecond) until the returned handle is aborted.
    pub fn spawn_purge_job(&self, every: Duration, retention: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(every.max(MIN_PURGE_INTERVAL));
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = manager.purge_expired(retention).await {
                    log::warn!("scheduled purge failed: {}", err);
                }
            }
        })
    }

    /// Poll until the task reaches a terminal status and its background run
    /// has returned, or until `timeout` passes. Returns the latest view either
    /// way.
    pub async fn wait_until_finished(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<TaskView, TaskError> {
        let deadline = deadline_after(timeout);
        loop {
            let view = self.get_status(task_id).await?;
            let settled = view.status.is_terminal() && !self.running_tasks().contains_key(task_id);
            if settled || time::Instant::now() >= deadline {
                return Ok(view);
            }
            time::sleep(POLL_INTERVAL).await;
        }
    }
}
