//! Task records, statuses and their persistence.
//!
//! A task's lifecycle record lives at `task:{id}:meta`, its final report at
//! `task:{id}:result`, and every task id is listed in `tasks:all`. The
//! [`TaskStore`] is the only writer of those keys; it keeps progress
//! monotonically non-decreasing and refuses to move a task out of a terminal
//! status.

use crate::blackboard::{keys, BlackboardError, BlackboardStore};
use crate::event::{notify, EventHandler, ForumEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Externally visible task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    #[serde(rename = "phase1_plan")]
    Phase1Plan,
    OrchestratingPlan,
    #[serde(rename = "phase2_research")]
    Phase2Research,
    OrchestratingResearch,
    #[serde(rename = "phase2_supplement")]
    Phase2Supplement,
    #[serde(rename = "phase3_report")]
    Phase3Report,
    GeneratingReport,
    GeneratingFinalReport,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 12] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Phase1Plan,
        TaskStatus::OrchestratingPlan,
        TaskStatus::Phase2Research,
        TaskStatus::OrchestratingResearch,
        TaskStatus::Phase2Supplement,
        TaskStatus::Phase3Report,
        TaskStatus::GeneratingReport,
        TaskStatus::GeneratingFinalReport,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Phase1Plan => "phase1_plan",
            TaskStatus::OrchestratingPlan => "orchestrating_plan",
            TaskStatus::Phase2Research => "phase2_research",
            TaskStatus::OrchestratingResearch => "orchestrating_research",
            TaskStatus::Phase2Supplement => "phase2_supplement",
            TaskStatus::Phase3Report => "phase3_report",
            TaskStatus::GeneratingReport => "generating_report",
            TaskStatus::GeneratingFinalReport => "generating_final_report",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Progress a task reaches on entering this status. `Failed` keeps
    /// whatever progress the task had.
    pub fn progress(&self) -> Option<u8> {
        match self {
            TaskStatus::Pending => Some(0),
            TaskStatus::Running => Some(5),
            TaskStatus::Phase1Plan => Some(20),
            TaskStatus::OrchestratingPlan => Some(35),
            TaskStatus::Phase2Research => Some(40),
            TaskStatus::OrchestratingResearch => Some(65),
            TaskStatus::Phase2Supplement => Some(70),
            TaskStatus::Phase3Report => Some(75),
            TaskStatus::GeneratingReport => Some(80),
            TaskStatus::GeneratingFinalReport => Some(85),
            TaskStatus::Completed => Some(100),
            TaskStatus::Failed => None,
        }
    }

    /// Human readable description.
    pub fn message(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Task queued",
            TaskStatus::Running => "Agents are researching",
            TaskStatus::Phase1Plan => "Phase 1: agents are planning",
            TaskStatus::OrchestratingPlan => "Orchestrator is reviewing the plans",
            TaskStatus::Phase2Research => "Phase 2: agents are researching",
            TaskStatus::OrchestratingResearch => "Orchestrator is reviewing the research",
            TaskStatus::Phase2Supplement => "Phase 2: supplementary research",
            TaskStatus::Phase3Report => "Phase 3: agents are writing reports",
            TaskStatus::GeneratingReport => "Generating the report",
            TaskStatus::GeneratingFinalReport => "Generating the final report",
            TaskStatus::Completed => "Task completed",
            TaskStatus::Failed => "Task failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| format!("unknown task status: {}", value))
    }
}

/// How a task is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Plan, research and report with no reviews in between.
    Standard,
    /// Reviewed phases with plan revision and research supplement.
    #[default]
    Phased,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Standard => "standard",
            ExecutionMode::Phased => "phased",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "standard" => Ok(ExecutionMode::Standard),
            "phased" => Ok(ExecutionMode::Phased),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

/// Persisted lifecycle record of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub query: String,
    pub mode: ExecutionMode,
    pub status: TaskStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Roster the task was submitted with.
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub from_cache: bool,
}

impl TaskRecord {
    pub fn new(task_id: &str, query: &str, mode: ExecutionMode, agents: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.to_string(),
            query: query.to_string(),
            mode,
            status: TaskStatus::Pending,
            progress: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
            agents,
            from_cache: false,
        }
    }

    pub fn view(&self, result: Option<Value>) -> TaskView {
        TaskView {
            task_id: self.task_id.clone(),
            query: self.query.clone(),
            mode: self.mode,
            status: self.status,
            progress: self.progress,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            message: self.status.message().to_string(),
            error_message: self.error_message.clone(),
            result,
        }
    }
}

/// Status view returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub query: String,
    pub mode: ExecutionMode,
    pub status: TaskStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub message: String,
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
}

impl TaskStats {
    fn count(records: &[TaskRecord]) -> Self {
        let mut by_status: BTreeMap<String, usize> = TaskStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();
        for record in records {
            *by_status.entry(record.status.as_str().to_string()).or_default() += 1;
        }
        Self {
            total: records.len(),
            by_status,
        }
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// Persistence of task records and results.
#[derive(Clone)]
pub struct TaskStore {
    store: Arc<dyn BlackboardStore>,
    ttl: Duration,
    result_ttl: Duration,
    // Serialises read-modify-write of records and rewrites of the task index.
    write_lock: Arc<Mutex<()>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl TaskStore {
    pub fn new(store: Arc<dyn BlackboardStore>, ttl: Duration, result_ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            result_ttl,
            write_lock: Arc::new(Mutex::new(())),
            event_handler: None,
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    async fn put_record(&self, record: &TaskRecord) -> Result<(), BlackboardError> {
        self.store
            .put(
                &keys::task_meta(&record.task_id),
                serde_json::to_string(record)?,
                Some(self.ttl),
            )
            .await
    }

    /// Persist a new record and index it.
    pub async fn create(&self, record: &TaskRecord) -> Result<(), BlackboardError> {
        let _guard = self.write_lock.lock().await;
        self.put_record(record).await?;
        self.store
            .append(keys::TASK_INDEX, record.task_id.clone(), None)
            .await?;
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, BlackboardError> {
        match self.store.get(&keys::task_meta(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Move a task to `status`.
    ///
    /// Progress is max-merged with the status's progress. Records already in
    /// a terminal status are returned unchanged. Returns `None` if the task
    /// does not exist.
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> Result<Option<TaskRecord>, BlackboardError> {
        let record = {
            let _guard = self.write_lock.lock().await;
            let Some(mut record) = self.get(task_id).await? else {
                return Ok(None);
            };
            if record.status.is_terminal() {
                log::debug!(
                    "[{}] ignoring {} after terminal status {}",
                    task_id,
                    status,
                    record.status
                );
                return Ok(Some(record));
            }

            let now = Utc::now();
            record.status = status;
            if let Some(progress) = status.progress() {
                record.progress = record.progress.max(progress);
            }
            record.updated_at = now;
            if status.is_terminal() {
                record.completed_at = Some(now);
            }
            if error_message.is_some() {
                record.error_message = error_message;
            }
            self.put_record(&record).await?;
            record
        };

        log::info!("[{}] status {} ({}%)", task_id, record.status, record.progress);
        if let Some(handler) = &self.event_handler {
            notify(
                handler.as_ref(),
                &ForumEvent::StatusChanged {
                    task_id: task_id.to_string(),
                    status: record.status,
                    progress: record.progress,
                },
            )
            .await;
        }
        Ok(Some(record))
    }

    /// Flag a record as served from the query cache.
    pub async fn mark_from_cache(&self, task_id: &str) -> Result<(), BlackboardError> {
        let _guard = self.write_lock.lock().await;
        if let Some(mut record) = self.get(task_id).await? {
            record.from_cache = true;
            self.put_record(&record).await?;
        }
        Ok(())
    }

    pub async fn save_result(&self, task_id: &str, result: &Value) -> Result<(), BlackboardError> {
        self.store
            .put(
                &keys::task_result(task_id),
                serde_json::to_string(result)?,
                Some(self.result_ttl),
            )
            .await
    }

    pub async fn get_result(&self, task_id: &str) -> Result<Option<Value>, BlackboardError> {
        match self.store.get(&keys::task_result(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every live record, newest first.
    pub async fn all(&self) -> Result<Vec<TaskRecord>, BlackboardError> {
        let mut records = Vec::new();
        let mut seen = HashSet::new();
        for task_id in self.store.range(keys::TASK_INDEX).await?.into_iter().rev() {
            if !seen.insert(task_id.clone()) {
                continue;
            }
            if let Some(record) = self.get(&task_id).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// One page of records (newest first), the live total and per-status counts.
    pub async fn page(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<TaskRecord>, usize, TaskStats), BlackboardError> {
        let records = self.all().await?;
        let stats = TaskStats::count(&records);
        let total = records.len();
        let page = records.into_iter().skip(offset).take(limit).collect();
        Ok((page, total, stats))
    }

    /// Drop ids from the task index.
    pub async fn unindex(&self, task_ids: &HashSet<String>) -> Result<(), BlackboardError> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let remaining: Vec<String> = self
            .store
            .range(keys::TASK_INDEX)
            .await?
            .into_iter()
            .filter(|task_id| !task_ids.contains(task_id))
            .collect();
        self.store.delete(keys::TASK_INDEX).await?;
        for task_id in remaining {
            self.store.append(keys::TASK_INDEX, task_id, None).await?;
        }
        Ok(())
    }
}
