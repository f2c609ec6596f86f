use async_trait::async_trait;
use forumflow::agent::{
    AgentFailure, AgentRegistry, AgentRunStatus, AgentRunner, Phase, PhaseRequest, PhaseResult,
};
use forumflow::blackboard::{BlackboardError, BlackboardStore, InMemoryStore};
use forumflow::config::ForumConfig;
use forumflow::event::{EventHandler, ForumEvent};
use forumflow::reviewer::{ReviewDecision, ReviewError, ReviewRequest, Reviewer};
use forumflow::task::{ExecutionMode, TaskStatus};
use forumflow::task_manager::{TaskError, TaskManager};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

struct MockAgent {
    delay: Duration,
    calls: AtomicUsize,
}

impl MockAgent {
    fn new(delay_ms: u64) -> Arc<Self> {
        Arc::new(MockAgent {
            delay: Duration::from_millis(delay_ms),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRunner for MockAgent {
    async fn run_phase(&self, request: PhaseRequest) -> Result<PhaseResult, AgentFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(match request.phase {
            Phase::Report => PhaseResult::report(format!("{} report", request.agent_id)),
            _ => PhaseResult::new(json!({ "agent": request.agent_id })),
        })
    }
}

#[derive(Default)]
struct CountingReviewer {
    reviews: AtomicUsize,
}

#[async_trait]
impl Reviewer for CountingReviewer {
    async fn review(&self, _request: &ReviewRequest) -> Result<ReviewDecision, ReviewError> {
        self.reviews.fetch_add(1, Ordering::SeqCst);
        Ok(ReviewDecision::approve())
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ForumEvent>>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_event(&self, event: &ForumEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl Recorder {
    fn statuses(&self, task_id: &str) -> Vec<TaskStatus> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ForumEvent::StatusChanged {
                    task_id: id, status, ..
                } if id == task_id => Some(*status),
                _ => None,
            })
            .collect()
    }
}

fn manager(agent: Arc<MockAgent>, config: ForumConfig) -> TaskManager {
    let registry = AgentRegistry::new()
        .with_agent("query", agent.clone())
        .unwrap()
        .with_agent("media", agent)
        .unwrap();
    TaskManager::builder(registry).with_config(config).build()
}

#[tokio::test]
async fn test_submit_list_and_poll() {
    let manager = manager(MockAgent::new(0), ForumConfig::default());

    let mut ids = Vec::new();
    for query in ["solar tariffs", "wind subsidies", "grid storage"] {
        let receipt = manager.submit(query, ExecutionMode::Phased).await.unwrap();
        ids.push(receipt.task_id);
    }
    for id in &ids {
        let view = manager.wait_until_finished(id, WAIT).await.unwrap();
        assert_eq!(view.status, TaskStatus::Completed);
        assert_eq!(view.message, "Task completed");
        assert!(view.completed_at.is_some());
    }

    let page = manager.list(2, 0).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.tasks.len(), 2);
    assert_eq!(page.tasks[0].task_id, ids[2]);
    assert_eq!(page.tasks[1].task_id, ids[1]);
    assert!(page.tasks.iter().all(|task| task.result.is_none()));
    assert_eq!(page.stats.get(TaskStatus::Completed), 3);
    assert_eq!(page.stats.get(TaskStatus::Failed), 0);
    assert_eq!(page.stats.total, 3);

    let rest = manager.list(2, 2).await.unwrap();
    assert_eq!(rest.tasks.len(), 1);
    assert_eq!(rest.tasks[0].task_id, ids[0]);

    let clamped = manager.list(10_000, 0).await.unwrap();
    assert_eq!(clamped.tasks.len(), 3);

    let view = manager.get_status(&ids[0]).await.unwrap();
    assert_eq!(view.query, "solar tariffs");
    assert!(view.result.is_some());
}

#[tokio::test]
async fn test_invalid_queries_are_rejected_before_creation() {
    let manager = manager(MockAgent::new(0), ForumConfig::default());

    assert!(matches!(
        manager.submit("   ", ExecutionMode::Phased).await,
        Err(TaskError::InvalidInput(_))
    ));
    let too_long = "x".repeat(501);
    assert!(matches!(
        manager.submit(&too_long, ExecutionMode::Phased).await,
        Err(TaskError::InvalidInput(_))
    ));
    assert_eq!(manager.list(10, 0).await.unwrap().total, 0);

    let at_limit = "é".repeat(500);
    assert!(manager.submit(&at_limit, ExecutionMode::Standard).await.is_ok());

    let empty = TaskManager::builder(AgentRegistry::new()).build();
    assert!(matches!(
        empty.submit("solar tariffs", ExecutionMode::Phased).await,
        Err(TaskError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_result_is_gated_on_completion() {
    let manager = manager(MockAgent::new(200), ForumConfig::default());

    let receipt = manager
        .submit("solar tariffs", ExecutionMode::Phased)
        .await
        .unwrap();
    match manager.get_result(&receipt.task_id).await {
        Err(TaskError::TaskNotReady { status, progress }) => {
            assert!(!status.is_terminal());
            assert!(progress < 100);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(matches!(
        manager.get_status("task_missing").await,
        Err(TaskError::TaskNotFound(_))
    ));

    manager.wait_until_finished(&receipt.task_id, WAIT).await.unwrap();
    let report = manager.get_result(&receipt.task_id).await.unwrap();
    assert!(report["content"].as_str().unwrap().contains("query report"));
}

#[tokio::test]
async fn test_standard_mode_skips_reviews() {
    let agent = MockAgent::new(0);
    let reviewer = Arc::new(CountingReviewer::default());
    let recorder = Arc::new(Recorder::default());
    let registry = AgentRegistry::new()
        .with_agent("query", agent.clone())
        .unwrap();
    let manager = TaskManager::builder(registry)
        .with_reviewer(reviewer.clone())
        .with_event_handler(recorder.clone())
        .build();

    let receipt = manager
        .submit("solar tariffs", ExecutionMode::Standard)
        .await
        .unwrap();
    assert_eq!(receipt.mode, ExecutionMode::Standard);
    let view = manager.wait_until_finished(&receipt.task_id, WAIT).await.unwrap();

    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.mode, ExecutionMode::Standard);
    assert_eq!(
        recorder.statuses(&receipt.task_id),
        vec![
            TaskStatus::Running,
            TaskStatus::GeneratingReport,
            TaskStatus::Completed
        ]
    );
    assert_eq!(reviewer.reviews.load(Ordering::SeqCst), 0);
    assert_eq!(agent.calls(), 3);

    let report = manager.get_result(&receipt.task_id).await.unwrap();
    assert_eq!(report["metadata"]["phased"], false);
}

#[tokio::test]
async fn test_cancel_stops_a_running_task() {
    let agent = MockAgent::new(5_000);
    let manager = manager(agent.clone(), ForumConfig::default());

    let receipt = manager
        .submit("solar tariffs", ExecutionMode::Phased)
        .await
        .unwrap();
    for _ in 0..100 {
        if agent.calls() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(agent.calls(), 2);

    let view = manager.cancel(&receipt.task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.error_message.as_deref(), Some("task cancelled"));

    let view = manager
        .wait_until_finished(&receipt.task_id, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(view.status, TaskStatus::Failed);
    assert!(manager.running_task_ids().is_empty());
    assert_eq!(agent.calls(), 2);

    let progress = manager.agent_progress(&receipt.task_id).await.unwrap();
    assert!(progress
        .values()
        .all(|entry| entry.as_ref().map(|p| p.status) == Some(AgentRunStatus::Cancelled)));

    let again = manager.cancel(&receipt.task_id).await.unwrap();
    assert_eq!(again.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_purge_removes_expired_tasks() {
    let manager = manager(MockAgent::new(0), ForumConfig::default());

    let receipt = manager
        .submit("solar tariffs", ExecutionMode::Standard)
        .await
        .unwrap();
    manager.wait_until_finished(&receipt.task_id, WAIT).await.unwrap();

    assert_eq!(
        manager.purge_expired(Duration::from_secs(3600)).await.unwrap(),
        0
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.purge_expired(Duration::ZERO).await.unwrap(), 1);

    assert!(matches!(
        manager.get_status(&receipt.task_id).await,
        Err(TaskError::TaskNotFound(_))
    ));
    assert_eq!(manager.list(10, 0).await.unwrap().total, 0);
    assert!(manager
        .blackboard()
        .forum_log(&receipt.task_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_repeated_query_is_served_from_cache() {
    let agent = MockAgent::new(0);
    let recorder = Arc::new(Recorder::default());
    let registry = AgentRegistry::new()
        .with_agent("query", agent.clone())
        .unwrap();
    let manager = TaskManager::builder(registry)
        .with_event_handler(recorder.clone())
        .build();

    let first = manager
        .submit("electric vehicle battery market trends", ExecutionMode::Phased)
        .await
        .unwrap();
    manager.wait_until_finished(&first.task_id, WAIT).await.unwrap();
    let calls = agent.calls();
    let original = manager.get_result(&first.task_id).await.unwrap();

    let second = manager
        .submit("Electric vehicle battery market trends?", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = manager.wait_until_finished(&second.task_id, WAIT).await.unwrap();

    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(agent.calls(), calls);
    assert_eq!(manager.get_result(&second.task_id).await.unwrap(), original);
    assert_eq!(recorder.statuses(&second.task_id), vec![TaskStatus::Completed]);
    let cached = recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, ForumEvent::TaskCompleted { task_id, from_cache: true } if task_id == &second.task_id));
    assert!(cached);
}

#[tokio::test]
async fn test_cache_is_kept_per_execution_mode() {
    let agent = MockAgent::new(0);
    let manager = manager(agent.clone(), ForumConfig::default());

    let standard = manager
        .submit("grid storage", ExecutionMode::Standard)
        .await
        .unwrap();
    manager.wait_until_finished(&standard.task_id, WAIT).await.unwrap();
    assert_eq!(agent.calls(), 6);

    let phased = manager
        .submit("grid storage", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = manager.wait_until_finished(&phased.task_id, WAIT).await.unwrap();

    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(agent.calls(), 12);
    let report = manager.get_result(&phased.task_id).await.unwrap();
    assert_eq!(report["metadata"]["phased"], true);
}

#[tokio::test]
async fn test_cache_can_be_disabled() {
    let agent = MockAgent::new(0);
    let manager = manager(agent.clone(), ForumConfig::default().with_query_cache(false));

    for _ in 0..2 {
        let receipt = manager
            .submit("solar tariffs", ExecutionMode::Standard)
            .await
            .unwrap();
        manager.wait_until_finished(&receipt.task_id, WAIT).await.unwrap();
    }

    assert_eq!(agent.calls(), 12);
}

#[tokio::test]
async fn test_inspection_of_unknown_task_fails() {
    let manager = manager(MockAgent::new(0), ForumConfig::default());
    assert!(matches!(
        manager.inspect_phases("task_missing").await,
        Err(TaskError::TaskNotFound(_))
    ));
    assert!(matches!(
        manager.cancel("task_missing").await,
        Err(TaskError::TaskNotFound(_))
    ));
}

/// Panics whenever a task's forum log is read back.
struct UnreadableLogStore {
    inner: InMemoryStore,
}

#[async_trait]
impl BlackboardStore for UnreadableLogStore {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), BlackboardError> {
        self.inner.put(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BlackboardError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, BlackboardError> {
        self.inner.delete(key).await
    }

    async fn append(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<usize, BlackboardError> {
        self.inner.append(key, value, ttl).await
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, BlackboardError> {
        if key.ends_with(":forum:log") {
            panic!("forum log unreadable");
        }
        self.inner.range(key).await
    }

    async fn incr_bounded(
        &self,
        key: &str,
        max: i64,
        ttl: Option<Duration>,
    ) -> Result<Option<i64>, BlackboardError> {
        self.inner.incr_bounded(key, max, ttl).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BlackboardError> {
        self.inner.keys_with_prefix(prefix).await
    }
}

#[tokio::test]
async fn test_crashed_run_is_recorded_as_failed() {
    let registry = AgentRegistry::new()
        .with_agent("query", MockAgent::new(0))
        .unwrap();
    let store = Arc::new(UnreadableLogStore {
        inner: InMemoryStore::new(),
    });
    let manager = TaskManager::builder(registry).with_store(store).build();

    let receipt = manager
        .submit("solar tariffs", ExecutionMode::Standard)
        .await
        .unwrap();
    let view = manager.wait_until_finished(&receipt.task_id, WAIT).await.unwrap();

    assert_eq!(view.status, TaskStatus::Failed);
    let message = view.error_message.unwrap_or_default();
    assert!(message.starts_with("orchestration panicked"), "{}", message);
    assert!(message.contains("forum log unreadable"), "{}", message);
    assert!(manager.running_task_ids().is_empty());
}

#[tokio::test]
async fn test_zero_purge_interval_keeps_running() {
    let manager = manager(MockAgent::new(0), ForumConfig::default());
    let job = manager.spawn_purge_job(Duration::ZERO, Duration::from_secs(3600));

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!job.is_finished());
    job.abort();
}
