use async_trait::async_trait;
use forumflow::agent::{
    AgentFailure, AgentRegistry, AgentRunStatus, AgentRunner, Phase, PhaseRequest, PhaseResult,
};
use forumflow::config::{ForumConfig, SupplementScope};
use forumflow::event::{EventHandler, ForumEvent};
use forumflow::reviewer::{ReviewDecision, ReviewError, ReviewRequest, ReviewStage, Reviewer};
use forumflow::synthesis::{ReportSynthesizer, SynthesisError, SynthesisRequest};
use forumflow::task::{ExecutionMode, TaskStatus};
use forumflow::task_manager::{TaskError, TaskManager, TaskManagerBuilder};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

struct MockAgent {
    id: String,
    failing: Vec<Phase>,
    calls: Mutex<Vec<PhaseRequest>>,
}

impl MockAgent {
    fn new(id: &str) -> Arc<Self> {
        Self::failing_in(id, &[])
    }

    fn failing_in(id: &str, phases: &[Phase]) -> Arc<Self> {
        Arc::new(MockAgent {
            id: id.to_string(),
            failing: phases.to_vec(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self, phase: Phase) -> Vec<PhaseRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.phase == phase)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AgentRunner for MockAgent {
    async fn run_phase(&self, request: PhaseRequest) -> Result<PhaseResult, AgentFailure> {
        self.calls.lock().unwrap().push(request.clone());
        if self.failing.contains(&request.phase) {
            return Err(AgentFailure::new(format!("{} crashed", self.id)));
        }
        let output = match request.phase {
            Phase::Plan => json!({ "keywords": [self.id.clone(), "battery"] }),
            Phase::Research => json!({
                "paragraphs": [{ "title": "Market", "summary": format!("{} findings", self.id) }]
            }),
            _ => json!(format!("# {} report", self.id)),
        };
        Ok(PhaseResult::new(output))
    }
}

/// Answers each stage from a queue, approving once the queue is empty.
#[derive(Default)]
struct MockReviewer {
    plan: Mutex<VecDeque<Result<ReviewDecision, ReviewError>>>,
    research: Mutex<VecDeque<Result<ReviewDecision, ReviewError>>>,
    repeat_research: Option<ReviewDecision>,
    delay: Duration,
    requests: Mutex<Vec<ReviewRequest>>,
}

impl MockReviewer {
    fn plan(self, answer: Result<ReviewDecision, ReviewError>) -> Self {
        self.plan.lock().unwrap().push_back(answer);
        self
    }

    fn research(self, answer: Result<ReviewDecision, ReviewError>) -> Self {
        self.research.lock().unwrap().push_back(answer);
        self
    }

    fn count(&self, stage: ReviewStage) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.stage == stage)
            .count()
    }
}

#[async_trait]
impl Reviewer for MockReviewer {
    async fn review(&self, request: &ReviewRequest) -> Result<ReviewDecision, ReviewError> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = match request.stage {
            ReviewStage::Plan => self.plan.lock().unwrap().pop_front(),
            ReviewStage::Research => self.research.lock().unwrap().pop_front(),
        };
        match (queued, &self.repeat_research) {
            (Some(answer), _) => answer,
            (None, Some(decision)) if request.stage == ReviewStage::Research => Ok(decision.clone()),
            (None, _) => Ok(ReviewDecision::approve()),
        }
    }
}

struct PanickingReviewer;

#[async_trait]
impl Reviewer for PanickingReviewer {
    async fn review(&self, _request: &ReviewRequest) -> Result<ReviewDecision, ReviewError> {
        panic!("reviewer exploded")
    }
}

struct PanickingSynthesizer;

#[async_trait]
impl ReportSynthesizer for PanickingSynthesizer {
    async fn synthesize(&self, _request: &SynthesisRequest) -> Result<Value, SynthesisError> {
        panic!("composer exploded")
    }
}

struct PanickingHandler;

#[async_trait]
impl EventHandler for PanickingHandler {
    async fn on_event(&self, _event: &ForumEvent) {
        panic!("handler exploded")
    }
}

struct FailingSynthesizer;

#[async_trait]
impl ReportSynthesizer for FailingSynthesizer {
    async fn synthesize(&self, _request: &SynthesisRequest) -> Result<Value, SynthesisError> {
        Err(SynthesisError::Failed("template engine down".into()))
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ForumEvent>>,
}

impl Recorder {
    fn statuses(&self, task_id: &str) -> Vec<(TaskStatus, u8)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ForumEvent::StatusChanged {
                    task_id: id,
                    status,
                    progress,
                } if id == task_id => Some((*status, *progress)),
                _ => None,
            })
            .collect()
    }

    fn status_sequence(&self, task_id: &str) -> Vec<TaskStatus> {
        self.statuses(task_id).into_iter().map(|(status, _)| status).collect()
    }

    fn count(&self, matches: impl Fn(&ForumEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|event| matches(*event)).count()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_event(&self, event: &ForumEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

struct Forum {
    manager: TaskManager,
    recorder: Arc<Recorder>,
    reviewer: Arc<MockReviewer>,
    query: Arc<MockAgent>,
    media: Arc<MockAgent>,
    insight: Arc<MockAgent>,
}

fn forum_with(reviewer: MockReviewer, config: ForumConfig, media: Arc<MockAgent>) -> Forum {
    let query = MockAgent::new("query");
    let insight = MockAgent::new("insight");
    let registry = AgentRegistry::new()
        .with_agent("query", query.clone())
        .unwrap()
        .with_agent("media", media.clone())
        .unwrap()
        .with_agent("insight", insight.clone())
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    let reviewer = Arc::new(reviewer);
    let manager = TaskManager::builder(registry)
        .with_config(config)
        .with_reviewer(reviewer.clone())
        .with_event_handler(recorder.clone())
        .build();
    Forum {
        manager,
        recorder,
        reviewer,
        query,
        media,
        insight,
    }
}

fn forum(reviewer: MockReviewer) -> Forum {
    forum_with(reviewer, ForumConfig::default(), MockAgent::new("media"))
}

#[tokio::test]
async fn test_approve_path_status_sequence() {
    let forum = forum(MockReviewer::default());

    let receipt = forum
        .manager
        .submit("EV battery market outlook", ExecutionMode::Phased)
        .await
        .unwrap();
    assert_eq!(receipt.status, TaskStatus::Pending);
    assert!(receipt.task_id.starts_with("task_"));

    let view = forum
        .manager
        .wait_until_finished(&receipt.task_id, WAIT)
        .await
        .unwrap();
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.progress, 100);
    assert!(view.result.is_some());

    assert_eq!(
        forum.recorder.status_sequence(&receipt.task_id),
        vec![
            TaskStatus::Phase1Plan,
            TaskStatus::OrchestratingPlan,
            TaskStatus::Phase2Research,
            TaskStatus::OrchestratingResearch,
            TaskStatus::Phase3Report,
            TaskStatus::GeneratingFinalReport,
            TaskStatus::Completed,
        ]
    );
    assert_eq!(forum.reviewer.count(ReviewStage::Plan), 1);
    assert_eq!(forum.reviewer.count(ReviewStage::Research), 1);

    let report = forum.manager.get_result(&receipt.task_id).await.unwrap();
    assert_eq!(report["metadata"]["phased"], true);
    assert_eq!(report["metadata"]["hasForumLog"], true);
    let content = report["content"].as_str().unwrap();
    assert!(content.contains("# query report"));
    assert!(content.contains("# insight report"));

    let snapshot = forum.manager.inspect_phases(&receipt.task_id).await.unwrap();
    assert!(snapshot.phases.values().all(|phase| *phase == Some(Phase::Done)));
    assert_eq!(snapshot.supplement_round, 0);
    assert_eq!(snapshot.guidance.plan, None);
}

#[tokio::test]
async fn test_plan_revision_reruns_plan_once_with_guidance() {
    let reviewer = MockReviewer::default()
        .plan(Ok(ReviewDecision::revise("add pricing keywords")))
        .plan(Ok(ReviewDecision::revise("never consulted")));
    let forum = forum(reviewer);

    let receipt = forum
        .manager
        .submit("EV battery market outlook", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = forum
        .manager
        .wait_until_finished(&receipt.task_id, WAIT)
        .await
        .unwrap();
    assert_eq!(view.status, TaskStatus::Completed);

    assert_eq!(forum.reviewer.count(ReviewStage::Plan), 1);
    let plans = forum.query.calls(Phase::Plan);
    assert_eq!(plans.len(), 2);
    assert!(!plans[0].rerun);
    assert!(plans[1].rerun);
    assert_eq!(plans[1].guidance.as_deref(), Some("add pricing keywords"));
    assert_eq!(forum.insight.calls(Phase::Plan).len(), 2);

    let research = forum.query.calls(Phase::Research);
    assert_eq!(research.len(), 1);
    assert_eq!(research[0].guidance.as_deref(), Some("add pricing keywords"));

    assert_eq!(
        forum.recorder.statuses(&receipt.task_id)[..4],
        [
            (TaskStatus::Phase1Plan, 20),
            (TaskStatus::OrchestratingPlan, 35),
            (TaskStatus::Phase1Plan, 35),
            (TaskStatus::OrchestratingPlan, 35),
        ]
    );

    let snapshot = forum.manager.inspect_phases(&receipt.task_id).await.unwrap();
    assert_eq!(snapshot.guidance.plan.as_deref(), Some("add pricing keywords"));
    let log: Vec<String> = snapshot.forum_log.iter().map(|e| e.content.clone()).collect();
    assert!(log.iter().any(|line| line.contains("Plan revision budget spent")));
}

#[tokio::test]
async fn test_supplement_path_runs_one_round_for_flagged_agents() {
    let reviewer = MockReviewer::default().research(Ok(
        ReviewDecision::supplement("cover regional sentiment")
            .with_flagged_agents(vec!["media".into()]),
    ));
    let forum = forum(reviewer);

    let receipt = forum
        .manager
        .submit("EV battery market outlook", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = forum
        .manager
        .wait_until_finished(&receipt.task_id, WAIT)
        .await
        .unwrap();
    assert_eq!(view.status, TaskStatus::Completed);

    assert_eq!(
        forum.recorder.status_sequence(&receipt.task_id),
        vec![
            TaskStatus::Phase1Plan,
            TaskStatus::OrchestratingPlan,
            TaskStatus::Phase2Research,
            TaskStatus::OrchestratingResearch,
            TaskStatus::Phase2Supplement,
            TaskStatus::OrchestratingResearch,
            TaskStatus::Phase3Report,
            TaskStatus::GeneratingFinalReport,
            TaskStatus::Completed,
        ]
    );
    assert_eq!(forum.reviewer.count(ReviewStage::Research), 1);

    let media = forum.media.calls(Phase::Research);
    assert_eq!(media.len(), 2);
    assert!(media[1].rerun);
    assert_eq!(media[1].guidance.as_deref(), Some("cover regional sentiment"));
    assert!(media[0].prior.research.is_none());
    assert_eq!(
        media[1].prior.research,
        Some(json!({
            "paragraphs": [{ "title": "Market", "summary": "media findings" }]
        }))
    );
    assert_eq!(forum.query.calls(Phase::Research).len(), 1);
    assert_eq!(forum.insight.calls(Phase::Research).len(), 1);

    let snapshot = forum.manager.inspect_phases(&receipt.task_id).await.unwrap();
    assert_eq!(snapshot.supplement_round, 1);
    assert_eq!(
        snapshot.guidance.research.as_deref(),
        Some("cover regional sentiment")
    );
    assert_eq!(
        forum
            .recorder
            .count(|event| matches!(event, ForumEvent::SupplementStarted { agents, .. } if agents == &vec!["media".to_string()])),
        1
    );
}

#[tokio::test]
async fn test_persistent_supplement_requests_are_bounded_to_one_round() {
    let reviewer = MockReviewer {
        repeat_research: Some(ReviewDecision::supplement("more, always more")),
        ..MockReviewer::default()
    };
    let config = ForumConfig::default().with_supplement_scope(SupplementScope::AllAgents);
    let forum = forum_with(reviewer, config, MockAgent::new("media"));

    let receipt = forum
        .manager
        .submit("EV battery market outlook", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = forum
        .manager
        .wait_until_finished(&receipt.task_id, WAIT)
        .await
        .unwrap();
    assert_eq!(view.status, TaskStatus::Completed);

    let supplements = forum
        .recorder
        .status_sequence(&receipt.task_id)
        .into_iter()
        .filter(|status| *status == TaskStatus::Phase2Supplement)
        .count();
    assert_eq!(supplements, 1);
    for agent in [&forum.query, &forum.media, &forum.insight] {
        assert_eq!(agent.calls(Phase::Research).len(), 2);
    }

    let progress: Vec<u8> = forum
        .recorder
        .statuses(&receipt.task_id)
        .into_iter()
        .map(|(_, progress)| progress)
        .collect();
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn test_reviewer_timeout_degrades_to_approve() {
    let reviewer = MockReviewer {
        delay: Duration::from_secs(5),
        ..MockReviewer::default()
    };
    let config = ForumConfig::default().with_review_timeout(Duration::from_millis(50));
    let forum = forum_with(reviewer, config, MockAgent::new("media"));

    let receipt = forum
        .manager
        .submit("EV battery market outlook", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = forum
        .manager
        .wait_until_finished(&receipt.task_id, WAIT)
        .await
        .unwrap();
    assert_eq!(view.status, TaskStatus::Completed);

    assert_eq!(
        forum
            .recorder
            .count(|event| matches!(event, ForumEvent::ReviewDegraded { .. })),
        2
    );
    let snapshot = forum.manager.inspect_phases(&receipt.task_id).await.unwrap();
    assert_eq!(snapshot.guidance.plan, None);
    assert!(snapshot
        .forum_log
        .iter()
        .any(|entry| entry.speaker == "orchestrator"
            && entry.content.contains("Plan review unavailable")));
}

#[tokio::test]
async fn test_reviewer_error_degrades_to_approve() {
    let reviewer = MockReviewer::default()
        .plan(Err(ReviewError::Failed("quota exceeded".into())))
        .research(Err(ReviewError::Failed("quota exceeded".into())));
    let forum = forum(reviewer);

    let receipt = forum
        .manager
        .submit("EV battery market outlook", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = forum
        .manager
        .wait_until_finished(&receipt.task_id, WAIT)
        .await
        .unwrap();

    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(forum.query.calls(Phase::Plan).len(), 1);
    assert_eq!(forum.query.calls(Phase::Research).len(), 1);
}

#[tokio::test]
async fn test_agent_failure_still_completes_with_partial_results() {
    let media = MockAgent::failing_in("media", &Phase::RUNNABLE);
    let forum = forum_with(MockReviewer::default(), ForumConfig::default(), media);

    let receipt = forum
        .manager
        .submit("EV battery market outlook", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = forum
        .manager
        .wait_until_finished(&receipt.task_id, WAIT)
        .await
        .unwrap();
    assert_eq!(view.status, TaskStatus::Completed);

    let report = forum.manager.get_result(&receipt.task_id).await.unwrap();
    let sources = report["sources"].as_array().unwrap();
    assert!(sources.contains(&json!({"engine": "media", "count": 0})));
    assert!(sources.contains(&json!({"engine": "query", "count": 1})));

    let progress = forum.manager.agent_progress(&receipt.task_id).await.unwrap();
    let media = progress["media"].as_ref().unwrap();
    assert_eq!(media.status, AgentRunStatus::Failed);
    assert_eq!(media.phase, Phase::Report);
    assert_eq!(
        progress["query"].as_ref().unwrap().status,
        AgentRunStatus::Completed
    );

    let request = forum
        .reviewer
        .requests
        .lock()
        .unwrap()
        .iter()
        .find(|request| request.stage == ReviewStage::Plan)
        .cloned()
        .unwrap();
    let media_plan = request
        .submissions
        .iter()
        .find(|submission| submission.agent_id == "media")
        .unwrap();
    assert!(media_plan.output.is_none());
}

#[tokio::test]
async fn test_no_reports_fails_the_task() {
    let registry = AgentRegistry::new()
        .with_agent("query", MockAgent::failing_in("query", &[Phase::Report]))
        .unwrap()
        .with_agent("media", MockAgent::failing_in("media", &[Phase::Report]))
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    let manager = TaskManager::builder(registry)
        .with_event_handler(recorder.clone())
        .build();

    let receipt = manager
        .submit("EV battery market outlook", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = manager.wait_until_finished(&receipt.task_id, WAIT).await.unwrap();

    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.progress, 85);
    let message = view.error_message.unwrap();
    assert!(message.starts_with("no agent reports available"));
    assert!(message.contains("query"));

    match manager.get_result(&receipt.task_id).await {
        Err(TaskError::TaskNotReady { status, progress }) => {
            assert_eq!(status, TaskStatus::Failed);
            assert_eq!(progress, 85);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(
        recorder.count(|event| matches!(event, ForumEvent::TaskFailed { .. })),
        1
    );
}

#[tokio::test]
async fn test_synthesizer_error_fails_the_task() {
    let registry = AgentRegistry::new()
        .with_agent("query", MockAgent::new("query"))
        .unwrap();
    let manager = TaskManager::builder(registry)
        .with_synthesizer(Arc::new(FailingSynthesizer))
        .build();

    let receipt = manager
        .submit("EV battery market outlook", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = manager.wait_until_finished(&receipt.task_id, WAIT).await.unwrap();

    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(
        view.error_message.as_deref(),
        Some("report synthesis failed: template engine down")
    );
    let snapshot = manager.inspect_phases(&receipt.task_id).await.unwrap();
    assert!(snapshot
        .forum_log
        .last()
        .map(|entry| entry.content.starts_with("Task failed"))
        .unwrap_or(false));
}

fn pair_builder() -> TaskManagerBuilder {
    let registry = AgentRegistry::new()
        .with_agent("query", MockAgent::new("query"))
        .unwrap()
        .with_agent("media", MockAgent::new("media"))
        .unwrap();
    TaskManager::builder(registry)
}

#[tokio::test]
async fn test_panicking_reviewer_degrades_to_approve() {
    let recorder = Arc::new(Recorder::default());
    let manager = pair_builder()
        .with_reviewer(Arc::new(PanickingReviewer))
        .with_event_handler(recorder.clone())
        .build();

    let receipt = manager
        .submit("EV battery market outlook", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = manager.wait_until_finished(&receipt.task_id, WAIT).await.unwrap();

    assert_eq!(view.status, TaskStatus::Completed);
    assert!(manager.running_task_ids().is_empty());
    let degraded: Vec<String> = recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            ForumEvent::ReviewDegraded { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(degraded.len(), 2);
    assert!(degraded[0].contains("reviewer panicked: reviewer exploded"));
}

#[tokio::test]
async fn test_panicking_synthesizer_fails_the_task() {
    let manager = pair_builder()
        .with_synthesizer(Arc::new(PanickingSynthesizer))
        .build();

    let receipt = manager
        .submit("EV battery market outlook", ExecutionMode::Standard)
        .await
        .unwrap();
    let view = manager.wait_until_finished(&receipt.task_id, WAIT).await.unwrap();

    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(
        view.error_message.as_deref(),
        Some("report synthesis failed: synthesizer panicked: composer exploded")
    );
    assert!(manager.running_task_ids().is_empty());
}

#[tokio::test]
async fn test_panicking_event_handler_does_not_stall_the_task() {
    let manager = pair_builder()
        .with_event_handler(Arc::new(PanickingHandler))
        .build();

    let receipt = manager
        .submit("EV battery market outlook", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = manager.wait_until_finished(&receipt.task_id, WAIT).await.unwrap();

    assert_eq!(view.status, TaskStatus::Completed);
    assert!(manager.running_task_ids().is_empty());
}

#[tokio::test]
async fn test_unbounded_timeouts_still_complete() {
    let config = ForumConfig::default()
        .with_phase_timeout(Duration::MAX)
        .with_review_timeout(Duration::from_secs(u64::MAX));
    let manager = pair_builder().with_config(config).build();

    let receipt = manager
        .submit("EV battery market outlook", ExecutionMode::Phased)
        .await
        .unwrap();
    let view = manager
        .wait_until_finished(&receipt.task_id, Duration::MAX)
        .await
        .unwrap();

    assert_eq!(view.status, TaskStatus::Completed);
    assert!(manager.running_task_ids().is_empty());
}
