//! The task state machine.
//!
//! A phased task moves through
//!
//! ```text
//! phase1_plan -> orchestrating_plan -> phase2_research -> orchestrating_research
//!     -> [phase2_supplement -> orchestrating_research] -> phase3_report
//!     -> generating_final_report -> completed
//! ```
//!
//! with `failed` reachable from anywhere. The plan review may send the plan
//! back once (`plan_revise_budget`); the research review may claim the single
//! supplement round. A budget that is already spent turns the next review
//! pass into an automatic approval, so both loops terminate.
//!
//! A standard task runs `running -> generating_report -> completed` with the
//! three phases back to back and no reviews.
//!
//! Agent failures are absorbed: a failed agent simply has no output for the
//! phase. A reviewer that fails, times out or panics is treated as an approval
//! with no guidance. The task itself only fails when synthesis fails or panics
//! (including when no agent produced a report), when it is cancelled, or when
//! the blackboard becomes unusable.

use crate::agent::{AgentRoster, Phase};
use crate::blackboard::{Blackboard, BlackboardError};
use crate::config::{ForumConfig, SupplementScope};
use crate::coordinator::{CancelFlag, PhaseCoordinator, PhaseDispatch, PhaseOutcome};
use crate::event::{notify, panic_message, EventHandler, ForumEvent};
use crate::forum::{format_forum_log, summarize_forum_log, ORCHESTRATOR_SPEAKER, SYSTEM_SPEAKER};
use crate::query_cache::{CacheHit, CacheMatch, QueryCache};
use crate::reviewer::{AgentSubmission, ReviewDecision, ReviewError, ReviewRequest, ReviewStage, Reviewer, Verdict};
use crate::synthesis::{finalize_report_document, AgentReport, ReportSynthesizer, SynthesisError, SynthesisRequest};
use crate::task::{ExecutionMode, TaskStatus, TaskStore};
use futures_util::FutureExt;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time;

const DEFAULT_PLAN_GUIDANCE: &str =
    "Revise the plan so that it covers the query more completely and concretely.";
const DEFAULT_RESEARCH_GUIDANCE: &str =
    "Fill the gaps in the research with additional, well-sourced findings.";

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationError {
    Cancelled,
    TaskNotFound(String),
    Synthesis(SynthesisError),
    Store(BlackboardError),
    /// The background run itself panicked.
    Crashed(String),
}

impl fmt::Display for OrchestrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationError::Cancelled => write!(f, "task cancelled"),
            OrchestrationError::TaskNotFound(id) => write!(f, "task not found: {}", id),
            OrchestrationError::Synthesis(err) => write!(f, "{}", err),
            OrchestrationError::Store(err) => write!(f, "blackboard error: {}", err),
            OrchestrationError::Crashed(reason) => write!(f, "orchestration panicked: {}", reason),
        }
    }
}

impl Error for OrchestrationError {}

impl From<BlackboardError> for OrchestrationError {
    fn from(err: BlackboardError) -> Self {
        OrchestrationError::Store(err)
    }
}

impl From<SynthesisError> for OrchestrationError {
    fn from(err: SynthesisError) -> Self {
        OrchestrationError::Synthesis(err)
    }
}

/// One task to drive to completion.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub task_id: String,
    pub query: String,
    pub mode: ExecutionMode,
    pub roster: AgentRoster,
    pub cancel: CancelFlag,
}

impl TaskRun {
    pub fn new(
        task_id: impl Into<String>,
        query: impl Into<String>,
        mode: ExecutionMode,
        roster: AgentRoster,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            query: query.into(),
            mode,
            roster,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Drives tasks through their phases, reviews and synthesis.
pub struct Orchestrator {
    board: Blackboard,
    coordinator: PhaseCoordinator,
    tasks: TaskStore,
    reviewer: Arc<dyn Reviewer>,
    synthesizer: Arc<dyn ReportSynthesizer>,
    cache: Option<QueryCache>,
    config: ForumConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl Orchestrator {
    pub fn new(
        coordinator: PhaseCoordinator,
        tasks: TaskStore,
        reviewer: Arc<dyn Reviewer>,
        synthesizer: Arc<dyn ReportSynthesizer>,
        config: ForumConfig,
    ) -> Self {
        Self {
            board: coordinator.blackboard().clone(),
            coordinator,
            tasks,
            reviewer,
            synthesizer,
            cache: None,
            config,
            event_handler: None,
        }
    }

    /// Serve repeated queries from `cache` and populate it with new results.
    pub fn with_query_cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &ForumConfig {
        &self.config
    }

    /// Run `run` to a terminal status and return the final report document.
    ///
    /// The task record must already exist. On error the task is left
    /// `failed` with the error as its message.
    pub async fn run_task(&self, run: &TaskRun) -> Result<Value, OrchestrationError> {
        log::info!(
            "[{}] starting {} run with {} agent(s)",
            run.task_id,
            run.mode,
            run.roster.len()
        );

        let outcome = match self.execute(run).await {
            Ok(_) if run.cancel.is_cancelled() => Err(OrchestrationError::Cancelled),
            Ok((document, from_cache)) => match self.finish(run, &document, from_cache).await {
                Ok(()) => Ok(document),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        if let Err(err) = &outcome {
            self.fail(run, err).await;
        }
        outcome
    }

    /// Record that the run for `run` died without reaching a terminal
    /// status. A task that already finished is left alone.
    pub async fn record_crash(&self, run: &TaskRun, reason: impl Into<String>) {
        self.fail(run, &OrchestrationError::Crashed(reason.into()))
            .await;
    }

    async fn execute(&self, run: &TaskRun) -> Result<(Value, bool), OrchestrationError> {
        if let Some(hit) = self.cached_result(run).await {
            self.announce_cache_hit(run, &hit).await?;
            return Ok((hit.result, true));
        }
        let document = match run.mode {
            ExecutionMode::Phased => self.run_phased(run).await?,
            ExecutionMode::Standard => self.run_standard(run).await?,
        };
        Ok((document, false))
    }

    async fn cached_result(&self, run: &TaskRun) -> Option<CacheHit> {
        let cache = self.cache.as_ref()?;
        match cache.lookup(&run.query, run.mode).await {
            Ok(hit) => hit,
            Err(err) => {
                log::warn!("[{}] query cache lookup failed: {}", run.task_id, err);
                None
            }
        }
    }

    async fn announce_cache_hit(&self, run: &TaskRun, hit: &CacheHit) -> Result<(), OrchestrationError> {
        let message = match &hit.matched {
            CacheMatch::Exact => "Result served from the query cache (exact match)".to_string(),
            CacheMatch::Similar {
                cached_query,
                similarity,
            } => format!(
                "Result served from the query cache (similar to {:?}, similarity {:.2})",
                cached_query, similarity
            ),
        };
        log::info!("[{}] {}", run.task_id, message);
        self.say(run, SYSTEM_SPEAKER, &message).await?;
        self.tasks.mark_from_cache(&run.task_id).await?;
        Ok(())
    }

    // ── phased mode ──────────────────────────────────────────────────────

    async fn run_phased(&self, run: &TaskRun) -> Result<Value, OrchestrationError> {
        self.plan_stage(run).await?;
        self.research_stage(run).await?;

        self.advance(run, TaskStatus::Phase3Report).await?;
        self.say(run, SYSTEM_SPEAKER, "Starting phase 3: report").await?;
        let outcome = self
            .dispatch_phase(run, &run.roster, Phase::Report, None, false)
            .await?;
        self.mark_done(run, &outcome).await?;

        self.advance(run, TaskStatus::GeneratingFinalReport).await?;
        self.synthesize(run, true).await
    }

    async fn plan_stage(&self, run: &TaskRun) -> Result<(), OrchestrationError> {
        self.advance(run, TaskStatus::Phase1Plan).await?;
        self.say(run, SYSTEM_SPEAKER, "Starting phase 1: plan").await?;
        self.dispatch_phase(run, &run.roster, Phase::Plan, None, false)
            .await?;
        self.advance(run, TaskStatus::OrchestratingPlan).await?;

        let budget = self.config.plan_revise_budget;
        let mut revisions = 0u32;
        loop {
            if revisions > 0 && revisions >= budget {
                self.say(
                    run,
                    ORCHESTRATOR_SPEAKER,
                    "Plan revision budget spent, plans approved",
                )
                .await?;
                return Ok(());
            }

            let Some(decision) = self.review(run, ReviewStage::Plan).await? else {
                return Ok(());
            };
            if decision.verdict != Verdict::Revise {
                self.say(run, ORCHESTRATOR_SPEAKER, "Plan review decision: approve")
                    .await?;
                self.emit_review(run, ReviewStage::Plan, decision, true).await;
                return Ok(());
            }
            if revisions >= budget {
                self.say(
                    run,
                    ORCHESTRATOR_SPEAKER,
                    "Plan review asked for a revision but the revision budget is spent, plans approved",
                )
                .await?;
                self.emit_review(run, ReviewStage::Plan, decision, false).await;
                return Ok(());
            }

            revisions += 1;
            let guidance = decision
                .guidance
                .clone()
                .unwrap_or_else(|| DEFAULT_PLAN_GUIDANCE.to_string());
            self.board
                .save_guidance(
                    &run.task_id,
                    ReviewStage::Plan,
                    &guidance,
                    &decision.flagged_agents,
                )
                .await?;
            self.say(
                run,
                ORCHESTRATOR_SPEAKER,
                &format!("Plan review decision: revise. Guidance: {}", guidance),
            )
            .await?;
            self.emit_review(run, ReviewStage::Plan, decision, true).await;

            self.advance(run, TaskStatus::Phase1Plan).await?;
            self.dispatch_phase(run, &run.roster, Phase::Plan, Some(guidance), true)
                .await?;
            self.advance(run, TaskStatus::OrchestratingPlan).await?;
        }
    }

    async fn research_stage(&self, run: &TaskRun) -> Result<(), OrchestrationError> {
        let plan_guidance = self
            .board
            .get_guidance(&run.task_id, ReviewStage::Plan)
            .await?
            .map(|record| record.guidance);

        self.advance(run, TaskStatus::Phase2Research).await?;
        self.say(run, SYSTEM_SPEAKER, "Starting phase 2: research").await?;
        self.dispatch_phase(run, &run.roster, Phase::Research, plan_guidance, false)
            .await?;
        self.advance(run, TaskStatus::OrchestratingResearch).await?;

        loop {
            if self.board.supplement_round(&run.task_id).await? > 0 {
                self.say(
                    run,
                    ORCHESTRATOR_SPEAKER,
                    "Supplement round already used, research approved",
                )
                .await?;
                return Ok(());
            }

            let Some(decision) = self.review(run, ReviewStage::Research).await? else {
                return Ok(());
            };
            if decision.verdict != Verdict::Supplement {
                self.say(run, ORCHESTRATOR_SPEAKER, "Research review decision: approve")
                    .await?;
                self.emit_review(run, ReviewStage::Research, decision, true)
                    .await;
                return Ok(());
            }
            if !self.board.try_start_supplement_round(&run.task_id).await? {
                self.say(
                    run,
                    ORCHESTRATOR_SPEAKER,
                    "Research review asked for a supplement but the round is already used, research approved",
                )
                .await?;
                self.emit_review(run, ReviewStage::Research, decision, false)
                    .await;
                return Ok(());
            }

            let guidance = decision
                .guidance
                .clone()
                .unwrap_or_else(|| DEFAULT_RESEARCH_GUIDANCE.to_string());
            self.board
                .save_guidance(
                    &run.task_id,
                    ReviewStage::Research,
                    &guidance,
                    &decision.flagged_agents,
                )
                .await?;
            let targets = self.supplement_roster(run, &decision.flagged_agents);
            self.say(
                run,
                ORCHESTRATOR_SPEAKER,
                &format!(
                    "Research review decision: supplement for {}. Guidance: {}",
                    targets.ids().join(", "),
                    guidance
                ),
            )
            .await?;
            self.emit_review(run, ReviewStage::Research, decision, true)
                .await;
            self.emit(ForumEvent::SupplementStarted {
                task_id: run.task_id.clone(),
                agents: targets.ids(),
            })
            .await;

            self.advance(run, TaskStatus::Phase2Supplement).await?;
            self.dispatch_phase(run, &targets, Phase::Research, Some(guidance), true)
                .await?;
            self.advance(run, TaskStatus::OrchestratingResearch).await?;
        }
    }

    /// Agents that re-run research in the supplement round.
    fn supplement_roster(&self, run: &TaskRun, flagged: &[String]) -> AgentRoster {
        if self.config.supplement_scope == SupplementScope::AllAgents {
            return run.roster.clone();
        }
        let targets = run.roster.subset(flagged);
        if targets.is_empty() {
            run.roster.clone()
        } else {
            targets
        }
    }

    // ── standard mode ────────────────────────────────────────────────────

    async fn run_standard(&self, run: &TaskRun) -> Result<Value, OrchestrationError> {
        self.advance(run, TaskStatus::Running).await?;
        self.say(
            run,
            SYSTEM_SPEAKER,
            &format!("Starting analysis with {} agent(s)", run.roster.len()),
        )
        .await?;
        let mut last = None;
        for phase in Phase::RUNNABLE {
            last = Some(
                self.dispatch_phase(run, &run.roster, phase, None, false)
                    .await?,
            );
        }
        if let Some(outcome) = &last {
            self.mark_done(run, outcome).await?;
        }

        self.advance(run, TaskStatus::GeneratingReport).await?;
        self.synthesize(run, false).await
    }

    // ── shared steps ─────────────────────────────────────────────────────

    async fn dispatch_phase(
        &self,
        run: &TaskRun,
        roster: &AgentRoster,
        phase: Phase,
        guidance: Option<String>,
        rerun: bool,
    ) -> Result<PhaseOutcome, OrchestrationError> {
        self.ensure_active(run)?;
        self.emit(ForumEvent::PhaseStarted {
            task_id: run.task_id.clone(),
            phase,
            agents: roster.ids(),
            rerun,
        })
        .await;

        let mut dispatch = PhaseDispatch::new(run.task_id.as_str(), run.query.as_str(), phase)
            .with_guidance(guidance)
            .with_timeout(self.config.phase_timeout(phase));
        if rerun {
            dispatch = dispatch.rerun();
        }
        let outcome = self
            .coordinator
            .run_phase_across_agents(&dispatch, roster, &run.cancel)
            .await;

        let failed = outcome.failures().len();
        self.emit(ForumEvent::PhaseCompleted {
            task_id: run.task_id.clone(),
            phase,
            succeeded: outcome.succeeded().len(),
            failed,
        })
        .await;
        if !roster.is_empty() && outcome.all_failed() {
            log::warn!("[{}] every agent failed the {} phase", run.task_id, phase);
        } else if failed > 0 {
            log::warn!(
                "[{}] {} of {} agent(s) failed the {} phase",
                run.task_id,
                failed,
                roster.len(),
                phase
            );
        }

        self.ensure_active(run)?;
        Ok(outcome)
    }

    async fn mark_done(&self, run: &TaskRun, outcome: &PhaseOutcome) -> Result<(), OrchestrationError> {
        for agent in outcome.succeeded() {
            self.board
                .set_agent_phase(&run.task_id, agent, Phase::Done)
                .await?;
        }
        Ok(())
    }

    /// Ask the reviewer about `stage`. `None` means the review failed and the
    /// task proceeds without guidance.
    async fn review(
        &self,
        run: &TaskRun,
        stage: ReviewStage,
    ) -> Result<Option<ReviewDecision>, OrchestrationError> {
        let phase = match stage {
            ReviewStage::Plan => Phase::Plan,
            ReviewStage::Research => Phase::Research,
        };
        let mut submissions = Vec::with_capacity(run.roster.len());
        for agent_id in run.roster.ids() {
            let output = self.board.get_output(&run.task_id, &agent_id, phase).await?;
            submissions.push(AgentSubmission { agent_id, output });
        }
        let request = ReviewRequest {
            task_id: run.task_id.clone(),
            query: run.query.clone(),
            stage,
            submissions,
        };
        self.say(
            run,
            ORCHESTRATOR_SPEAKER,
            &format!("Reviewing the {} of {} agent(s)", stage, run.roster.len()),
        )
        .await?;

        let limit = self.config.review_timeout(stage);
        let result = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(OrchestrationError::Cancelled),
            result = time::timeout(
                limit,
                AssertUnwindSafe(self.reviewer.review(&request)).catch_unwind(),
            ) => match result {
                Ok(Ok(result)) => result,
                Ok(Err(payload)) => Err(ReviewError::Failed(format!(
                    "reviewer panicked: {}",
                    panic_message(payload.as_ref())
                ))),
                Err(_) => Err(ReviewError::Timeout(limit)),
            },
        };

        match result {
            Ok(decision) => {
                log::info!(
                    "[{}] {} review decision: {}",
                    run.task_id,
                    stage,
                    decision.verdict
                );
                Ok(Some(decision))
            }
            Err(err) => {
                log::warn!("[{}] {} review degraded: {}", run.task_id, stage, err);
                self.say(
                    run,
                    ORCHESTRATOR_SPEAKER,
                    &format!(
                        "{} review unavailable ({}), proceeding without guidance",
                        stage.label(),
                        err
                    ),
                )
                .await?;
                self.emit(ForumEvent::ReviewDegraded {
                    task_id: run.task_id.clone(),
                    stage,
                    reason: err.to_string(),
                })
                .await;
                Ok(None)
            }
        }
    }

    async fn synthesize(&self, run: &TaskRun, phased: bool) -> Result<Value, OrchestrationError> {
        let roster = run.roster.ids();
        let reports: Vec<AgentReport> = self
            .board
            .collect_outputs(&run.task_id, &roster, Phase::Report)
            .await?
            .into_iter()
            .map(|(agent_id, report)| AgentReport { agent_id, report })
            .collect();
        if reports.is_empty() {
            return Err(SynthesisError::NoReports {
                failed_agents: roster,
            }
            .into());
        }

        let forum_log = self.board.forum_log(&run.task_id).await?;
        let request = SynthesisRequest {
            task_id: run.task_id.clone(),
            query: run.query.clone(),
            forum_log_text: format_forum_log(&forum_log),
            forum_summary: summarize_forum_log(&forum_log, self.config.forum_summary_chars),
            forum_log,
            roster,
            reports,
            phased,
        };
        let missing = request.missing_agents();
        if !missing.is_empty() {
            log::warn!(
                "[{}] synthesizing without reports from {}",
                run.task_id,
                missing.join(", ")
            );
        }
        log::info!(
            "[{}] synthesizing report from {} agent report(s)",
            run.task_id,
            request.reports.len()
        );

        let raw = AssertUnwindSafe(self.synthesizer.synthesize(&request))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(SynthesisError::Failed(format!(
                    "synthesizer panicked: {}",
                    panic_message(payload.as_ref())
                )))
            })?;
        Ok(finalize_report_document(&request, raw))
    }

    async fn finish(
        &self,
        run: &TaskRun,
        document: &Value,
        from_cache: bool,
    ) -> Result<(), OrchestrationError> {
        self.tasks.save_result(&run.task_id, document).await?;
        if !from_cache {
            if let Some(cache) = &self.cache {
                if let Err(err) = cache.store(&run.query, run.mode, document).await {
                    log::warn!("[{}] could not cache result: {}", run.task_id, err);
                }
            }
            self.say(run, SYSTEM_SPEAKER, "Final report generated").await?;
        }
        self.advance(run, TaskStatus::Completed).await?;
        log::info!("[{}] task completed", run.task_id);
        self.emit(ForumEvent::TaskCompleted {
            task_id: run.task_id.clone(),
            from_cache,
        })
        .await;
        Ok(())
    }

    async fn fail(&self, run: &TaskRun, err: &OrchestrationError) {
        log::error!("[{}] task failed: {}", run.task_id, err);
        if let Err(log_err) = self
            .board
            .append_forum_log(&run.task_id, SYSTEM_SPEAKER, &format!("Task failed: {}", err))
            .await
        {
            log::warn!("[{}] could not append forum log: {}", run.task_id, log_err);
        }
        if let Err(store_err) = self
            .tasks
            .update_status(&run.task_id, TaskStatus::Failed, Some(err.to_string()))
            .await
        {
            log::error!(
                "[{}] could not record failure: {}",
                run.task_id,
                store_err
            );
        }
        self.emit(ForumEvent::TaskFailed {
            task_id: run.task_id.clone(),
            error: err.to_string(),
        })
        .await;
    }

    fn ensure_active(&self, run: &TaskRun) -> Result<(), OrchestrationError> {
        if run.cancel.is_cancelled() {
            Err(OrchestrationError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Persist `status`. A record that some other party already moved to a
    /// terminal status (cancellation) stops the run.
    async fn advance(&self, run: &TaskRun, status: TaskStatus) -> Result<(), OrchestrationError> {
        if status != TaskStatus::Completed {
            self.ensure_active(run)?;
        }
        let record = self
            .tasks
            .update_status(&run.task_id, status, None)
            .await?
            .ok_or_else(|| OrchestrationError::TaskNotFound(run.task_id.clone()))?;
        if record.status != status && record.status.is_terminal() {
            return Err(OrchestrationError::Cancelled);
        }
        Ok(())
    }

    async fn say(&self, run: &TaskRun, speaker: &str, content: &str) -> Result<(), OrchestrationError> {
        self.board
            .append_forum_log(&run.task_id, speaker, content)
            .await?;
        Ok(())
    }

    async fn emit_review(
        &self,
        run: &TaskRun,
        stage: ReviewStage,
        decision: ReviewDecision,
        applied: bool,
    ) {
        self.emit(ForumEvent::ReviewCompleted {
            task_id: run.task_id.clone(),
            stage,
            decision,
            applied,
        })
        .await;
    }

    async fn emit(&self, event: ForumEvent) {
        if let Some(handler) = &self.event_handler {
            notify(handler.as_ref(), &event).await;
        }
    }
}
