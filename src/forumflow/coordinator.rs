//! Running one phase across many agents.
//!
//! [`PhaseCoordinator::run_phase_across_agents`] spawns one tokio task per
//! agent. Each task waits for a permit from a semaphore shared by every task
//! the coordinator serves, so the worker pool stays bounded no matter how many
//! tasks are in flight. The coordinator then waits until every agent has
//! finished, the phase deadline passes, or the task is cancelled, whichever
//! happens first. Agents still running at that point are aborted and recorded
//! as timed out (or cancelled).
//!
//! A unit of work owns its agent's keys: it marks the phase, saves the output,
//! writes its progress record and reports its milestones to the forum log. The
//! coordinator only writes for units it had to abort.
//!
//! Failures never short-circuit sibling agents; they come back in the
//! [`PhaseOutcome`] for the orchestrator to absorb.

use crate::agent::{
    AgentFailure, AgentProgress, AgentRoster, AgentRunStatus, AgentRunner, FailureKind, Phase,
    PhaseRequest, PhaseResult, PriorOutputs,
};
use crate::blackboard::{Blackboard, BlackboardError};
use crate::event::{notify, EventHandler, ForumEvent};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{AbortHandle, JoinError};
use tokio::time::{self, Instant};

// Stand-in deadline for timeouts too large to add to an Instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `timeout` from now. Timeouts past the range of [`Instant`] wait
/// practically forever instead of overflowing.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Cooperative cancellation signal shared by everything working on one task.
///
/// ```rust
/// use forumflow::coordinator::CancelFlag;
///
/// # #[tokio::main]
/// # async fn main() {
/// let flag = CancelFlag::new();
/// let waiter = flag.clone();
/// let handle = tokio::spawn(async move { waiter.cancelled().await });
/// flag.cancel();
/// handle.await.unwrap();
/// assert!(flag.is_cancelled());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel() is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Whether agents that already completed the phase run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// First run of the phase. An agent whose progress record says the phase
    /// is already completed is not re-run; its stored output is reused.
    Fresh,
    /// Explicit re-run (plan revision, research supplement).
    Rerun,
}

/// What to run: one phase of one task.
#[derive(Debug, Clone)]
pub struct PhaseDispatch {
    pub task_id: String,
    pub query: String,
    pub phase: Phase,
    /// Reviewer guidance handed to every dispatched agent.
    pub guidance: Option<String>,
    pub mode: DispatchMode,
    /// Soft deadline for the whole phase.
    pub timeout: Duration,
}

impl PhaseDispatch {
    pub fn new(task_id: impl Into<String>, query: impl Into<String>, phase: Phase) -> Self {
        Self {
            task_id: task_id.into(),
            query: query.into(),
            phase,
            guidance: None,
            mode: DispatchMode::Fresh,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_guidance(mut self, guidance: Option<String>) -> Self {
        self.guidance = guidance;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rerun(mut self) -> Self {
        self.mode = DispatchMode::Rerun;
        self
    }
}

/// Per-agent results of one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub results: BTreeMap<String, Result<Value, AgentFailure>>,
}

impl PhaseOutcome {
    pub fn succeeded(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_ok())
            .map(|(agent, _)| agent.as_str())
            .collect()
    }

    pub fn failures(&self) -> Vec<(&str, &AgentFailure)> {
        self.results
            .iter()
            .filter_map(|(agent, result)| result.as_ref().err().map(|err| (agent.as_str(), err)))
            .collect()
    }

    pub fn output(&self, agent: &str) -> Option<&Value> {
        self.results.get(agent).and_then(|result| result.as_ref().ok())
    }

    pub fn all_failed(&self) -> bool {
        self.results.values().all(|result| result.is_err())
    }
}

enum Wake {
    Finished(String, Result<Result<Value, AgentFailure>, JoinError>),
    Deadline,
    Cancelled,
}

/// Fans one phase out over a roster on a bounded worker pool.
#[derive(Clone)]
pub struct PhaseCoordinator {
    board: Blackboard,
    permits: Arc<Semaphore>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl PhaseCoordinator {
    /// `concurrency` is the number of agent phases allowed to run at once
    /// across every task served by this coordinator (minimum 1).
    pub fn new(board: Blackboard, concurrency: usize) -> Self {
        Self {
            board,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            event_handler: None,
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.board
    }

    /// Permits currently free in the worker pool.
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    async fn emit(&self, event: ForumEvent) {
        if let Some(handler) = &self.event_handler {
            notify(handler.as_ref(), &event).await;
        }
    }

    /// Run `dispatch.phase` for every agent in `roster` and collect one result
    /// per agent.
    ///
    /// If `cancel` is already set nothing is dispatched and every agent is
    /// reported as cancelled.
    pub async fn run_phase_across_agents(
        &self,
        dispatch: &PhaseDispatch,
        roster: &AgentRoster,
        cancel: &CancelFlag,
    ) -> PhaseOutcome {
        let mut results = BTreeMap::new();

        if cancel.is_cancelled() {
            for id in roster.ids() {
                results.insert(id, Err(AgentFailure::cancelled()));
            }
            return PhaseOutcome {
                phase: dispatch.phase,
                results,
            };
        }

        log::info!(
            "[{}] dispatching {} phase to {} agent(s){}",
            dispatch.task_id,
            dispatch.phase,
            roster.len(),
            if dispatch.mode == DispatchMode::Rerun {
                " (rerun)"
            } else {
                ""
            }
        );

        let deadline = deadline_after(dispatch.timeout);
        let mut aborts: HashMap<String, AbortHandle> = HashMap::new();
        let mut pending = FuturesUnordered::new();

        for entry in roster.entries() {
            let unit = UnitOfWork {
                board: self.board.clone(),
                permits: self.permits.clone(),
                runner: entry.runner.clone(),
                agent_id: entry.id.clone(),
                dispatch: dispatch.clone(),
            };
            let handle = tokio::spawn(unit.run());
            aborts.insert(entry.id.clone(), handle.abort_handle());
            let agent_id = entry.id.clone();
            pending.push(async move { (agent_id, handle.await) });
        }

        while !pending.is_empty() {
            let wake = tokio::select! {
                biased;
                Some((agent_id, joined)) = pending.next() => Wake::Finished(agent_id, joined),
                _ = time::sleep_until(deadline) => Wake::Deadline,
                _ = cancel.cancelled() => Wake::Cancelled,
            };

            match wake {
                Wake::Finished(agent_id, joined) => {
                    aborts.remove(&agent_id);
                    let result = match joined {
                        Ok(result) => result,
                        Err(err) => {
                            let failure = if err.is_cancelled() {
                                AgentFailure::cancelled()
                            } else {
                                AgentFailure::crashed(err.to_string())
                            };
                            self.record_abandoned(dispatch, &agent_id, &failure).await;
                            Err(failure)
                        }
                    };
                    self.emit_result(dispatch, &agent_id, &result).await;
                    results.insert(agent_id, result);
                }
                Wake::Deadline => {
                    log::warn!(
                        "[{}] {} phase deadline of {:?} passed with {} agent(s) still running",
                        dispatch.task_id,
                        dispatch.phase,
                        dispatch.timeout,
                        aborts.len()
                    );
                    self.abandon(dispatch, &mut aborts, AgentFailure::timeout(), &mut results)
                        .await;
                    break;
                }
                Wake::Cancelled => {
                    log::warn!(
                        "[{}] {} phase cancelled with {} agent(s) still running",
                        dispatch.task_id,
                        dispatch.phase,
                        aborts.len()
                    );
                    self.abandon(dispatch, &mut aborts, AgentFailure::cancelled(), &mut results)
                        .await;
                    break;
                }
            }
        }

        let outcome = PhaseOutcome {
            phase: dispatch.phase,
            results,
        };
        log::info!(
            "[{}] {} phase finished: {} succeeded, {} failed",
            dispatch.task_id,
            dispatch.phase,
            outcome.succeeded().len(),
            outcome.failures().len()
        );
        outcome
    }

    async fn abandon(
        &self,
        dispatch: &PhaseDispatch,
        aborts: &mut HashMap<String, AbortHandle>,
        failure: AgentFailure,
        results: &mut BTreeMap<String, Result<Value, AgentFailure>>,
    ) {
        let mut stragglers: Vec<(String, AbortHandle)> = aborts.drain().collect();
        stragglers.sort_by(|a, b| a.0.cmp(&b.0));
        for (agent_id, abort) in stragglers {
            abort.abort();
            self.record_abandoned(dispatch, &agent_id, &failure).await;
            let result = Err(failure.clone());
            self.emit_result(dispatch, &agent_id, &result).await;
            results.insert(agent_id, result);
        }
    }

    async fn emit_result(
        &self,
        dispatch: &PhaseDispatch,
        agent_id: &str,
        result: &Result<Value, AgentFailure>,
    ) {
        let event = match result {
            Ok(_) => ForumEvent::AgentPhaseCompleted {
                task_id: dispatch.task_id.clone(),
                agent_id: agent_id.to_string(),
                phase: dispatch.phase,
            },
            Err(failure) => ForumEvent::AgentPhaseFailed {
                task_id: dispatch.task_id.clone(),
                agent_id: agent_id.to_string(),
                phase: dispatch.phase,
                failure: failure.clone(),
            },
        };
        self.emit(event).await;
    }

    /// Bookkeeping for a unit that never got to write its own failure.
    async fn record_abandoned(&self, dispatch: &PhaseDispatch, agent_id: &str, failure: &AgentFailure) {
        let progress = AgentProgress::failed(dispatch.phase, failure);
        if let Err(err) = self
            .board
            .save_agent_progress(&dispatch.task_id, agent_id, &progress)
            .await
        {
            log::warn!(
                "[{}] could not record failure for {}: {}",
                dispatch.task_id,
                agent_id,
                err
            );
        }
        let message = failure_message(dispatch.phase, failure);
        if let Err(err) = self
            .board
            .append_forum_log(&dispatch.task_id, agent_id, &message)
            .await
        {
            log::warn!(
                "[{}] could not append forum log for {}: {}",
                dispatch.task_id,
                agent_id,
                err
            );
        }
    }
}

/// One agent executing one phase.
struct UnitOfWork {
    board: Blackboard,
    permits: Arc<Semaphore>,
    runner: Arc<dyn AgentRunner>,
    agent_id: String,
    dispatch: PhaseDispatch,
}

impl UnitOfWork {
    async fn run(self) -> Result<Value, AgentFailure> {
        let task_id = self.dispatch.task_id.clone();
        let phase = self.dispatch.phase;

        if self.dispatch.mode == DispatchMode::Fresh {
            if let Some(output) = self.completed_output().await.map_err(blackboard_failure)? {
                log::debug!(
                    "[{}] {} already completed {}, reusing stored output",
                    task_id,
                    self.agent_id,
                    phase
                );
                return Ok(output);
            }
        }

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| AgentFailure::crashed(format!("worker pool closed: {}", err)))?;

        let request = self.request().await.map_err(blackboard_failure)?;
        self.mark_started().await.map_err(blackboard_failure)?;

        match self.runner.run_phase(request).await {
            Ok(result) => {
                self.record_success(&result).await.map_err(blackboard_failure)?;
                Ok(result.output)
            }
            Err(failure) => {
                log::warn!("[{}] {} {}: {}", task_id, self.agent_id, phase, failure);
                self.record_failure(&failure).await.map_err(blackboard_failure)?;
                Err(failure)
            }
        }
    }

    async fn completed_output(&self) -> Result<Option<Value>, BlackboardError> {
        let task_id = &self.dispatch.task_id;
        let phase = self.dispatch.phase;
        let done = self
            .board
            .get_agent_progress(task_id, &self.agent_id)
            .await?
            .map(|progress| progress.completed(phase))
            .unwrap_or(false);
        if !done {
            return Ok(None);
        }
        self.board.get_output(task_id, &self.agent_id, phase).await
    }

    async fn request(&self) -> Result<PhaseRequest, BlackboardError> {
        let task_id = &self.dispatch.task_id;
        let phase = self.dispatch.phase;
        // A rerun also sees the agent's own earlier output for this phase, so
        // a revision or supplement builds on it instead of starting over.
        let rerun = self.dispatch.mode == DispatchMode::Rerun;
        let mut prior = PriorOutputs::default();
        if phase.rank() > Phase::Plan.rank() || (rerun && phase == Phase::Plan) {
            prior.plan = self.board.get_plan(task_id, &self.agent_id).await?;
        }
        if phase.rank() > Phase::Research.rank() || (rerun && phase == Phase::Research) {
            prior.research = self.board.get_research(task_id, &self.agent_id).await?;
        }
        Ok(PhaseRequest {
            task_id: task_id.clone(),
            agent_id: self.agent_id.clone(),
            query: self.dispatch.query.clone(),
            phase,
            prior,
            guidance: self.dispatch.guidance.clone(),
            rerun,
        })
    }

    async fn mark_started(&self) -> Result<(), BlackboardError> {
        let task_id = &self.dispatch.task_id;
        let phase = self.dispatch.phase;
        self.board
            .set_agent_phase(task_id, &self.agent_id, phase)
            .await?;
        self.board
            .save_agent_progress(
                task_id,
                &self.agent_id,
                &AgentProgress::new(phase, AgentRunStatus::Running, 0),
            )
            .await?;
        let message = match (&self.dispatch.mode, &self.dispatch.guidance) {
            (DispatchMode::Rerun, Some(_)) => {
                format!("{} phase started again with orchestrator guidance", phase.label())
            }
            (DispatchMode::Rerun, None) => format!("{} phase started again", phase.label()),
            (DispatchMode::Fresh, _) => format!("{} phase started", phase.label()),
        };
        self.board
            .append_forum_log(task_id, &self.agent_id, &message)
            .await?;
        Ok(())
    }

    async fn record_success(&self, result: &PhaseResult) -> Result<(), BlackboardError> {
        let task_id = &self.dispatch.task_id;
        let phase = self.dispatch.phase;
        self.board
            .save_output(task_id, &self.agent_id, phase, result.output.clone())
            .await?;
        self.board
            .save_agent_progress(
                task_id,
                &self.agent_id,
                &AgentProgress::new(phase, AgentRunStatus::Completed, 100),
            )
            .await?;
        self.board
            .append_forum_log(
                task_id,
                &self.agent_id,
                &format!("{} completed", phase.label()),
            )
            .await?;
        Ok(())
    }

    async fn record_failure(&self, failure: &AgentFailure) -> Result<(), BlackboardError> {
        let task_id = &self.dispatch.task_id;
        let phase = self.dispatch.phase;
        self.board
            .save_agent_progress(task_id, &self.agent_id, &AgentProgress::failed(phase, failure))
            .await?;
        self.board
            .append_forum_log(
                task_id,
                &self.agent_id,
                &failure_message(phase, failure),
            )
            .await?;
        Ok(())
    }
}

fn failure_message(phase: Phase, failure: &AgentFailure) -> String {
    match failure.kind {
        FailureKind::Timeout => format!("{} timed out", phase.label()),
        FailureKind::Cancelled => format!("{} cancelled", phase.label()),
        FailureKind::Error | FailureKind::Crashed => {
            format!("{} failed: {}", phase.label(), failure.reason)
        }
    }
}

fn blackboard_failure(err: BlackboardError) -> AgentFailure {
    AgentFailure::new(format!("blackboard: {}", err))
}
