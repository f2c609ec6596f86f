//! Phase reviews.
//!
//! After the plan phase and after the research phase the orchestrator asks a
//! [`Reviewer`] whether the agents' work is good enough to move on. A plan
//! review may answer `revise`, a research review may answer `supplement`; both
//! may answer `approve`. Whatever the reviewer answers, the orchestrator stays
//! in charge of the budgets (one plan revision, one supplement round) and of
//! what happens when the reviewer fails.
//!
//! [`LlmReviewer`] renders a review prompt, sends it through a
//! [`ClientWrapper`] and parses a reply of the form
//!
//! ```text
//! DECISION: SUPPLEMENT
//! GUIDANCE: Cover regional sentiment on short-video platforms.
//! AGENTS: media, insight
//! ```
//!
//! If the primary model rejects the prompt on content-policy grounds, the
//! review is retried once on an optional fallback client.

use crate::client_wrapper::{ClientWrapper, Message};
use crate::clients::openai::OpenAIClient;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const SYSTEM_PROMPT: &str =
    "You are the coordinator of a research project, reviewing the work of its agents. Reply concisely.";

const CONTENT_POLICY_MARKERS: &[&str] = &["inappropriate content", "content policy"];

/// Which review is being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStage {
    Plan,
    Research,
}

impl ReviewStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStage::Plan => "plan",
            ReviewStage::Research => "research",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReviewStage::Plan => "Plan",
            ReviewStage::Research => "Research",
        }
    }

    /// The non-approve verdict this stage accepts.
    pub fn corrective_verdict(&self) -> Verdict {
        match self {
            ReviewStage::Plan => Verdict::Revise,
            ReviewStage::Research => Verdict::Supplement,
        }
    }
}

impl fmt::Display for ReviewStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approve,
    Revise,
    Supplement,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::Revise => "revise",
            Verdict::Supplement => "supplement",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reviewer's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub verdict: Verdict,
    pub guidance: Option<String>,
    /// Agents the guidance is aimed at. Empty means every agent.
    #[serde(default)]
    pub flagged_agents: Vec<String>,
}

impl ReviewDecision {
    pub fn approve() -> Self {
        Self {
            verdict: Verdict::Approve,
            guidance: None,
            flagged_agents: Vec::new(),
        }
    }

    pub fn revise(guidance: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Revise,
            guidance: Some(guidance.into()),
            flagged_agents: Vec::new(),
        }
    }

    pub fn supplement(guidance: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Supplement,
            guidance: Some(guidance.into()),
            flagged_agents: Vec::new(),
        }
    }

    pub fn with_flagged_agents(mut self, agents: Vec<String>) -> Self {
        self.flagged_agents = agents;
        self
    }

    pub fn is_approve(&self) -> bool {
        self.verdict == Verdict::Approve
    }
}

/// One agent's output as shown to the reviewer. `output` is `None` when the
/// agent failed or timed out.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSubmission {
    pub agent_id: String,
    pub output: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRequest {
    pub task_id: String,
    pub query: String,
    pub stage: ReviewStage,
    pub submissions: Vec<AgentSubmission>,
}

impl ReviewRequest {
    pub fn agent_ids(&self) -> Vec<String> {
        self.submissions
            .iter()
            .map(|submission| submission.agent_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewError {
    /// The reviewer could not produce a decision.
    Failed(String),
    /// The review did not finish within its deadline.
    Timeout(Duration),
}

impl fmt::Display for ReviewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewError::Failed(msg) => write!(f, "Review failed: {}", msg),
            ReviewError::Timeout(after) => write!(f, "Review timed out after {:?}", after),
        }
    }
}

impl Error for ReviewError {}

/// Decides whether a phase's results are good enough to proceed.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, request: &ReviewRequest) -> Result<ReviewDecision, ReviewError>;
}

/// Approves everything. Used when no reviewer model is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApproveReviewer;

#[async_trait]
impl Reviewer for AutoApproveReviewer {
    async fn review(&self, _request: &ReviewRequest) -> Result<ReviewDecision, ReviewError> {
        Ok(ReviewDecision::approve())
    }
}

/// Reviewer backed by a chat model.
pub struct LlmReviewer {
    client: Arc<dyn ClientWrapper>,
    fallback: Option<Arc<dyn ClientWrapper>>,
}

impl LlmReviewer {
    pub fn new(client: Arc<dyn ClientWrapper>) -> Self {
        Self {
            client,
            fallback: None,
        }
    }

    /// Client retried once when the primary model refuses the prompt on
    /// content-policy grounds.
    pub fn with_fallback(mut self, fallback: Arc<dyn ClientWrapper>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    async fn ask(
        &self,
        task_id: &str,
        messages: &[Message],
    ) -> Result<String, ReviewError> {
        log::info!(
            "[{}] requesting review from {}",
            task_id,
            self.client.model_name()
        );
        match self.client.send_message(messages).await {
            Ok(reply) => Ok(reply.content),
            Err(err) if is_content_policy_error(err.as_ref()) => {
                let Some(fallback) = &self.fallback else {
                    return Err(ReviewError::Failed(format!(
                        "content policy rejection and no fallback model: {}",
                        err
                    )));
                };
                log::warn!(
                    "[{}] content policy rejection from {}, retrying on {}",
                    task_id,
                    self.client.model_name(),
                    fallback.model_name()
                );
                fallback
                    .send_message(messages)
                    .await
                    .map(|reply| reply.content)
                    .map_err(|err| ReviewError::Failed(format!("fallback model failed: {}", err)))
            }
            Err(err) => Err(ReviewError::Failed(err.to_string())),
        }
    }
}

#[async_trait]
impl Reviewer for LlmReviewer {
    async fn review(&self, request: &ReviewRequest) -> Result<ReviewDecision, ReviewError> {
        let prompt = render_review_prompt(request);
        let messages = [Message::system(SYSTEM_PROMPT), Message::user(prompt)];
        let content = self.ask(&request.task_id, &messages).await?;

        if content.trim().is_empty() {
            log::warn!("[{}] reviewer returned an empty reply, approving", request.task_id);
            return Ok(ReviewDecision::approve());
        }

        let decision = parse_decision(&content, request.stage);
        log::info!(
            "[{}] {} review decision: {}",
            request.task_id,
            request.stage,
            decision.verdict
        );
        Ok(decision)
    }
}

fn is_content_policy_error(err: &(dyn Error + Send + Sync)) -> bool {
    let message = err.to_string().to_lowercase();
    CONTENT_POLICY_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Parse a `DECISION:` / `GUIDANCE:` / `AGENTS:` reply.
///
/// Anything unparseable, and any verdict the stage does not accept, becomes
/// `approve`. Guidance may continue over several lines.
///
/// ```
/// use forumflow::reviewer::{parse_decision, ReviewStage, Verdict};
///
/// let reply = "DECISION: REVISE\nGUIDANCE: add pricing keywords\nAGENTS: query";
/// let decision = parse_decision(reply, ReviewStage::Plan);
/// assert_eq!(decision.verdict, Verdict::Revise);
/// assert_eq!(decision.guidance.as_deref(), Some("add pricing keywords"));
/// assert_eq!(decision.flagged_agents, vec!["query"]);
///
/// // A plan review cannot ask for a supplement.
/// let decision = parse_decision("DECISION: SUPPLEMENT", ReviewStage::Plan);
/// assert_eq!(decision.verdict, Verdict::Approve);
/// ```
pub fn parse_decision(content: &str, stage: ReviewStage) -> ReviewDecision {
    let mut verdict = Verdict::Approve;
    let mut guidance_lines: Vec<String> = Vec::new();
    let mut flagged_agents = Vec::new();
    let mut in_guidance = false;

    for raw in content.lines() {
        let line = raw.trim();
        if line.starts_with("```") {
            in_guidance = false;
            continue;
        }
        if let Some(rest) = strip_label(line, "DECISION:") {
            in_guidance = false;
            let text = rest.to_lowercase();
            verdict = if text.contains("revise") {
                Verdict::Revise
            } else if text.contains("supplement") {
                Verdict::Supplement
            } else {
                Verdict::Approve
            };
        } else if let Some(rest) = strip_label(line, "GUIDANCE:") {
            in_guidance = true;
            guidance_lines.clear();
            if !rest.is_empty() {
                guidance_lines.push(rest.to_string());
            }
        } else if let Some(rest) = strip_label(line, "AGENTS:") {
            in_guidance = false;
            flagged_agents = rest
                .split(|c: char| c == ',' || c.is_whitespace())
                .map(|agent| agent.trim().to_string())
                .filter(|agent| !agent.is_empty())
                .collect();
        } else if in_guidance && !line.is_empty() {
            guidance_lines.push(line.to_string());
        }
    }

    if verdict != Verdict::Approve && verdict != stage.corrective_verdict() {
        verdict = Verdict::Approve;
    }
    let guidance = Some(guidance_lines.join("\n"))
        .filter(|text| !text.is_empty() && !text.eq_ignore_ascii_case("none"));

    ReviewDecision {
        verdict,
        guidance,
        flagged_agents,
    }
}

fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let head = line.get(..label.len())?;
    if head.eq_ignore_ascii_case(label) {
        line.get(label.len()..).map(str::trim)
    } else {
        None
    }
}

fn join_list(value: &Value) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Readable rendering of a plan for the review prompt.
///
/// ```
/// use forumflow::reviewer::format_plan;
/// use serde_json::json;
///
/// let plan = json!({ "keywords": ["ev", "battery"], "search_strategy": "news first" });
/// assert_eq!(format_plan(Some(&plan)), "Keywords: ev, battery\nSearch strategy: news first");
/// assert_eq!(format_plan(None), "(no plan)");
/// ```
pub fn format_plan(plan: Option<&Value>) -> String {
    let Some(plan) = plan else {
        return "(no plan)".to_string();
    };
    let Some(fields) = plan.as_object() else {
        return match plan {
            Value::String(text) if !text.is_empty() => text.clone(),
            Value::Null => "(no plan)".to_string(),
            other => other.to_string(),
        };
    };
    if fields.is_empty() {
        return "(no plan)".to_string();
    }

    let labelled = [
        ("keywords", "Keywords"),
        ("search_strategy", "Search strategy"),
        ("report_structure", "Report structure"),
        ("media_types", "Media types"),
        ("analysis_aspects", "Analysis aspects"),
    ];
    let lines: Vec<String> = labelled
        .iter()
        .filter_map(|(key, label)| {
            fields
                .get(*key)
                .map(|value| format!("{}: {}", label, join_list(value)))
        })
        .collect();

    if lines.is_empty() {
        plan.to_string()
    } else {
        lines.join("\n")
    }
}

/// Short summary of research findings for the review prompt.
///
/// Uses the first three `paragraphs` (title plus `latest_summary` or
/// `summary`, 200 characters each) when present, then a `result` string cut
/// to 500 characters, then the raw value cut to 500 characters.
pub fn summarize_research(research: Option<&Value>) -> String {
    const EMPTY: &str = "(no research results)";
    let research = match research {
        None | Some(Value::Null) => return EMPTY.to_string(),
        Some(value) => value,
    };

    if let Some(paragraphs) = research.get("paragraphs").and_then(Value::as_array) {
        let summaries: Vec<String> = paragraphs
            .iter()
            .take(3)
            .filter_map(|paragraph| {
                let title = paragraph.get("title").and_then(Value::as_str).unwrap_or("");
                let content = paragraph
                    .get("latest_summary")
                    .and_then(Value::as_str)
                    .filter(|text| !text.is_empty())
                    .or_else(|| paragraph.get("summary").and_then(Value::as_str))
                    .unwrap_or("");
                if title.is_empty() || content.is_empty() {
                    None
                } else {
                    Some(format!("[{}] {}...", title, truncate_chars(content, 200)))
                }
            })
            .collect();
        if !summaries.is_empty() {
            return summaries.join("\n");
        }
    }

    let result = research
        .get("result")
        .and_then(Value::as_str)
        .or_else(|| research.as_str())
        .unwrap_or("");
    if !result.is_empty() {
        let mut summary = truncate_chars(result, 500);
        if result.chars().count() > 500 {
            summary.push_str("...");
        }
        return summary;
    }

    match research {
        Value::Object(fields) if fields.is_empty() => EMPTY.to_string(),
        other => truncate_chars(&other.to_string(), 500),
    }
}

/// Render the review prompt for `request`.
pub fn render_review_prompt(request: &ReviewRequest) -> String {
    let agent_count = request.submissions.len();
    let mut sections = String::new();
    for submission in &request.submissions {
        let body = match request.stage {
            ReviewStage::Plan => format_plan(submission.output.as_ref()),
            ReviewStage::Research => summarize_research(submission.output.as_ref()),
        };
        sections.push_str(&format!("**{}**:\n{}\n\n", submission.agent_id, body));
    }
    let agent_ids = request.agent_ids().join(", ");
    let date = Utc::now().format("%Y-%m-%d");

    match request.stage {
        ReviewStage::Plan => format!(
            "You are the coordinator of a research project, reviewing the research plans of {count} agents.\n\n\
             **Current date**: {date}\n\n\
             **Original query**: {query}\n\n\
             **Agent plans**:\n\n{sections}\
             Assess whether these plans:\n\
             1. cover every aspect of the query\n\
             2. complement each other without major gaps\n\
             3. use sensible keywords and search strategies\n\n\
             **Give your decision**:\n\n\
             - If the plans are sound overall, reply APPROVE\n\
             - If they need adjusting, reply REVISE and explain what to change\n\n\
             Format:\n\
             ```\n\
             DECISION: [APPROVE/REVISE]\n\
             GUIDANCE: [concrete suggestions if REVISE, otherwise leave empty]\n\
             AGENTS: [comma-separated agents the guidance is for, from: {agents}; empty means all]\n\
             ```\n",
            count = agent_count,
            date = date,
            query = request.query,
            sections = sections,
            agents = agent_ids,
        ),
        ReviewStage::Research => format!(
            "You are the coordinator of a research project, reviewing the research results of {count} agents.\n\n\
             **Current date**: {date}\n\n\
             **Original query**: {query}\n\n\
             **Research summaries**:\n\n{sections}\
             Assess whether these results:\n\
             1. fully answer the original query\n\
             2. meet the quality bar\n\
             3. need more information\n\n\
             **Give your decision**:\n\n\
             - If the results are sufficient, reply APPROVE\n\
             - If they need more work, reply SUPPLEMENT and describe what to add\n\n\
             Note: at most one supplementary round is allowed, so decide carefully.\n\n\
             Format:\n\
             ```\n\
             DECISION: [APPROVE/SUPPLEMENT]\n\
             GUIDANCE: [what to research further if SUPPLEMENT, otherwise leave empty]\n\
             AGENTS: [comma-separated agents that should supplement, from: {agents}; empty means all]\n\
             ```\n",
            count = agent_count,
            date = date,
            query = request.query,
            sections = sections,
            agents = agent_ids,
        ),
    }
}

/// Connection settings for one chat endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSettings {
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: String,
}

impl EndpointSettings {
    fn client(&self) -> Arc<dyn ClientWrapper> {
        match &self.base_url {
            Some(base_url) => Arc::new(OpenAIClient::new_with_base_url(
                &self.api_key,
                &self.model,
                base_url,
            )),
            None => Arc::new(OpenAIClient::new_with_model_string(
                &self.api_key,
                &self.model,
            )),
        }
    }
}

/// Reviewer model configuration, usually read from the environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewerSettings {
    /// `None` when no API key is configured; reviews then auto-approve.
    pub primary: Option<EndpointSettings>,
    pub content_policy_fallback: Option<EndpointSettings>,
}

impl ReviewerSettings {
    pub const DEFAULT_MODEL: &'static str = "qwen3-max";
    pub const DEFAULT_FALLBACK_BASE_URL: &'static str = "https://api.deepseek.com";
    pub const DEFAULT_FALLBACK_MODEL: &'static str = "deepseek-chat";

    /// Resolve settings from the process environment.
    ///
    /// - key: `ORCHESTRATOR_API_KEY`, then `REPORT_ENGINE_API_KEY`, then `OPENAI_API_KEY`
    /// - base URL: `ORCHESTRATOR_BASE_URL`, then `REPORT_ENGINE_BASE_URL`
    /// - model: `ORCHESTRATOR_MODEL_NAME`, then `REPORT_ENGINE_MODEL_NAME`, then `qwen3-max`
    /// - fallback: `DEEPSEEK_API_KEY`, `DEEPSEEK_BASE_URL`, `DEEPSEEK_MODEL_NAME`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same resolution as [`from_env`](Self::from_env) over any lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| {
            names
                .iter()
                .filter_map(|name| lookup(*name))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
        };

        let primary = first(&[
            "ORCHESTRATOR_API_KEY",
            "REPORT_ENGINE_API_KEY",
            "OPENAI_API_KEY",
        ])
        .map(|api_key| EndpointSettings {
            api_key,
            base_url: first(&["ORCHESTRATOR_BASE_URL", "REPORT_ENGINE_BASE_URL"]),
            model: first(&["ORCHESTRATOR_MODEL_NAME", "REPORT_ENGINE_MODEL_NAME"])
                .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
        });

        let content_policy_fallback = first(&["DEEPSEEK_API_KEY"]).map(|api_key| EndpointSettings {
            api_key,
            base_url: Some(
                first(&["DEEPSEEK_BASE_URL"])
                    .unwrap_or_else(|| Self::DEFAULT_FALLBACK_BASE_URL.to_string()),
            ),
            model: first(&["DEEPSEEK_MODEL_NAME"])
                .unwrap_or_else(|| Self::DEFAULT_FALLBACK_MODEL.to_string()),
        });

        Self {
            primary,
            content_policy_fallback,
        }
    }

    /// Build the reviewer these settings describe.
    pub fn build(&self) -> Arc<dyn Reviewer> {
        let Some(primary) = &self.primary else {
            log::warn!("no reviewer API key configured, phase reviews will auto-approve");
            return Arc::new(AutoApproveReviewer);
        };
        let mut reviewer = LlmReviewer::new(primary.client());
        if let Some(fallback) = &self.content_policy_fallback {
            reviewer = reviewer.with_fallback(fallback.client());
        }
        Arc::new(reviewer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn multi_line_guidance_and_agents() {
        let reply = "```\nDECISION: supplement\nGUIDANCE: look at regional data\nand at forums\nAGENTS: media, insight\n```";
        let decision = parse_decision(reply, ReviewStage::Research);
        assert_eq!(decision.verdict, Verdict::Supplement);
        assert_eq!(
            decision.guidance.as_deref(),
            Some("look at regional data\nand at forums")
        );
        assert_eq!(decision.flagged_agents, vec!["media", "insight"]);
    }

    #[test]
    fn garbage_reply_approves() {
        let decision = parse_decision("I think it is fine.", ReviewStage::Research);
        assert_eq!(decision, ReviewDecision::approve());
        let decision = parse_decision("DECISION: REVISE", ReviewStage::Research);
        assert!(decision.is_approve());
    }

    #[test]
    fn research_summary_prefers_paragraphs() {
        let long = "x".repeat(300);
        let research = json!({
            "paragraphs": [
                {"title": "Market", "latest_summary": long},
                {"title": "Policy", "summary": "subsidies"},
                {"title": "", "summary": "untitled"},
                {"title": "Ignored", "summary": "fourth"}
            ],
            "result": "unused"
        });
        let summary = summarize_research(Some(&research));
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("[Market] {}...", "x".repeat(200)));
        assert_eq!(lines[1], "[Policy] subsidies...");
    }

    #[test]
    fn research_summary_falls_back_to_result_text() {
        let result = "y".repeat(600);
        let summary = summarize_research(Some(&json!({ "result": result })));
        assert_eq!(summary.chars().count(), 503);
        assert!(summary.ends_with("..."));
        assert_eq!(summarize_research(None), "(no research results)");
        assert_eq!(summarize_research(Some(&json!({}))), "(no research results)");
    }

    #[test]
    fn prompt_lists_every_agent() {
        let request = ReviewRequest {
            task_id: "t".into(),
            query: "EV market".into(),
            stage: ReviewStage::Plan,
            submissions: vec![
                AgentSubmission {
                    agent_id: "query".into(),
                    output: Some(json!({"keywords": ["ev"]})),
                },
                AgentSubmission {
                    agent_id: "media".into(),
                    output: None,
                },
            ],
        };
        let prompt = render_review_prompt(&request);
        assert!(prompt.contains("plans of 2 agents"));
        assert!(prompt.contains("**query**:\nKeywords: ev"));
        assert!(prompt.contains("**media**:\n(no plan)"));
        assert!(prompt.contains("DECISION: [APPROVE/REVISE]"));
        assert!(prompt.contains("from: query, media"));
    }

    #[test]
    fn settings_follow_fallback_chain() {
        let env: HashMap<&str, &str> = [
            ("REPORT_ENGINE_API_KEY", "report-key"),
            ("OPENAI_API_KEY", "openai-key"),
            ("REPORT_ENGINE_BASE_URL", "https://dashscope.example/v1"),
            ("DEEPSEEK_API_KEY", "ds-key"),
        ]
        .into_iter()
        .collect();
        let settings =
            ReviewerSettings::from_lookup(|name| env.get(name).map(|value| value.to_string()));
        let primary = settings.primary.unwrap();
        assert_eq!(primary.api_key, "report-key");
        assert_eq!(primary.base_url.as_deref(), Some("https://dashscope.example/v1"));
        assert_eq!(primary.model, "qwen3-max");
        let fallback = settings.content_policy_fallback.unwrap();
        assert_eq!(fallback.base_url.as_deref(), Some("https://api.deepseek.com"));
        assert_eq!(fallback.model, "deepseek-chat");

        assert_eq!(ReviewerSettings::from_lookup(|_| None), ReviewerSettings::default());
    }
}
