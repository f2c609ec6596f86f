//! Final report synthesis.
//!
//! Report rendering lives outside this crate. The orchestrator hands every
//! available agent report, the full forum log and its summary to a
//! [`ReportSynthesizer`], then normalises whatever comes back into a report
//! document with [`finalize_report_document`]:
//!
//! ```json
//! {
//!   "metadata": { "query": "...", "title": "...", "generatedAt": "...", "phased": true, "hasForumLog": true },
//!   "summary": { "highlights": ["Generated from the research of 3 agents"] },
//!   "content": "...",
//!   "forum_log": "...",
//!   "sources": [ { "engine": "query", "count": 1 }, { "engine": "media", "count": 0 } ]
//! }
//! ```

use crate::forum::ForumLogEntry;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::error::Error;
use std::fmt;

/// One agent's final report.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReport {
    pub agent_id: String,
    pub report: Value,
}

impl AgentReport {
    /// The report as text; non-string reports are rendered as JSON.
    pub fn text(&self) -> String {
        match &self.report {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Everything a synthesizer gets to work with.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub task_id: String,
    pub query: String,
    /// Every agent in the task's roster, in roster order.
    pub roster: Vec<String>,
    /// Reports of the agents that produced one.
    pub reports: Vec<AgentReport>,
    pub forum_log: Vec<ForumLogEntry>,
    /// `forum_log` rendered as text.
    pub forum_log_text: String,
    /// Condensed forum log.
    pub forum_summary: String,
    /// `false` for standard-mode tasks, which have no reviews.
    pub phased: bool,
}

impl SynthesisRequest {
    /// Roster agents with no report.
    pub fn missing_agents(&self) -> Vec<String> {
        self.roster
            .iter()
            .filter(|agent| !self.reports.iter().any(|report| &report.agent_id == *agent))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisError {
    /// No agent produced a report.
    NoReports { failed_agents: Vec<String> },
    /// The synthesizer itself failed.
    Failed(String),
}

impl fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthesisError::NoReports { failed_agents } if failed_agents.is_empty() => {
                write!(f, "no agent reports available")
            }
            SynthesisError::NoReports { failed_agents } => write!(
                f,
                "no agent reports available, failed agents: {}",
                failed_agents.join(", ")
            ),
            SynthesisError::Failed(msg) => write!(f, "report synthesis failed: {}", msg),
        }
    }
}

impl Error for SynthesisError {}

/// Turns agent reports into one final report.
///
/// Return either a rendered document (a JSON string) or an already structured
/// report object.
#[async_trait]
pub trait ReportSynthesizer: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Value, SynthesisError>;
}

/// Stitches agent reports together as Markdown sections, followed by the
/// orchestration highlights from the forum log.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeSynthesizer;

#[async_trait]
impl ReportSynthesizer for MergeSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Value, SynthesisError> {
        let mut document = format!("# {}\n", report_title(&request.query));
        for report in &request.reports {
            document.push_str(&format!("\n## {}\n\n{}\n", report.agent_id, report.text().trim()));
        }
        if !request.forum_summary.is_empty() {
            document.push_str(&format!(
                "\n## Orchestration notes\n\n{}\n",
                request.forum_summary
            ));
        }
        Ok(Value::String(document))
    }
}

fn report_title(query: &str) -> String {
    format!("{} analysis report", query)
}

/// Normalise a synthesizer result into a report document.
///
/// A string result becomes the `content` of a new document. An object result
/// keeps its fields and gains `forum_log`, `metadata.phased`,
/// `metadata.hasForumLog` and, when missing, `sources`.
pub fn finalize_report_document(request: &SynthesisRequest, raw: Value) -> Value {
    let forum_log = if request.forum_log_text.is_empty() {
        Value::Null
    } else {
        Value::String(request.forum_log_text.clone())
    };
    let has_forum_log = !forum_log.is_null();
    let sources: Vec<Value> = request
        .roster
        .iter()
        .map(|agent| {
            let count = request
                .reports
                .iter()
                .filter(|report| &report.agent_id == agent)
                .count();
            json!({ "engine": agent, "count": count })
        })
        .collect();

    match raw {
        Value::Object(mut document) => {
            document.insert("forum_log".to_string(), forum_log);
            let metadata = document
                .entry("metadata")
                .or_insert_with(|| Value::Object(Map::new()));
            if !metadata.is_object() {
                *metadata = Value::Object(Map::new());
            }
            if let Some(metadata) = metadata.as_object_mut() {
                metadata.insert("phased".to_string(), Value::Bool(request.phased));
                metadata.insert("hasForumLog".to_string(), Value::Bool(has_forum_log));
            }
            document
                .entry("sources")
                .or_insert_with(|| Value::Array(sources));
            Value::Object(document)
        }
        other => {
            let content = match other {
                Value::String(text) => text,
                value => value.to_string(),
            };
            json!({
                "metadata": {
                    "query": request.query,
                    "title": report_title(&request.query),
                    "generatedAt": Utc::now().to_rfc3339(),
                    "phased": request.phased,
                    "hasForumLog": has_forum_log,
                },
                "summary": {
                    "highlights": [format!(
                        "Generated from the research of {} agent(s)",
                        request.reports.len()
                    )],
                },
                "content": content,
                "forum_log": forum_log,
                "sources": sources,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(forum_log_text: &str) -> SynthesisRequest {
        SynthesisRequest {
            task_id: "t".into(),
            query: "EV market".into(),
            roster: vec!["query".into(), "media".into()],
            reports: vec![AgentReport {
                agent_id: "query".into(),
                report: json!("# Query findings"),
            }],
            forum_log: Vec::new(),
            forum_log_text: forum_log_text.into(),
            forum_summary: String::new(),
            phased: true,
        }
    }

    #[test]
    fn string_result_is_wrapped() {
        let doc = finalize_report_document(&request("log"), json!("<html/>"));
        assert_eq!(doc["content"], "<html/>");
        assert_eq!(doc["metadata"]["title"], "EV market analysis report");
        assert_eq!(doc["metadata"]["phased"], true);
        assert_eq!(doc["metadata"]["hasForumLog"], true);
        assert_eq!(doc["forum_log"], "log");
        assert_eq!(doc["sources"][0], json!({"engine": "query", "count": 1}));
        assert_eq!(doc["sources"][1], json!({"engine": "media", "count": 0}));
    }

    #[test]
    fn object_result_keeps_its_fields() {
        let raw = json!({"chapters": [1, 2], "metadata": {"title": "Custom"}});
        let doc = finalize_report_document(&request(""), raw);
        assert_eq!(doc["chapters"], json!([1, 2]));
        assert_eq!(doc["metadata"]["title"], "Custom");
        assert_eq!(doc["metadata"]["hasForumLog"], false);
        assert!(doc["forum_log"].is_null());
        assert!(doc["sources"].is_array());
    }

    #[test]
    fn missing_agents_are_reported() {
        assert_eq!(request("").missing_agents(), vec!["media"]);
        let err = SynthesisError::NoReports {
            failed_agents: vec!["media".into()],
        };
        assert_eq!(err.to_string(), "no agent reports available, failed agents: media");
    }
}
