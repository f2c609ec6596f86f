//! Forum log entries and their text renderings.
//!
//! The forum log is the append-only audit trail of a task: phase boundaries
//! announced by the system, milestones reported by agents, and every decision
//! the orchestrator takes (including the ones it takes because a reviewer
//! failed). It lives on the blackboard under `task:{id}:forum:log`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker used for phase boundaries and task lifecycle messages.
pub const SYSTEM_SPEAKER: &str = "system";

/// Speaker used for review decisions and guidance.
pub const ORCHESTRATOR_SPEAKER: &str = "orchestrator";

const IMPORTANT_KEYWORDS: &[&str] = &[
    "review",
    "decision",
    "guidance",
    "supplement",
    "approve",
    "revise",
    "adjust",
];

const SKIP_KEYWORDS: &[&str] = &["phase started", "starting phase", "initialis"];

const TRUNCATION_MARKER: &str = "\n...(forum log truncated)";

/// One line of the forum log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForumLogEntry {
    /// `system`, `orchestrator`, or an agent id.
    pub speaker: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ForumLogEntry {
    /// Create an entry stamped with the current time.
    ///
    /// ```
    /// use forumflow::forum::ForumLogEntry;
    ///
    /// let entry = ForumLogEntry::new("orchestrator", "Plan review: approve");
    /// assert_eq!(entry.speaker, "orchestrator");
    /// ```
    pub fn new(speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    fn is_important(&self) -> bool {
        if self.speaker == ORCHESTRATOR_SPEAKER {
            return true;
        }
        let content = self.content.to_lowercase();
        IMPORTANT_KEYWORDS.iter().any(|kw| content.contains(kw))
    }

    fn is_chatter(&self) -> bool {
        if self.speaker == ORCHESTRATOR_SPEAKER {
            return false;
        }
        let content = self.content.to_lowercase();
        SKIP_KEYWORDS.iter().any(|kw| content.contains(kw))
    }
}

/// Render the full log, one `[timestamp] speaker: content` line per entry.
pub fn format_forum_log(entries: &[ForumLogEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            format!(
                "[{}] {}: {}",
                entry.timestamp.to_rfc3339(),
                entry.speaker,
                entry.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Condense the log for the report synthesizer.
///
/// Orchestrator entries and entries mentioning reviews, guidance or
/// supplements are always kept, in order. Agent "phase started" chatter is
/// dropped. Remaining entries fill whatever room is left under `max_chars`,
/// and the result is hard-truncated if the important entries alone overflow.
///
/// ```
/// use forumflow::forum::{summarize_forum_log, ForumLogEntry};
///
/// let log = vec![
///     ForumLogEntry::new("query", "Plan phase started"),
///     ForumLogEntry::new("orchestrator", "Plan review: approve"),
///     ForumLogEntry::new("query", "Plan completed"),
/// ];
/// let summary = summarize_forum_log(&log, 2000);
/// assert_eq!(summary, "[orchestrator] Plan review: approve\n[query] Plan completed");
/// ```
pub fn summarize_forum_log(entries: &[ForumLogEntry], max_chars: usize) -> String {
    let mut important = Vec::new();
    let mut others = Vec::new();

    for entry in entries {
        if entry.is_chatter() {
            continue;
        }
        let line = format!("[{}] {}", entry.speaker, entry.content);
        if entry.is_important() {
            important.push(line);
        } else {
            others.push(line);
        }
    }

    let mut lines = important;
    let mut current_len: usize = lines.iter().map(|line| line.chars().count()).sum();
    for line in others {
        let line_len = line.chars().count();
        if current_len + line_len + 1 > max_chars {
            break;
        }
        current_len += line_len + 1;
        lines.push(line);
    }

    let summary = lines.join("\n");
    if summary.chars().count() <= max_chars {
        return summary;
    }

    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut truncated: String = summary.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}
