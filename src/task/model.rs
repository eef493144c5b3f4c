#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 900;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Staged,
    Committed,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Committed => "committed",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "staged" => Self::Staged,
            "committed" => Self::Committed,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    /// Legal edges of the lifecycle graph.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Staged, Self::Committed)
                | (Self::Staged, Self::Cancelled)
                | (Self::Committed, Self::Running)
                | (Self::Committed, Self::Cancelled)
                | (Self::Running, Self::Paused)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
                | (Self::Paused, Self::Running)
                | (Self::Paused, Self::Cancelled)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub allowed_directories: Vec<String>,
    #[serde(default)]
    pub needs_git: bool,
    pub system_prompt: Option<String>,
    pub estimated_tokens: Option<u64>,
    pub estimated_time: Option<u64>,
    pub timeout_seconds: u64,
    pub process_id: Option<u32>,
    pub result_path: Option<String>,
    pub token_usage: Option<u64>,
    pub execution_time: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl Task {
    /// New identifier: `task_` followed by exactly eight lowercase hex chars.
    #[must_use]
    pub fn new_id() -> String {
        let id = Uuid::new_v4().simple().to_string();
        let short: String = id.chars().take(8).collect();
        format!("task_{short}")
    }
}

/// Structured execution plan produced by the planner adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub enhanced_prompt: String,
    pub allowed_tools: Vec<String>,
    pub allowed_directories: Vec<String>,
    pub needs_git: bool,
    pub system_prompt: String,
    #[serde(default)]
    pub estimated_tokens: Option<u64>,
    #[serde(default)]
    pub estimated_time: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub task_id: String,
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

#[must_use]
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_grammar() {
        for _ in 0..32 {
            let id = Task::new_id();
            let hex = id.strip_prefix("task_").expect("prefix");
            assert_eq!(hex.len(), 8);
            assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn status_strings_are_lowercase_wire_values() {
        for (status, s) in [
            (TaskStatus::Staged, "staged"),
            (TaskStatus::Committed, "committed"),
            (TaskStatus::Running, "running"),
            (TaskStatus::Paused, "paused"),
            (TaskStatus::Completed, "completed"),
            (TaskStatus::Failed, "failed"),
            (TaskStatus::Cancelled, "cancelled"),
        ] {
            assert_eq!(status.as_str(), s);
            assert_eq!(TaskStatus::parse(s), Some(status));
            assert_eq!(serde_json::to_string(&status).unwrap(), format!("\"{s}\""));
        }
        assert_eq!(TaskStatus::parse("STAGED"), None);
    }

    #[test]
    fn transition_graph_edges() {
        use TaskStatus::*;
        let legal = [
            (Staged, Committed),
            (Staged, Cancelled),
            (Committed, Running),
            (Committed, Cancelled),
            (Running, Paused),
            (Running, Completed),
            (Running, Failed),
            (Running, Cancelled),
            (Paused, Running),
            (Paused, Cancelled),
        ];
        let all = [Staged, Committed, Running, Paused, Completed, Failed, Cancelled];
        for from in all {
            for to in all {
                let expect = legal.contains(&(from, to));
                assert_eq!(from.can_transition_to(to), expect, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }
}
