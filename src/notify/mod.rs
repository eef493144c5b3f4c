#![forbid(unsafe_code)]

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::agent::runner::RunOutcome;
use crate::config::Paths;
use crate::core::tracker::{ChangeKind, FileChange};
use crate::error::NightshiftError;
use crate::task::model::{now_rfc3339, Task};

const DESCRIPTION_LIMIT: usize = 500;
const RESPONSE_LIMIT: usize = 1000;
const ERROR_LIMIT: usize = 500;
const FILES_SHOWN_PER_KIND: usize = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChangeSummary {
    pub created: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl FileChangeSummary {
    #[must_use]
    pub fn from_changes(changes: &[FileChange]) -> Self {
        let mut summary = Self::default();
        for change in changes {
            let bucket = match change.kind {
                ChangeKind::Created => &mut summary.created,
                ChangeKind::Modified => &mut summary.modified,
                ChangeKind::Deleted => &mut summary.deleted,
            };
            bucket.push(change.path.clone());
        }
        summary
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Completion summary persisted per task and pushed to sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub task_id: String,
    pub description: String,
    pub status: String,
    pub timestamp: String,
    pub execution_time: f64,
    pub token_usage: Option<u64>,
    pub file_changes: FileChangeSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
}

/// Routing metadata dropped next to the task artifacts by an adapter before
/// submit; consumed (and removed) once the notification is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkRouting {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SinkConfig {
    webhook_url: String,
}

/// Composes summaries and fans them out: JSON artifact (mandatory),
/// terminal rendering (optional), external webhook sinks (best effort).
#[derive(Debug, Clone)]
pub struct Notifier {
    paths: Paths,
    terminal: bool,
    client: reqwest::Client,
}

impl Notifier {
    #[must_use]
    pub fn new(paths: Paths, terminal: bool) -> Self {
        Self {
            paths,
            terminal,
            client: reqwest::Client::new(),
        }
    }

    /// Persist the summary artifact, then push to enabled sinks. Only the
    /// persistence failure is an error; sink failures are logged and
    /// swallowed.
    pub async fn notify(&self, task: &Task, outcome: &RunOutcome) -> anyhow::Result<()> {
        let summary = build_summary(task, outcome);
        self.persist(&summary)?;

        if self.terminal {
            println!("{}", render_terminal(&summary));
        }
        self.push_to_sink(&summary).await;
        Ok(())
    }

    fn persist(&self, summary: &Summary) -> anyhow::Result<()> {
        let path = self.paths.notification_artifact(&summary.task_id);
        let data = serde_json::to_vec_pretty(summary)
            .map_err(|e| NightshiftError::Notifier(e.to_string()))?;
        std::fs::write(&path, data)
            .map_err(|e| NightshiftError::Notifier(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    async fn push_to_sink(&self, summary: &Summary) {
        let routing_path = self.paths.routing_metadata(&summary.task_id);
        let Some(routing) = read_routing(&routing_path) else {
            return;
        };
        let Some(config) = self.sink_config() else {
            tracing::warn!(
                "routing metadata exists for {} but no sink is configured",
                summary.task_id
            );
            return;
        };

        let body = serde_json::json!({
            "channel": routing.channel,
            "thread": routing.thread,
            "text": render_terminal(summary),
        });
        match self.client.post(&config.webhook_url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!("sink notified for {}", summary.task_id);
            }
            Ok(resp) => {
                tracing::warn!(
                    "sink returned {} for {}",
                    resp.status(),
                    summary.task_id
                );
            }
            Err(e) => tracing::warn!("sink post failed for {}: {e}", summary.task_id),
        }
        // Routing metadata is single-use.
        let _ = std::fs::remove_file(&routing_path);
    }

    fn sink_config(&self) -> Option<SinkConfig> {
        let raw = std::fs::read_to_string(self.paths.sink_config_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

#[must_use]
pub fn build_summary(task: &Task, outcome: &RunOutcome) -> Summary {
    let response_text = if outcome.response_text.trim().is_empty() {
        None
    } else {
        Some(truncate_marked(outcome.response_text.trim(), RESPONSE_LIMIT))
    };
    Summary {
        task_id: task.task_id.clone(),
        description: truncate(&task.description, DESCRIPTION_LIMIT),
        status: outcome.status.as_str().to_owned(),
        timestamp: now_rfc3339(),
        execution_time: outcome.execution_time,
        token_usage: outcome.token_usage,
        file_changes: FileChangeSummary::from_changes(&outcome.file_changes),
        error_message: outcome
            .error_message
            .as_deref()
            .map(|m| truncate(m, ERROR_LIMIT)),
        result_path: Some(outcome.result_path.to_string_lossy().to_string()),
        response_text,
    }
}

#[must_use]
pub fn render_terminal(summary: &Summary) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let marker = if summary.status == "completed" { "ok" } else { "failed" };
    let _ = writeln!(out, "task {} [{marker}]", summary.task_id);
    let _ = writeln!(out, "  {}", summary.description);
    let _ = writeln!(out, "  status: {}", summary.status);
    let _ = writeln!(out, "  time:   {:.1}s", summary.execution_time);
    if let Some(tokens) = summary.token_usage {
        let _ = writeln!(out, "  tokens: {tokens}");
    }

    for (label, files) in [
        ("created", &summary.file_changes.created),
        ("modified", &summary.file_changes.modified),
        ("deleted", &summary.file_changes.deleted),
    ] {
        if files.is_empty() {
            continue;
        }
        let _ = writeln!(out, "  {label} ({}):", files.len());
        for file in files.iter().take(FILES_SHOWN_PER_KIND) {
            let _ = writeln!(out, "    - {file}");
        }
        if files.len() > FILES_SHOWN_PER_KIND {
            let _ = writeln!(out, "    ... and {} more", files.len() - FILES_SHOWN_PER_KIND);
        }
    }

    if let Some(err) = &summary.error_message {
        let _ = writeln!(out, "  error:  {err}");
    }
    if let Some(text) = &summary.response_text {
        let _ = writeln!(out, "  response:\n    {}", text.replace('\n', "\n    "));
    }
    if let Some(path) = &summary.result_path {
        let _ = writeln!(out, "  output: {path}");
    }
    out
}

fn read_routing(path: &Path) -> Option<SinkRouting> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(routing) => Some(routing),
        Err(e) => {
            tracing::warn!("unreadable routing metadata {}: {e}", path.display());
            None
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_owned()
    } else {
        s.chars().take(max).collect()
    }
}

fn truncate_marked(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_owned()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}... [truncated]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::{TaskStatus, DEFAULT_TIMEOUT_SECONDS};
    use std::path::PathBuf;

    fn sample_task(description: &str) -> Task {
        let now = now_rfc3339();
        Task {
            task_id: "task_00ab12cd".to_owned(),
            description: description.to_owned(),
            status: TaskStatus::Completed,
            allowed_tools: Vec::new(),
            allowed_directories: Vec::new(),
            needs_git: false,
            system_prompt: None,
            estimated_tokens: None,
            estimated_time: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            process_id: None,
            result_path: None,
            token_usage: None,
            execution_time: None,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn sample_outcome() -> RunOutcome {
        RunOutcome {
            status: TaskStatus::Completed,
            success: true,
            token_usage: Some(465),
            execution_time: 12.5,
            result_path: PathBuf::from("/data/output/task_00ab12cd_output.json"),
            error_message: None,
            file_changes: vec![FileChange {
                path: "haiku.md".to_owned(),
                kind: ChangeKind::Created,
                before_hash: None,
                after_hash: Some("ab".to_owned()),
            }],
            response_text: "Twilight falls softly".to_owned(),
        }
    }

    #[test]
    fn description_truncated_to_limit() {
        let long = "d".repeat(800);
        let summary = build_summary(&sample_task(&long), &sample_outcome());
        assert_eq!(summary.description.chars().count(), DESCRIPTION_LIMIT);
    }

    #[test]
    fn response_text_truncated_with_marker() {
        let mut outcome = sample_outcome();
        outcome.response_text = "r".repeat(1500);
        let summary = build_summary(&sample_task("t"), &outcome);
        let text = summary.response_text.unwrap();
        assert!(text.ends_with("... [truncated]"));
        assert!(text.chars().count() < 1100);
    }

    #[test]
    fn summary_buckets_changes_by_kind() {
        let mut outcome = sample_outcome();
        outcome.file_changes.push(FileChange {
            path: "notes.md".to_owned(),
            kind: ChangeKind::Modified,
            before_hash: Some("a".to_owned()),
            after_hash: Some("b".to_owned()),
        });
        let summary = build_summary(&sample_task("t"), &outcome);
        assert_eq!(summary.file_changes.created, vec!["haiku.md"]);
        assert_eq!(summary.file_changes.modified, vec!["notes.md"]);
        assert!(summary.file_changes.deleted.is_empty());
    }

    #[test]
    fn rendering_caps_files_at_five_with_suffix() {
        let mut outcome = sample_outcome();
        outcome.file_changes = (0..8)
            .map(|i| FileChange {
                path: format!("file_{i}.txt"),
                kind: ChangeKind::Created,
                before_hash: None,
                after_hash: Some("h".to_owned()),
            })
            .collect();
        let summary = build_summary(&sample_task("t"), &outcome);
        let rendered = render_terminal(&summary);
        assert!(rendered.contains("created (8):"));
        assert!(rendered.contains("file_4.txt"));
        assert!(!rendered.contains("file_5.txt"));
        assert!(rendered.contains("... and 3 more"));
    }

    #[tokio::test]
    async fn notify_persists_summary_artifact() {
        let td = tempfile::tempdir().expect("tempdir");
        let paths = Paths::new(Some(td.path().to_path_buf())).unwrap();
        let notifier = Notifier::new(paths.clone(), false);

        let task = sample_task("write a haiku about dusk");
        let outcome = sample_outcome();
        notifier.notify(&task, &outcome).await.unwrap();

        let artifact = paths.notification_artifact(&task.task_id);
        assert!(artifact.exists());
        let summary: Summary =
            serde_json::from_slice(&std::fs::read(&artifact).unwrap()).unwrap();
        assert_eq!(summary.status, "completed");
        assert_eq!(summary.token_usage, Some(465));
        assert_eq!(summary.file_changes.created, vec!["haiku.md"]);
    }

    #[tokio::test]
    async fn failed_persist_surfaces_notifier_error() {
        let td = tempfile::tempdir().expect("tempdir");
        let paths = Paths::new(Some(td.path().to_path_buf())).unwrap();
        // Remove the notifications dir to force a write failure.
        std::fs::remove_dir_all(paths.notifications_dir()).unwrap();
        let notifier = Notifier::new(paths, false);

        let err = notifier
            .notify(&sample_task("t"), &sample_outcome())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NightshiftError>(),
            Some(NightshiftError::Notifier(_))
        ));
    }
}
