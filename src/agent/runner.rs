#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use serde::Serialize;
use tokio::io::AsyncBufReadExt as _;
use tokio::sync::mpsc;

use crate::agent::process::{signal_pid, Control, ProcessMap, Sig};
use crate::config::{Paths, Settings};
use crate::core::sandbox::SandboxManager;
use crate::core::toolconf::ToolConfigManager;
use crate::core::tracker::{save_changes, FileChange, FileTracker};
use crate::error::NightshiftError;
use crate::task::model::{Task, TaskStatus};
use crate::task::store::{StatusFields, TaskStore};

const STDERR_TRUNCATE: usize = 1000;

/// Terminal result of one agent-binary run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: TaskStatus,
    pub success: bool,
    pub token_usage: Option<u64>,
    pub execution_time: f64,
    pub result_path: PathBuf,
    pub error_message: Option<String>,
    pub file_changes: Vec<FileChange>,
    pub response_text: String,
}

/// Accumulated stream-JSON parse state for one run.
#[derive(Debug, Default)]
struct ParsedStream {
    text: String,
    token_usage: Option<u64>,
    tool_calls: u64,
}

impl ParsedStream {
    /// Feed one stdout line. JSON objects contribute text deltas, tool-use
    /// events and the cumulative usage counter; anything else is plain text.
    fn feed(&mut self, line: &str) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            self.text.push_str(line);
            self.text.push('\n');
            return;
        };
        match value.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(t) = value.get("text").and_then(|t| t.as_str()) {
                    self.text.push_str(t);
                }
            }
            Some("tool_use") => self.tool_calls += 1,
            _ => {}
        }
        if let Some(usage) = value.get("usage") {
            let sum: u64 = ["output_tokens", "input_tokens", "cache_creation_input_tokens", "cache_read_input_tokens"]
                .iter()
                .filter_map(|k| usage.get(*k).and_then(|v| v.as_u64()))
                .sum();
            self.token_usage = Some(sum);
        }
    }
}

#[derive(Debug, Serialize)]
struct OutputArtifact<'a> {
    task_id: &'a str,
    stdout: &'a str,
    stderr: &'a str,
    return_code: i32,
    execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_usage: Option<u64>,
}

/// Runs one sandboxed agent-binary subprocess per task: spawn, publish the
/// PID, stream-parse stdout, honor pause/resume/kill and the task timeout,
/// then persist artifacts and commit the terminal status.
#[derive(Debug, Clone)]
pub struct AgentRunner {
    store: TaskStore,
    paths: Paths,
    settings: Settings,
    sandbox: SandboxManager,
    toolconf: ToolConfigManager,
    processes: ProcessMap,
    work_dir: PathBuf,
}

impl AgentRunner {
    pub fn new(
        store: TaskStore,
        paths: Paths,
        settings: Settings,
        toolconf: ToolConfigManager,
        processes: ProcessMap,
        work_dir: PathBuf,
    ) -> Self {
        let sandbox = SandboxManager::new(settings.enable_sandbox);
        Self {
            store,
            paths,
            settings,
            sandbox,
            toolconf,
            processes,
            work_dir,
        }
    }

    /// Execute a claimed (already RUNNING) task to a terminal state. All
    /// subprocess-level failures become terminal task states; only a launch
    /// failure before PID publication propagates as an error.
    pub async fn execute(&self, task: &Task) -> anyhow::Result<RunOutcome> {
        let timeout = Duration::from_secs(task.timeout_seconds);
        let started = Instant::now();
        let result_path = self.paths.output_artifact(&task.task_id);

        let profile = match self.sandbox.generate(&task.allowed_directories, task.needs_git) {
            Ok(p) => p,
            Err(e) => return Ok(self.fail_before_spawn(task, started, &result_path, e)),
        };
        let tool_config = match self.toolconf.write_minimal(&task.allowed_tools) {
            Ok(f) => f,
            Err(e) => return Ok(self.fail_before_spawn(task, started, &result_path, e)),
        };
        let tracker = match FileTracker::start(&self.work_dir)
            .with_context(|| format!("failed to snapshot {}", self.work_dir.display()))
        {
            Ok(t) => t,
            Err(e) => return Ok(self.fail_before_spawn(task, started, &result_path, e)),
        };

        let mut args = vec![
            "-p".to_owned(),
            task.description.clone(),
            "--output-format".to_owned(),
            "stream-json".to_owned(),
            "--verbose".to_owned(),
            "--tool-config".to_owned(),
            tool_config.path().to_string_lossy().to_string(),
        ];
        if !task.allowed_tools.is_empty() {
            args.push("--allowed-tools".to_owned());
            args.push(task.allowed_tools.join(" "));
        }
        if let Some(system_prompt) = task.system_prompt.as_deref() {
            if !system_prompt.is_empty() {
                args.push("--system-prompt".to_owned());
                args.push(system_prompt.to_owned());
            }
        }
        let (program, args) = self
            .sandbox
            .wrap(profile.as_ref(), &self.settings.agent_bin, &args);

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args);
        cmd.current_dir(&self.work_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        super::prepare_agent_env(&mut cmd, &self.paths);
        if task.needs_git {
            if let Some(token) = github_token().await {
                cmd.env("GH_TOKEN", token);
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = NightshiftError::LaunchFailed(format!("{program}: {e}"));
                self.mark_failed(task, started, &result_path, &err.to_string());
                return Err(err.into());
            }
        };
        let Some(pid) = child.id() else {
            let _ = child.start_kill();
            let err = NightshiftError::LaunchFailed("child exited before PID read".to_owned());
            self.mark_failed(task, started, &result_path, &err.to_string());
            return Err(err.into());
        };

        // PID publication precedes any pause/resume/kill possibility.
        if let Err(e) = self.store.record_process(&task.task_id, pid, &result_path) {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let err = NightshiftError::LaunchFailed(format!("could not record PID: {e}"));
            self.mark_failed(task, started, &result_path, &err.to_string());
            return Err(err.into());
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _registration = self.processes.register(&task.task_id, pid, tx);
        self.store
            .append_log(&task.task_id, "INFO", &format!("agent subprocess started (pid {pid})"));

        let stdout_task = child.stdout.take().map(|out| {
            tokio::spawn(async move {
                let mut raw = String::new();
                let mut parsed = ParsedStream::default();
                let mut lines = tokio::io::BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    raw.push_str(&line);
                    raw.push('\n');
                    if !line.trim().is_empty() {
                        parsed.feed(&line);
                    }
                }
                (raw, parsed)
            })
        });
        let stderr_task = child.stderr.take().map(|err| {
            tokio::spawn(async move {
                let mut raw = String::new();
                let mut lines = tokio::io::BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    raw.push_str(&line);
                    raw.push('\n');
                }
                raw
            })
        });

        let mut killed = false;
        let mut timed_out = false;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let exit = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.context("failed to wait for agent subprocess")?;
                }
                Some(control) = rx.recv() => match control {
                    Control::Pause => {
                        if signal_pid(pid, Sig::Stop) {
                            let _ = self.store.update_status(
                                &task.task_id, TaskStatus::Paused, StatusFields::default());
                            self.store.append_log(&task.task_id, "INFO", "paused");
                        }
                    }
                    Control::Resume => {
                        if signal_pid(pid, Sig::Cont) {
                            let _ = self.store.update_status(
                                &task.task_id, TaskStatus::Running, StatusFields::default());
                            self.store.append_log(&task.task_id, "INFO", "resumed");
                        }
                    }
                    Control::Kill => {
                        killed = true;
                        let _ = signal_pid(pid, Sig::Cont);
                        let _ = signal_pid(pid, Sig::Kill);
                    }
                },
                () = &mut deadline, if !timed_out && !killed => {
                    timed_out = true;
                    let _ = signal_pid(pid, Sig::Cont);
                    let _ = signal_pid(pid, Sig::Kill);
                }
            }
        };

        let (stdout, parsed) = match stdout_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => (String::new(), ParsedStream::default()),
        };
        let stderr = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let execution_time = started.elapsed().as_secs_f64();
        let return_code = exit.code().unwrap_or(-1);

        // Artifacts and temp-file cleanup precede the terminal commit.
        self.write_output_artifact(
            &task.task_id,
            &result_path,
            &stdout,
            &stderr,
            return_code,
            execution_time,
            parsed.token_usage,
        );
        let file_changes = tracker.stop().unwrap_or_default();
        if let Err(e) = save_changes(
            &self.paths.files_artifact(&task.task_id),
            &task.task_id,
            &file_changes,
        ) {
            tracing::warn!("failed to write file-change artifact: {e}");
        }
        drop(tool_config);
        drop(profile);

        let (status, error_message) = if killed {
            (TaskStatus::Cancelled, Some("Task killed by user".to_owned()))
        } else if timed_out {
            (
                TaskStatus::Failed,
                Some(NightshiftError::TimeoutExceeded(task.timeout_seconds).to_string()),
            )
        } else if exit.success() {
            (TaskStatus::Completed, None)
        } else {
            let detail = if stderr.trim().is_empty() {
                format!("exit code {return_code}")
            } else {
                truncate(stderr.trim(), STDERR_TRUNCATE)
            };
            (
                TaskStatus::Failed,
                Some(NightshiftError::AgentFailure(detail).to_string()),
            )
        };

        self.commit_terminal(
            task,
            status,
            StatusFields {
                result_path: Some(result_path.to_string_lossy().to_string()),
                token_usage: parsed.token_usage,
                execution_time: Some(execution_time),
                error_message: error_message.clone(),
                ..StatusFields::default()
            },
        );
        // Another process may have committed a different terminal state
        // (e.g. a cross-process kill) before we got here; the store wins.
        let status = match self.store.get(&task.task_id) {
            Ok(Some(t)) if t.status.is_terminal() => t.status,
            _ => status,
        };
        if parsed.tool_calls > 0 {
            self.store.append_log(
                &task.task_id,
                "INFO",
                &format!("agent made {} tool calls", parsed.tool_calls),
            );
        }
        match &error_message {
            Some(msg) => self.store.append_log(&task.task_id, "ERROR", msg),
            None => self.store.append_log(
                &task.task_id,
                "INFO",
                &format!("completed in {execution_time:.1}s"),
            ),
        }

        Ok(RunOutcome {
            status,
            success: status == TaskStatus::Completed,
            token_usage: parsed.token_usage,
            execution_time,
            result_path,
            error_message,
            file_changes,
            response_text: parsed.text,
        })
    }

    /// Commit a terminal status, routing through RUNNING when the task was
    /// left PAUSED so the observed sequence stays inside the graph. A task
    /// already terminal (killed from another process) is left untouched.
    fn commit_terminal(&self, task: &Task, status: TaskStatus, fields: StatusFields) {
        let current = match self.store.get(&task.task_id) {
            Ok(Some(t)) => t.status,
            _ => return,
        };
        if current.is_terminal() {
            return;
        }
        if current == TaskStatus::Paused && status != TaskStatus::Cancelled {
            let _ = self
                .store
                .update_status(&task.task_id, TaskStatus::Running, StatusFields::default());
        }
        if let Err(e) = self.store.update_status(&task.task_id, status, fields) {
            tracing::error!("failed to commit terminal status for {}: {e}", task.task_id);
        }
    }

    fn fail_before_spawn(
        &self,
        task: &Task,
        started: Instant,
        result_path: &Path,
        error: anyhow::Error,
    ) -> RunOutcome {
        let message = error.to_string();
        self.mark_failed(task, started, result_path, &message);
        RunOutcome {
            status: TaskStatus::Failed,
            success: false,
            token_usage: None,
            execution_time: started.elapsed().as_secs_f64(),
            result_path: result_path.to_path_buf(),
            error_message: Some(message),
            file_changes: Vec::new(),
            response_text: String::new(),
        }
    }

    fn mark_failed(&self, task: &Task, started: Instant, result_path: &Path, message: &str) {
        self.write_output_artifact(
            &task.task_id,
            result_path,
            "",
            message,
            -1,
            started.elapsed().as_secs_f64(),
            None,
        );
        self.commit_terminal(
            task,
            TaskStatus::Failed,
            StatusFields {
                error_message: Some(message.to_owned()),
                execution_time: Some(started.elapsed().as_secs_f64()),
                result_path: Some(result_path.to_string_lossy().to_string()),
                ..StatusFields::default()
            },
        );
        self.store.append_log(&task.task_id, "ERROR", message);
    }

    #[allow(clippy::too_many_arguments)]
    fn write_output_artifact(
        &self,
        task_id: &str,
        path: &Path,
        stdout: &str,
        stderr: &str,
        return_code: i32,
        execution_time: f64,
        token_usage: Option<u64>,
    ) {
        let artifact = OutputArtifact {
            task_id,
            stdout,
            stderr,
            return_code,
            execution_time,
            token_usage,
        };
        let write = serde_json::to_vec_pretty(&artifact)
            .map_err(anyhow::Error::from)
            .and_then(|data| std::fs::write(path, data).map_err(Into::into));
        if let Err(e) = write {
            tracing::warn!("failed to write output artifact {}: {e}", path.display());
        }
    }
}

/// One-shot `gh auth token` lookup for sandboxed git/GitHub work.
async fn github_token() -> Option<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new("gh")
            .args(["auth", "token"])
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_owned()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_parser_extracts_text_usage_and_tools() {
        let mut parsed = ParsedStream::default();
        parsed.feed(r#"{"type":"text","text":"Twilight falls softly"}"#);
        parsed.feed(r#"{"type":"tool_use","name":"Write","input":{}}"#);
        parsed.feed(r#"{"type":"text","text":" over the hills"}"#);
        parsed.feed(
            r#"{"type":"result","usage":{"output_tokens":400,"input_tokens":50,"cache_read_input_tokens":15}}"#,
        );
        assert_eq!(parsed.text, "Twilight falls softly over the hills");
        assert_eq!(parsed.token_usage, Some(465));
        assert_eq!(parsed.tool_calls, 1);
    }

    #[test]
    fn stream_parser_keeps_non_json_lines_as_text() {
        let mut parsed = ParsedStream::default();
        parsed.feed("plain progress line");
        assert_eq!(parsed.text, "plain progress line\n");
        assert!(parsed.token_usage.is_none());
    }

    #[test]
    fn later_usage_events_replace_earlier_ones() {
        let mut parsed = ParsedStream::default();
        parsed.feed(r#"{"usage":{"output_tokens":10}}"#);
        parsed.feed(r#"{"usage":{"output_tokens":100,"input_tokens":20}}"#);
        assert_eq!(parsed.token_usage, Some(120));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        let long = "x".repeat(20);
        let cut = truncate(&long, 10);
        assert_eq!(cut.chars().count(), 11);
        assert!(cut.ends_with('…'));
    }
}
