#![forbid(unsafe_code)]

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use tokio::io::AsyncReadExt as _;

use crate::config::{Paths, Settings};
use crate::core::toolconf::{extract_server_names, ToolConfigManager};
use crate::error::NightshiftError;
use crate::task::model::Plan;

pub const DEFAULT_PLAN_TIMEOUT: Duration = Duration::from_secs(120);

const PLAN_SCHEMA: &str = r#"{
  "type": "object",
  "properties": {
    "enhanced_prompt": {"type": "string"},
    "allowed_tools": {"type": "array", "items": {"type": "string"}},
    "allowed_directories": {"type": "array", "items": {"type": "string"}},
    "needs_git": {"type": "boolean"},
    "system_prompt": {"type": "string"},
    "estimated_tokens": {"type": "integer"},
    "estimated_time": {"type": "integer"}
  },
  "required": ["enhanced_prompt", "allowed_tools", "allowed_directories", "needs_git", "system_prompt"]
}"#;

/// Invokes the agent binary in single-shot structured-output mode to turn a
/// task description into an execution plan, and to revise plans on feedback.
#[derive(Debug, Clone)]
pub struct Planner {
    agent_bin: String,
    paths: Paths,
    registry: ToolConfigManager,
    tools_reference: String,
    directory_map: String,
}

impl Planner {
    pub fn new(settings: &Settings, paths: &Paths, registry: ToolConfigManager) -> Self {
        let tools_reference =
            std::fs::read_to_string(paths.tools_reference_path()).unwrap_or_default();
        let directory_map =
            std::fs::read_to_string(paths.directory_map_path()).unwrap_or_default();
        Self {
            agent_bin: settings.agent_bin.clone(),
            paths: paths.clone(),
            registry,
            tools_reference,
            directory_map,
        }
    }

    pub async fn plan(&self, description: &str, timeout: Duration) -> anyhow::Result<Plan> {
        let prompt = self.planning_prompt(description);
        self.invoke(prompt, timeout).await
    }

    pub async fn revise(
        &self,
        current: &Plan,
        feedback: &str,
        timeout: Duration,
    ) -> anyhow::Result<Plan> {
        let prompt = self.revision_prompt(current, feedback);
        self.invoke(prompt, timeout).await
    }

    async fn invoke(&self, prompt: String, timeout: Duration) -> anyhow::Result<Plan> {
        // The planner itself needs no tool servers; an empty config keeps
        // its context small.
        let tool_config = self.registry.write_empty()?;

        let mut cmd = tokio::process::Command::new(&self.agent_bin);
        cmd.arg("-p")
            .arg(&prompt)
            .args(["--output-format", "json"])
            .args(["--json-schema", PLAN_SCHEMA])
            .arg("--tool-config")
            .arg(tool_config.path());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        super::prepare_agent_env(&mut cmd, &self.paths);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", self.agent_bin))?;

        let mut stdout_pipe = child.stdout.take().context("planner stdout missing")?;
        let mut stderr_pipe = child.stderr.take().context("planner stderr missing")?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout_pipe.read_to_string(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf).await;
            buf
        });

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(res) => res?,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(NightshiftError::PlannerTimeout(timeout.as_secs()).into());
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(NightshiftError::InvalidPlan(format!(
                "planning command exited with {}: {}",
                status.code().unwrap_or(-1),
                truncate(&stderr, 500)
            ))
            .into());
        }

        let plan = parse_plan_payload(&stdout)?;
        self.validate(&plan)?;
        Ok(plan)
    }

    /// Reject plans naming a tool server the registry has never heard of.
    fn validate(&self, plan: &Plan) -> Result<(), NightshiftError> {
        for server in extract_server_names(&plan.allowed_tools) {
            if !self.registry.knows(&server) {
                return Err(NightshiftError::UnknownTool(server));
            }
        }
        Ok(())
    }

    fn planning_prompt(&self, description: &str) -> String {
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        format!(
            "You are the planning agent for an automated research task runner.\n\
             Analyze the user's task and produce an execution plan.\n\n\
             USER TASK:\n{description}\n\n\
             CURRENT WORKING DIRECTORY:\n{cwd}\n\n\
             AVAILABLE TOOLS:\n{tools}\n\n\
             {dirmap}\
             Respond with ONLY a JSON object with the fields: enhanced_prompt, \
             allowed_tools, allowed_directories, needs_git, system_prompt, \
             estimated_tokens, estimated_time.\n\n\
             Guidelines:\n\
             - External tool identifiers are qualified as ext__<server>__<operation>.\n\
             - The executor runs in a sandbox that blocks all filesystem writes \
             outside allowed_directories; grant the minimum directories needed, \
             as absolute paths. Never grant / or the home directory.\n\
             - An empty allowed_directories list means the task is read-only.\n\
             - Set needs_git to true when the task performs git or GitHub-CLI \
             operations.\n\
             - The system_prompt must instruct the executor to write outputs \
             into the allowed directories, not the temp dir.\n",
            tools = self.tools_reference,
            dirmap = self.directory_map_section(),
        )
    }

    fn revision_prompt(&self, current: &Plan, feedback: &str) -> String {
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        format!(
            "You are the planning agent for an automated research task runner.\n\
             A user reviewed the plan below and requested changes; produce a \
             revised plan.\n\n\
             CURRENT PLAN:\n\
             Enhanced prompt: {prompt}\n\
             Allowed tools: {tools}\n\
             Allowed directories: {dirs}\n\
             Needs git: {git}\n\
             System prompt: {system}\n\n\
             USER FEEDBACK:\n{feedback}\n\n\
             CURRENT WORKING DIRECTORY:\n{cwd}\n\n\
             AVAILABLE TOOLS:\n{reference}\n\n\
             {dirmap}\
             Respond with ONLY a JSON object with the fields: enhanced_prompt, \
             allowed_tools, allowed_directories, needs_git, system_prompt, \
             estimated_tokens, estimated_time. Address the feedback while \
             keeping the original objective.\n",
            prompt = current.enhanced_prompt,
            tools = current.allowed_tools.join(", "),
            dirs = current.allowed_directories.join(", "),
            git = current.needs_git,
            system = current.system_prompt,
            reference = self.tools_reference,
            dirmap = self.directory_map_section(),
        )
    }

    fn directory_map_section(&self) -> String {
        if self.directory_map.is_empty() {
            return String::new();
        }
        format!(
            "DIRECTORY STRUCTURE MAP (use it to resolve write locations):\n{}\n\n",
            self.directory_map
        )
    }
}

/// Decode the planner response. Three shapes, tried in order:
/// 1. wrapper with a `structured_output` object;
/// 2. wrapper with a `result` JSON string, possibly fenced;
/// 3. the raw stdout as the plan object itself.
pub fn parse_plan_payload(raw: &str) -> Result<Plan, NightshiftError> {
    let value: serde_json::Value = serde_json::from_str(raw.trim())
        .map_err(|e| NightshiftError::InvalidPlan(format!("response was not JSON: {e}")))?;

    let payload = if let Some(inner) = value.get("structured_output") {
        inner.clone()
    } else if let Some(result) = value.get("result").and_then(|v| v.as_str()) {
        let inner = strip_code_fences(result);
        serde_json::from_str(inner.trim())
            .map_err(|e| NightshiftError::InvalidPlan(format!("result field was not JSON: {e}")))?
    } else {
        value
    };

    serde_json::from_value(payload)
        .map_err(|e| NightshiftError::InvalidPlan(format!("missing or invalid field: {e}")))
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence line (``` or ```json), then everything past the
    // closing fence.
    let body = match rest.split_once('\n') {
        Some((_lang, body)) => body,
        None => rest,
    };
    match body.rfind("```") {
        Some(end) => &body[..end],
        None => body,
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
