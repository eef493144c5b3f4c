#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use crate::agent::planner::{Planner, DEFAULT_PLAN_TIMEOUT};
use crate::agent::process::{pid_alive, signal_pid, Control, ProcessMap, Sig};
use crate::agent::runner::AgentRunner;
use crate::config::{Paths, Settings};
use crate::core::sandbox::SandboxManager;
use crate::core::toolconf::ToolConfigManager;
use crate::error::NightshiftError;
use crate::executor::ExecutorService;
use crate::notify::{Notifier, Summary};
use crate::task::model::{now_rfc3339, LogEntry, Plan, Task, TaskStatus, DEFAULT_TIMEOUT_SECONDS};
use crate::task::store::{StatusFields, TaskStore};

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TaskDetails {
    pub task: Task,
    pub logs: Vec<LogEntry>,
    pub summary: Option<Summary>,
}

/// The public operations surface. Front-ends (CLI, webhook adapters) speak
/// exactly these; everything long-running happens on executor workers.
#[derive(Clone)]
pub struct NightShift {
    pub paths: Paths,
    pub settings: Settings,
    pub store: TaskStore,
    pub planner: Planner,
    pub toolconf: ToolConfigManager,
    pub processes: ProcessMap,
}

impl NightShift {
    pub fn init(base_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let settings = Settings::from_env()?;
        Self::with_settings(base_dir, settings)
    }

    pub fn with_settings(base_dir: Option<PathBuf>, settings: Settings) -> anyhow::Result<Self> {
        let paths = Paths::new(base_dir)?;
        let store = TaskStore::open(&paths.db_path())?;
        let toolconf = ToolConfigManager::load(&paths.tool_registry_path())?;
        let planner = Planner::new(&settings, &paths, toolconf.clone());
        Ok(Self {
            paths,
            settings,
            store,
            planner,
            toolconf,
            processes: ProcessMap::new(),
        })
    }

    #[must_use]
    pub fn runner(&self, work_dir: PathBuf) -> AgentRunner {
        AgentRunner::new(
            self.store.clone(),
            self.paths.clone(),
            self.settings.clone(),
            self.toolconf.clone(),
            self.processes.clone(),
            work_dir,
        )
    }

    #[must_use]
    pub fn executor(&self, work_dir: PathBuf) -> ExecutorService {
        ExecutorService::new(
            self.store.clone(),
            self.runner(work_dir),
            Notifier::new(self.paths.clone(), self.settings.terminal_notifications),
            self.processes.clone(),
            self.paths.clone(),
        )
    }

    /// Create a STAGED task from a raw description.
    pub fn submit(&self, description: &str, opts: SubmitOptions) -> anyhow::Result<Task> {
        let now = now_rfc3339();
        let task = Task {
            task_id: Task::new_id(),
            description: description.to_owned(),
            status: TaskStatus::Staged,
            allowed_tools: Vec::new(),
            allowed_directories: Vec::new(),
            needs_git: false,
            system_prompt: None,
            estimated_tokens: None,
            estimated_time: None,
            timeout_seconds: opts.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            process_id: None,
            result_path: None,
            token_usage: None,
            execution_time: None,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.store.create(&task)?;
        self.store
            .append_log(&task.task_id, "INFO", "task created (staged)");
        Ok(task)
    }

    /// Run the planner (or re-run it with feedback) and store the resulting
    /// plan on the task. Only STAGED tasks can be (re)planned; on any
    /// planner failure the task is left unchanged.
    pub async fn plan(&self, task_id: &str, feedback: Option<&str>) -> anyhow::Result<Plan> {
        let task = self.require(task_id)?;
        if task.status != TaskStatus::Staged {
            return Err(NightshiftError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Staged,
            }
            .into());
        }

        let plan = match feedback {
            Some(feedback) => {
                let current = plan_from_task(&task);
                self.planner
                    .revise(&current, feedback, DEFAULT_PLAN_TIMEOUT)
                    .await?
            }
            None => {
                self.planner
                    .plan(&task.description, DEFAULT_PLAN_TIMEOUT)
                    .await?
            }
        };

        self.store.update_plan(task_id, &plan)?;
        self.store.append_log(
            task_id,
            "INFO",
            &format!("plan stored (tools: {})", plan.allowed_tools.join(", ")),
        );
        Ok(plan)
    }

    /// Validate the plan's write directories, then mark the task ready for
    /// execution. On a dangerous path the task stays STAGED.
    pub fn approve(&self, task_id: &str) -> anyhow::Result<Task> {
        let task = self.require(task_id)?;
        if let Err(e) = SandboxManager::validate_directories(&task.allowed_directories) {
            self.store.append_log(task_id, "ERROR", &e.to_string());
            return Err(e);
        }
        self.store
            .update_status(task_id, TaskStatus::Committed, StatusFields::default())?;
        self.store.append_log(task_id, "INFO", "task approved (committed)");
        self.require(task_id)
    }

    /// Cancel a task that has not started running.
    pub fn cancel(&self, task_id: &str) -> anyhow::Result<()> {
        self.store.update_status(
            task_id,
            TaskStatus::Cancelled,
            StatusFields {
                error_message: Some("cancelled before execution".to_owned()),
                ..StatusFields::default()
            },
        )?;
        self.store.append_log(task_id, "INFO", "task cancelled");
        Ok(())
    }

    /// Suspend a running task's subprocess. Prefers the local control
    /// channel; falls back to direct signal delivery when another process
    /// owns the task.
    pub fn pause(&self, task_id: &str) -> anyhow::Result<()> {
        let task = self.require(task_id)?;
        if self.processes.send(task_id, Control::Pause) {
            return Ok(());
        }
        match (task.status, task.process_id) {
            (TaskStatus::Running, Some(pid)) if pid_alive(pid) => {
                if !signal_pid(pid, Sig::Stop) {
                    return Err(NightshiftError::NotRunning {
                        task_id: task_id.to_owned(),
                        status: task.status,
                    }
                    .into());
                }
                self.store
                    .update_status(task_id, TaskStatus::Paused, StatusFields::default())?;
                self.store.append_log(task_id, "INFO", "paused");
                Ok(())
            }
            _ => Err(NightshiftError::NotRunning {
                task_id: task_id.to_owned(),
                status: task.status,
            }
            .into()),
        }
    }

    pub fn resume(&self, task_id: &str) -> anyhow::Result<()> {
        let task = self.require(task_id)?;
        if self.processes.send(task_id, Control::Resume) {
            return Ok(());
        }
        match (task.status, task.process_id) {
            (TaskStatus::Paused, Some(pid)) if pid_alive(pid) => {
                if !signal_pid(pid, Sig::Cont) {
                    return Err(NightshiftError::NotRunning {
                        task_id: task_id.to_owned(),
                        status: task.status,
                    }
                    .into());
                }
                self.store
                    .update_status(task_id, TaskStatus::Running, StatusFields::default())?;
                self.store.append_log(task_id, "INFO", "resumed");
                Ok(())
            }
            _ => Err(NightshiftError::NotRunning {
                task_id: task_id.to_owned(),
                status: task.status,
            }
            .into()),
        }
    }

    /// Kill a running or paused task. A recorded PID that is already dead
    /// still moves the task to CANCELLED.
    pub fn kill(&self, task_id: &str) -> anyhow::Result<()> {
        let task = self.require(task_id)?;
        if self.processes.send(task_id, Control::Kill) {
            return Ok(());
        }
        match (task.status, task.process_id) {
            (TaskStatus::Running | TaskStatus::Paused, Some(pid)) => {
                let message = if pid_alive(pid) {
                    let _ = signal_pid(pid, Sig::Cont);
                    let _ = signal_pid(pid, Sig::Kill);
                    "Task killed by user"
                } else {
                    "already terminated"
                };
                self.store.update_status(
                    task_id,
                    TaskStatus::Cancelled,
                    StatusFields {
                        error_message: Some(message.to_owned()),
                        ..StatusFields::default()
                    },
                )?;
                self.store.append_log(task_id, "INFO", message);
                Ok(())
            }
            _ => Err(NightshiftError::NotRunning {
                task_id: task_id.to_owned(),
                status: task.status,
            }
            .into()),
        }
    }

    pub fn list(&self, status: Option<TaskStatus>) -> anyhow::Result<Vec<Task>> {
        Ok(self.store.list(status)?)
    }

    /// Task plus its audit log and, when present, the persisted summary.
    pub fn get(&self, task_id: &str) -> anyhow::Result<TaskDetails> {
        let task = self.require(task_id)?;
        let logs = self.store.get_logs(task_id)?;
        let summary = std::fs::read(self.paths.notification_artifact(task_id))
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok());
        Ok(TaskDetails {
            task,
            logs,
            summary,
        })
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        self.store.clear_all()?;
        Ok(())
    }

    pub async fn executor_stop(&self, timeout: Duration) -> anyhow::Result<bool> {
        crate::executor::request_stop(&self.paths, timeout).await
    }

    fn require(&self, task_id: &str) -> anyhow::Result<Task> {
        self.store
            .get(task_id)?
            .ok_or_else(|| NightshiftError::TaskNotFound(task_id.to_owned()).into())
    }
}

/// Reconstruct the stored plan from a task's fields, for revision prompts.
fn plan_from_task(task: &Task) -> Plan {
    Plan {
        enhanced_prompt: task.description.clone(),
        allowed_tools: task.allowed_tools.clone(),
        allowed_directories: task.allowed_directories.clone(),
        needs_git: task.needs_git,
        system_prompt: task.system_prompt.clone().unwrap_or_default(),
        estimated_tokens: task.estimated_tokens,
        estimated_time: task.estimated_time,
    }
}
