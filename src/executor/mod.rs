#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::agent::process::{pid_alive, Control, ProcessMap};
use crate::agent::runner::AgentRunner;
use crate::config::Paths;
use crate::error::NightshiftError;
use crate::notify::Notifier;
use crate::task::model::{now_rfc3339, TaskStatus};
use crate::task::store::{StatusFields, TaskStore};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    /// Keep polling when the queue is empty. The drain mode used by
    /// auto-start exits after two consecutive idle polls instead.
    pub wait: bool,
    pub graceful_timeout: Duration,
}

impl ExecutorConfig {
    #[must_use]
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self {
            max_workers: settings.max_workers,
            poll_interval: settings.poll_interval,
            wait: true,
            graceful_timeout: Duration::from_secs(30),
        }
    }
}

/// On-disk singleton marker; a second executor refuses to start while the
/// lock exists, so externally issued signals always reach the one owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorLock {
    pub pid: u32,
    pub started_at: String,
    pub max_workers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatusReport {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
    pub worker_count: usize,
    pub active_tasks: Vec<String>,
    pub counts: BTreeMap<String, u64>,
}

pub fn load_lock(paths: &Paths) -> anyhow::Result<Option<ExecutorLock>> {
    let path = paths.executor_lock();
    if !path.exists() {
        return Ok(None);
    }
    let data =
        std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let lock: ExecutorLock = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(lock))
}

/// Executor status, readable from any process via the lock file and store.
pub fn status(paths: &Paths, store: &TaskStore) -> anyhow::Result<ExecutorStatusReport> {
    let lock = load_lock(paths)?;
    // A leftover lock from a crashed executor does not count as running.
    let lock = lock.filter(|l| pid_alive(l.pid));

    let mut counts = BTreeMap::new();
    for status in [
        TaskStatus::Staged,
        TaskStatus::Committed,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ] {
        counts.insert(status.as_str().to_owned(), store.count_by_status(status)?);
    }
    let active_tasks: Vec<String> = store
        .list(Some(TaskStatus::Running))?
        .into_iter()
        .chain(store.list(Some(TaskStatus::Paused))?)
        .map(|t| t.task_id)
        .collect();

    Ok(ExecutorStatusReport {
        running: lock.is_some(),
        pid: lock.as_ref().map(|l| l.pid),
        started_at: lock.as_ref().map(|l| l.started_at.clone()),
        worker_count: lock.as_ref().map_or(0, |l| l.max_workers),
        active_tasks,
        counts,
    })
}

/// Ask a running executor (possibly in another process) to stop, then wait
/// for its lock to disappear. Returns true once it has.
pub async fn request_stop(paths: &Paths, timeout: Duration) -> anyhow::Result<bool> {
    if load_lock(paths)?.is_none() {
        return Ok(false);
    }
    let stop = paths.executor_stop();
    std::fs::write(&stop, b"stop\n")
        .with_context(|| format!("failed to write {}", stop.display()))?;

    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if !paths.executor_lock().exists() {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Ok(false)
}

struct LockGuard {
    lock_file: std::path::PathBuf,
    stop_file: std::path::PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_file);
        let _ = std::fs::remove_file(&self.stop_file);
    }
}

/// Background worker pool: one controller polls and claims, each claimed
/// task runs on its own worker until its subprocess exits.
#[derive(Clone)]
pub struct ExecutorService {
    store: TaskStore,
    runner: Arc<AgentRunner>,
    notifier: Arc<Notifier>,
    processes: ProcessMap,
    paths: Paths,
}

impl ExecutorService {
    pub fn new(
        store: TaskStore,
        runner: AgentRunner,
        notifier: Notifier,
        processes: ProcessMap,
        paths: Paths,
    ) -> Self {
        Self {
            store,
            runner: Arc::new(runner),
            notifier: Arc::new(notifier),
            processes,
            paths,
        }
    }

    /// Run the polling loop until stopped (stop file, ctrl-c, or an empty
    /// queue in drain mode). Holds the singleton lock for its lifetime.
    pub async fn run(&self, cfg: ExecutorConfig) -> anyhow::Result<()> {
        let lock_file = self.paths.executor_lock();
        if let Some(existing) = load_lock(&self.paths)? {
            if pid_alive(existing.pid) {
                return Err(NightshiftError::ExecutorRunning(existing.pid).into());
            }
            tracing::warn!(
                "removing stale executor lock left by pid {}",
                existing.pid
            );
            let _ = std::fs::remove_file(&lock_file);
        }

        let lock = ExecutorLock {
            pid: std::process::id(),
            started_at: now_rfc3339(),
            max_workers: cfg.max_workers,
        };
        std::fs::write(&lock_file, serde_json::to_vec_pretty(&lock)?)
            .with_context(|| format!("failed to write {}", lock_file.display()))?;
        let stop_file = self.paths.executor_stop();
        let _guard = LockGuard {
            lock_file: lock_file.clone(),
            stop_file: stop_file.clone(),
        };

        self.recover_stale_tasks()?;
        tracing::info!(
            "executor started (workers={}, poll={:?})",
            cfg.max_workers,
            cfg.poll_interval
        );

        let mut ticker = tokio::time::interval(cfg.poll_interval);
        let mut joinset: tokio::task::JoinSet<()> = tokio::task::JoinSet::new();
        let mut empty_polls = 0u32;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {}
                Some(res) = joinset.join_next() => {
                    if let Err(e) = res {
                        tracing::error!("worker join error: {e}");
                    }
                }
            }

            if stop_file.exists() {
                break;
            }
            while let Some(res) = joinset.try_join_next() {
                if let Err(e) = res {
                    tracing::error!("worker join error: {e}");
                }
            }

            let mut claimed_any = false;
            while joinset.len() < cfg.max_workers {
                match self.store.acquire_for_execution() {
                    Ok(Some(task)) => {
                        claimed_any = true;
                        tracing::info!("claimed {} for execution", task.task_id);
                        let runner = Arc::clone(&self.runner);
                        let notifier = Arc::clone(&self.notifier);
                        let store = self.store.clone();
                        joinset.spawn(async move {
                            run_one(&runner, &notifier, &store, task).await;
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Storage hiccups (e.g. lock timeout) retry on the
                        // next tick.
                        tracing::error!("task acquisition failed: {e}");
                        break;
                    }
                }
            }

            if !cfg.wait && !claimed_any && joinset.is_empty() {
                empty_polls += 1;
                if empty_polls >= 2 {
                    break;
                }
            } else {
                empty_polls = 0;
            }
        }

        // Graceful shutdown: let in-flight workers finish, then kill what
        // remains.
        let drained =
            tokio::time::timeout(cfg.graceful_timeout, async {
                while joinset.join_next().await.is_some() {}
            })
            .await;
        if drained.is_err() {
            tracing::warn!(
                "graceful timeout elapsed; killing {} remaining tasks",
                self.processes.len()
            );
            for task_id in self.processes.active_tasks() {
                let _ = self.processes.send(&task_id, Control::Kill);
            }
            while joinset.join_next().await.is_some() {}
        }
        tracing::info!("executor stopped");
        Ok(())
    }

    /// Claim-and-run until the queue is idle, then return. Used by
    /// auto-start after approval.
    pub async fn drain(&self, mut cfg: ExecutorConfig) -> anyhow::Result<()> {
        cfg.wait = false;
        self.run(cfg).await
    }

    /// Tasks left RUNNING or PAUSED by a crashed executor have no live
    /// subprocess; fail them so the queue stays truthful.
    fn recover_stale_tasks(&self) -> anyhow::Result<()> {
        let stale = self
            .store
            .list(Some(TaskStatus::Running))?
            .into_iter()
            .chain(self.store.list(Some(TaskStatus::Paused))?);
        for task in stale {
            let gone = task.process_id.map_or(true, |pid| !pid_alive(pid));
            if !gone {
                continue;
            }
            if task.status == TaskStatus::Paused {
                let _ = self.store.update_status(
                    &task.task_id,
                    TaskStatus::Running,
                    StatusFields::default(),
                );
            }
            let msg = "previous executor stopped unexpectedly".to_owned();
            if let Err(e) = self.store.update_status(
                &task.task_id,
                TaskStatus::Failed,
                StatusFields {
                    error_message: Some(msg.clone()),
                    ..StatusFields::default()
                },
            ) {
                tracing::warn!("failed to recover stale task {}: {e}", task.task_id);
            } else {
                self.store.append_log(&task.task_id, "ERROR", &msg);
            }
        }
        Ok(())
    }
}

async fn run_one(runner: &AgentRunner, notifier: &Notifier, store: &TaskStore, task: crate::task::model::Task) {
    let task_id = task.task_id.clone();
    match runner.execute(&task).await {
        Ok(outcome) => {
            let fresh = store.get(&task_id).ok().flatten().unwrap_or(task);
            if let Err(e) = notifier.notify(&fresh, &outcome).await {
                tracing::error!("notification for {task_id} failed: {e}");
            }
        }
        Err(e) => {
            tracing::error!("{task_id} failed to launch: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn status_without_lock_reports_not_running() {
        let td = tempfile::tempdir().expect("tempdir");
        let paths = Paths::new(Some(td.path().to_path_buf())).unwrap();
        let store = TaskStore::open(&paths.db_path()).unwrap();

        let report = status(&paths, &store).unwrap();
        assert!(!report.running);
        assert_eq!(report.worker_count, 0);
        assert!(report.active_tasks.is_empty());
        assert_eq!(report.counts["running"], 0);
    }

    #[test]
    fn stale_lock_from_dead_pid_reports_not_running() {
        let td = tempfile::tempdir().expect("tempdir");
        let paths = Paths::new(Some(td.path().to_path_buf())).unwrap();
        let store = TaskStore::open(&paths.db_path()).unwrap();

        let lock = ExecutorLock {
            pid: u32::MAX - 1,
            started_at: now_rfc3339(),
            max_workers: 3,
        };
        std::fs::write(
            paths.executor_lock(),
            serde_json::to_vec_pretty(&lock).unwrap(),
        )
        .unwrap();

        let report = status(&paths, &store).unwrap();
        assert!(!report.running);
    }

    #[test]
    fn executor_config_uses_settings_defaults() {
        let cfg = ExecutorConfig::from_settings(&Settings::default());
        assert_eq!(cfg.max_workers, 3);
        assert_eq!(cfg.poll_interval, Duration::from_secs_f64(1.0));
        assert!(cfg.wait);
    }
}
