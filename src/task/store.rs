#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension as _, TransactionBehavior};

use crate::error::NightshiftError;
use crate::task::model::{now_rfc3339, LogEntry, Plan, Task, TaskStatus};

/// Optional fields attached to a status update.
#[derive(Debug, Clone, Default)]
pub struct StatusFields {
    pub process_id: Option<u32>,
    pub result_path: Option<String>,
    pub token_usage: Option<u64>,
    pub execution_time: Option<f64>,
    pub error_message: Option<String>,
}

/// SQLite-backed task store. Cloneable; every operation opens its own
/// connection so worker threads never share a handle.
#[derive(Debug, Clone)]
pub struct TaskStore {
    db_path: PathBuf,
}

impl TaskStore {
    pub fn open(db_path: &Path) -> Result<Self, NightshiftError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| NightshiftError::IoPath {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, NightshiftError> {
        let conn = Connection::open(&self.db_path)?;
        // Wait out writers holding the immediate-exclusive claim lock.
        conn.busy_timeout(Duration::from_secs(30))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<(), NightshiftError> {
        let conn = self.connect()?;
        // journal_mode returns a row; query_row swallows it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                allowed_tools TEXT NOT NULL DEFAULT '[]',
                allowed_directories TEXT NOT NULL DEFAULT '[]',
                needs_git INTEGER NOT NULL DEFAULT 0,
                system_prompt TEXT,
                estimated_tokens INTEGER,
                estimated_time INTEGER,
                timeout_seconds INTEGER NOT NULL DEFAULT 900,
                process_id INTEGER,
                result_path TEXT,
                token_usage INTEGER,
                execution_time REAL,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS task_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                log_level TEXT NOT NULL,
                message TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(task_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status_created
             ON tasks(status, created_at)",
            [],
        )?;
        Ok(())
    }

    /// Insert a new STAGED task. Rejects duplicate ids.
    pub fn create(&self, task: &Task) -> Result<(), NightshiftError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO tasks (
                task_id, description, status, allowed_tools, allowed_directories,
                needs_git, system_prompt, estimated_tokens, estimated_time,
                timeout_seconds, process_id, result_path, token_usage,
                execution_time, error_message, created_at, updated_at,
                started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                task.task_id,
                task.description,
                task.status.as_str(),
                serde_json::to_string(&task.allowed_tools).unwrap_or_else(|_| "[]".to_owned()),
                serde_json::to_string(&task.allowed_directories)
                    .unwrap_or_else(|_| "[]".to_owned()),
                i64::from(task.needs_git),
                task.system_prompt,
                task.estimated_tokens.map(|v| v as i64),
                task.estimated_time.map(|v| v as i64),
                task.timeout_seconds as i64,
                task.process_id.map(i64::from),
                task.result_path,
                task.token_usage.map(|v| v as i64),
                task.execution_time,
                task.error_message,
                task.created_at,
                task.updated_at,
                task.started_at,
                task.completed_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>, NightshiftError> {
        let conn = self.connect()?;
        let task = conn
            .query_row(
                "SELECT * FROM tasks WHERE task_id = ?1",
                params![task_id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, NightshiftError> {
        let conn = self.connect()?;
        let mut out = Vec::new();
        match status {
            Some(s) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at DESC, task_id DESC",
                )?;
                let rows = stmt.query_map(params![s.as_str()], row_to_task)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM tasks ORDER BY created_at DESC, task_id DESC")?;
                let rows = stmt.query_map([], row_to_task)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Replace the plan-derived fields of a STAGED task.
    pub fn update_plan(&self, task_id: &str, plan: &Plan) -> Result<(), NightshiftError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE tasks SET
                description = ?1,
                allowed_tools = ?2,
                allowed_directories = ?3,
                needs_git = ?4,
                system_prompt = ?5,
                estimated_tokens = ?6,
                estimated_time = ?7,
                updated_at = ?8
             WHERE task_id = ?9 AND status = 'staged'",
            params![
                plan.enhanced_prompt,
                serde_json::to_string(&plan.allowed_tools).unwrap_or_else(|_| "[]".to_owned()),
                serde_json::to_string(&plan.allowed_directories)
                    .unwrap_or_else(|_| "[]".to_owned()),
                i64::from(plan.needs_git),
                plan.system_prompt,
                plan.estimated_tokens.map(|v| v as i64),
                plan.estimated_time.map(|v| v as i64),
                now_rfc3339(),
                task_id,
            ],
        )?;
        if changed == 0 {
            return match self.get(task_id)? {
                None => Err(NightshiftError::TaskNotFound(task_id.to_owned())),
                Some(task) => Err(NightshiftError::InvalidTransition {
                    from: task.status,
                    to: TaskStatus::Staged,
                }),
            };
        }
        Ok(())
    }

    /// Move a task along the transition graph, applying the timestamp
    /// invariants and any extra fields. Fails without modifying the row when
    /// the edge is not legal.
    pub fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        fields: StatusFields,
    ) -> Result<(), NightshiftError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| NightshiftError::TaskNotFound(task_id.to_owned()))?;
        let current = TaskStatus::parse(&current)
            .ok_or_else(|| NightshiftError::TaskNotFound(task_id.to_owned()))?;

        if !current.can_transition_to(new_status) {
            return Err(NightshiftError::InvalidTransition {
                from: current,
                to: new_status,
            });
        }

        let now = now_rfc3339();
        let mut sets = vec!["status = ?1".to_owned(), "updated_at = ?2".to_owned()];
        let mut values: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(new_status.as_str().to_owned()), Box::new(now.clone())];
        let mut idx = 3;

        if new_status == TaskStatus::Running {
            // First arrival only; resume keeps the original start time.
            sets.push(format!("started_at = COALESCE(started_at, ?{idx})"));
            values.push(Box::new(now.clone()));
            idx += 1;
        }
        if new_status.is_terminal() {
            sets.push(format!("completed_at = ?{idx}"));
            values.push(Box::new(now));
            idx += 1;
            sets.push("process_id = NULL".to_owned());
        } else if let Some(pid) = fields.process_id {
            sets.push(format!("process_id = ?{idx}"));
            values.push(Box::new(i64::from(pid)));
            idx += 1;
        }
        if let Some(v) = fields.result_path {
            sets.push(format!("result_path = ?{idx}"));
            values.push(Box::new(v));
            idx += 1;
        }
        if let Some(v) = fields.token_usage {
            sets.push(format!("token_usage = ?{idx}"));
            values.push(Box::new(v as i64));
            idx += 1;
        }
        if let Some(v) = fields.execution_time {
            sets.push(format!("execution_time = ?{idx}"));
            values.push(Box::new(v));
            idx += 1;
        }
        if let Some(v) = fields.error_message {
            sets.push(format!("error_message = ?{idx}"));
            values.push(Box::new(v));
            idx += 1;
        }
        let _ = idx;

        let sql = format!(
            "UPDATE tasks SET {} WHERE task_id = ?{}",
            sets.join(", "),
            values.len() + 1
        );
        values.push(Box::new(task_id.to_owned()));
        let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(AsRef::as_ref).collect();
        tx.execute(&sql, refs.as_slice())?;
        tx.commit()?;
        Ok(())
    }

    /// Publish the live subprocess PID and result path for a task that is
    /// already RUNNING. Kept separate from `update_status` because PID
    /// publication is not a lifecycle transition.
    pub fn record_process(
        &self,
        task_id: &str,
        process_id: u32,
        result_path: &Path,
    ) -> Result<(), NightshiftError> {
        let conn = self.connect()?;
        let result_path = result_path.to_string_lossy().to_string();
        let changed = conn.execute(
            "UPDATE tasks SET process_id = ?1, result_path = ?2, updated_at = ?3
             WHERE task_id = ?4",
            params![i64::from(process_id), result_path, now_rfc3339(), task_id],
        )?;
        if changed == 0 {
            return Err(NightshiftError::TaskNotFound(task_id.to_owned()));
        }
        Ok(())
    }

    /// Atomically claim the oldest COMMITTED task: select + mark RUNNING
    /// under an immediate-exclusive transaction so concurrent workers can
    /// never claim the same row.
    pub fn acquire_for_execution(&self) -> Result<Option<Task>, NightshiftError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let task_id: Option<String> = tx
            .query_row(
                "SELECT task_id FROM tasks
                 WHERE status = 'committed'
                 ORDER BY created_at ASC, task_id ASC
                 LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(task_id) = task_id else {
            return Ok(None);
        };

        let now = now_rfc3339();
        tx.execute(
            "UPDATE tasks SET status = 'running', updated_at = ?1,
                 started_at = COALESCE(started_at, ?2)
             WHERE task_id = ?3",
            params![now, now, task_id],
        )?;
        tx.commit()?;

        self.get(&task_id)
    }

    pub fn count_by_status(&self, status: TaskStatus) -> Result<u64, NightshiftError> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Append-only audit log. Failures here are non-fatal and swallowed.
    pub fn append_log(&self, task_id: &str, level: &str, message: &str) {
        let result = self.connect().and_then(|conn| {
            conn.execute(
                "INSERT INTO task_logs (task_id, timestamp, log_level, message)
                 VALUES (?1, ?2, ?3, ?4)",
                params![task_id, now_rfc3339(), level, message],
            )
            .map_err(NightshiftError::from)
        });
        if let Err(e) = result {
            tracing::warn!("failed to append task log for {task_id}: {e}");
        }
    }

    pub fn get_logs(&self, task_id: &str) -> Result<Vec<LogEntry>, NightshiftError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, timestamp, log_level, message
             FROM task_logs WHERE task_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok(LogEntry {
                task_id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                message: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete(&self, task_id: &str) -> Result<bool, NightshiftError> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM task_logs WHERE task_id = ?1", params![task_id])?;
        let changed = conn.execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id])?;
        Ok(changed > 0)
    }

    /// Truncate both tables (front-end clear-all).
    pub fn clear_all(&self) -> Result<(), NightshiftError> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM task_logs", [])?;
        conn.execute("DELETE FROM tasks", [])?;
        Ok(())
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let allowed_tools: String = row.get("allowed_tools")?;
    let allowed_directories: String = row.get("allowed_directories")?;
    Ok(Task {
        task_id: row.get("task_id")?,
        description: row.get("description")?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        allowed_tools: serde_json::from_str(&allowed_tools).unwrap_or_default(),
        allowed_directories: serde_json::from_str(&allowed_directories).unwrap_or_default(),
        needs_git: row.get::<_, i64>("needs_git")? != 0,
        system_prompt: row.get("system_prompt")?,
        estimated_tokens: row.get::<_, Option<i64>>("estimated_tokens")?.map(|v| v as u64),
        estimated_time: row.get::<_, Option<i64>>("estimated_time")?.map(|v| v as u64),
        timeout_seconds: row.get::<_, i64>("timeout_seconds")? as u64,
        process_id: row.get::<_, Option<i64>>("process_id")?.map(|v| v as u32),
        result_path: row.get("result_path")?,
        token_usage: row.get::<_, Option<i64>>("token_usage")?.map(|v| v as u64),
        execution_time: row.get("execution_time")?,
        error_message: row.get("error_message")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::DEFAULT_TIMEOUT_SECONDS;

    fn staged(description: &str) -> Task {
        let now = now_rfc3339();
        Task {
            task_id: Task::new_id(),
            description: description.to_owned(),
            status: TaskStatus::Staged,
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

    fn test_store() -> (tempfile::TempDir, TaskStore) {
        let td = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::open(&td.path().join("tasks.db")).expect("open store");
        (td, store)
    }

    #[test]
    fn create_get_roundtrip() {
        let (_td, store) = test_store();
        let mut task = staged("write a haiku about dusk");
        task.allowed_tools = vec!["Write".to_owned()];
        task.allowed_directories = vec!["/work/out".to_owned()];
        store.create(&task).unwrap();

        let loaded = store.get(&task.task_id).unwrap().expect("present");
        assert_eq!(loaded, task);
        assert!(store.get("task_ffffffff").unwrap().is_none());
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let (_td, store) = test_store();
        let task = staged("dup");
        store.create(&task).unwrap();
        assert!(matches!(
            store.create(&task),
            Err(NightshiftError::Storage(_))
        ));
    }

    #[test]
    fn list_orders_newest_first_and_filters() {
        let (_td, store) = test_store();
        let mut a = staged("a");
        a.created_at = "2026-01-01T00:00:00Z".to_owned();
        let mut b = staged("b");
        b.created_at = "2026-01-02T00:00:00Z".to_owned();
        store.create(&a).unwrap();
        store.create(&b).unwrap();

        let all = store.list(None).unwrap();
        assert_eq!(all[0].description, "b");
        assert_eq!(all[1].description, "a");

        store
            .update_status(&a.task_id, TaskStatus::Committed, StatusFields::default())
            .unwrap();
        let committed = store.list(Some(TaskStatus::Committed)).unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].task_id, a.task_id);
    }

    #[test]
    fn invalid_transition_leaves_row_untouched() {
        let (_td, store) = test_store();
        let task = staged("t");
        store.create(&task).unwrap();

        let err = store
            .update_status(&task.task_id, TaskStatus::Completed, StatusFields::default())
            .unwrap_err();
        assert!(matches!(err, NightshiftError::InvalidTransition { .. }));

        let loaded = store.get(&task.task_id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Staged);
        assert!(loaded.completed_at.is_none());
    }

    #[test]
    fn timestamps_follow_lifecycle() {
        let (_td, store) = test_store();
        let task = staged("lifecycle");
        store.create(&task).unwrap();

        store
            .update_status(&task.task_id, TaskStatus::Committed, StatusFields::default())
            .unwrap();
        let t = store.get(&task.task_id).unwrap().unwrap();
        assert!(t.started_at.is_none());

        store
            .update_status(
                &task.task_id,
                TaskStatus::Running,
                StatusFields {
                    process_id: Some(4242),
                    ..StatusFields::default()
                },
            )
            .unwrap();
        let t = store.get(&task.task_id).unwrap().unwrap();
        let first_start = t.started_at.clone().expect("started_at set");
        assert_eq!(t.process_id, Some(4242));

        store
            .update_status(&task.task_id, TaskStatus::Paused, StatusFields::default())
            .unwrap();
        store
            .update_status(&task.task_id, TaskStatus::Running, StatusFields::default())
            .unwrap();
        let t = store.get(&task.task_id).unwrap().unwrap();
        assert_eq!(t.started_at.as_deref(), Some(first_start.as_str()));

        store
            .update_status(
                &task.task_id,
                TaskStatus::Completed,
                StatusFields {
                    token_usage: Some(465),
                    execution_time: Some(1.5),
                    result_path: Some("/tmp/out.json".to_owned()),
                    ..StatusFields::default()
                },
            )
            .unwrap();
        let t = store.get(&task.task_id).unwrap().unwrap();
        assert!(t.completed_at.is_some());
        assert!(t.process_id.is_none(), "pid cleared on terminal status");
        assert_eq!(t.token_usage, Some(465));
        assert!(t.completed_at.as_deref() >= t.started_at.as_deref());
        assert!(t.started_at.as_deref().unwrap() >= t.created_at.as_str());
    }

    #[test]
    fn acquire_takes_oldest_committed() {
        let (_td, store) = test_store();
        let mut first = staged("first");
        first.created_at = "2026-01-01T00:00:00Z".to_owned();
        let mut second = staged("second");
        second.created_at = "2026-01-02T00:00:00Z".to_owned();
        store.create(&second).unwrap();
        store.create(&first).unwrap();
        for id in [&first.task_id, &second.task_id] {
            store
                .update_status(id, TaskStatus::Committed, StatusFields::default())
                .unwrap();
        }

        let got = store.acquire_for_execution().unwrap().expect("one claimed");
        assert_eq!(got.task_id, first.task_id);
        assert_eq!(got.status, TaskStatus::Running);
        assert!(got.started_at.is_some());

        let got = store.acquire_for_execution().unwrap().expect("second");
        assert_eq!(got.task_id, second.task_id);
        assert!(store.acquire_for_execution().unwrap().is_none());
    }

    #[test]
    fn concurrent_acquire_hands_out_distinct_tasks() {
        let (_td, store) = test_store();
        let n_tasks = 5;
        let n_workers = 8;
        for i in 0..n_tasks {
            let mut t = staged(&format!("job {i}"));
            t.created_at = format!("2026-01-0{}T00:00:00Z", i + 1);
            store.create(&t).unwrap();
            store
                .update_status(&t.task_id, TaskStatus::Committed, StatusFields::default())
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..n_workers {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.acquire_for_execution().unwrap().map(|t| t.task_id)
            }));
        }
        let mut claimed: Vec<String> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        claimed.sort();
        let before = claimed.len();
        claimed.dedup();
        assert_eq!(claimed.len(), before, "no task claimed twice");
        assert_eq!(claimed.len(), n_tasks, "exactly N workers got tasks");
        assert_eq!(
            store.count_by_status(TaskStatus::Running).unwrap(),
            n_tasks as u64
        );
    }

    #[test]
    fn update_plan_only_while_staged() {
        let (_td, store) = test_store();
        let task = staged("plan me");
        store.create(&task).unwrap();

        let plan = Plan {
            enhanced_prompt: "enriched".to_owned(),
            allowed_tools: vec!["WebSearch".to_owned(), "Write".to_owned()],
            allowed_directories: vec!["/work".to_owned()],
            needs_git: false,
            system_prompt: "be brief".to_owned(),
            estimated_tokens: Some(500),
            estimated_time: Some(30),
        };
        store.update_plan(&task.task_id, &plan).unwrap();
        let t = store.get(&task.task_id).unwrap().unwrap();
        assert_eq!(t.description, "enriched");
        assert_eq!(t.allowed_tools, plan.allowed_tools);
        assert_eq!(t.status, TaskStatus::Staged);

        store
            .update_status(&task.task_id, TaskStatus::Committed, StatusFields::default())
            .unwrap();
        assert!(matches!(
            store.update_plan(&task.task_id, &plan),
            Err(NightshiftError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn revision_replaces_old_tools() {
        let (_td, store) = test_store();
        let task = staged("analyze quantum-computing trends");
        store.create(&task).unwrap();

        let initial = Plan {
            enhanced_prompt: "analyze quantum-computing trends".to_owned(),
            allowed_tools: vec!["WebSearch".to_owned(), "Write".to_owned()],
            allowed_directories: vec!["/work".to_owned()],
            needs_git: false,
            system_prompt: String::new(),
            estimated_tokens: None,
            estimated_time: None,
        };
        store.update_plan(&task.task_id, &initial).unwrap();

        let revised = Plan {
            allowed_tools: vec!["ext__arxiv__search".to_owned(), "Write".to_owned()],
            ..initial
        };
        store.update_plan(&task.task_id, &revised).unwrap();

        let t = store.get(&task.task_id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Staged);
        assert_eq!(t.allowed_tools, revised.allowed_tools);
        assert!(!t.allowed_tools.iter().any(|s| s == "WebSearch"));
    }

    #[test]
    fn logs_append_and_read_in_order() {
        let (_td, store) = test_store();
        let task = staged("logged");
        store.create(&task).unwrap();

        store.append_log(&task.task_id, "INFO", "created");
        store.append_log(&task.task_id, "ERROR", "something broke");

        let logs = store.get_logs(&task.task_id).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "created");
        assert_eq!(logs[1].level, "ERROR");
    }

    #[test]
    fn clear_all_truncates_both_tables() {
        let (_td, store) = test_store();
        let task = staged("gone");
        store.create(&task).unwrap();
        store.append_log(&task.task_id, "INFO", "hello");

        store.clear_all().unwrap();
        assert!(store.list(None).unwrap().is_empty());
        assert!(store.get_logs(&task.task_id).unwrap().is_empty());
    }
}
