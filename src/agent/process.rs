#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::process::Command;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Control requests delivered to a live agent-runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Pause,
    Resume,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig {
    Stop,
    Cont,
    Kill,
}

impl Sig {
    fn flag(self) -> &'static str {
        match self {
            Self::Stop => "-STOP",
            Self::Cont => "-CONT",
            Self::Kill => "-KILL",
        }
    }
}

#[derive(Debug)]
struct Entry {
    pid: u32,
    tx: mpsc::UnboundedSender<Control>,
}

/// Process-wide `task_id -> live subprocess` map. Entries are added when the
/// runner spawns and removed by guard when it exits; a missing entry means
/// the task is not owned by a runner in this process.
#[derive(Debug, Clone, Default)]
pub struct ProcessMap {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

/// Removes the map entry when the owning runner finishes.
pub struct Registration {
    map: ProcessMap,
    task_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.map.inner.lock() {
            inner.remove(&self.task_id);
        }
    }
}

impl ProcessMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(
        &self,
        task_id: &str,
        pid: u32,
        tx: mpsc::UnboundedSender<Control>,
    ) -> Registration {
        if let Ok(mut inner) = self.inner.lock() {
            inner.insert(task_id.to_owned(), Entry { pid, tx });
        }
        Registration {
            map: self.clone(),
            task_id: task_id.to_owned(),
        }
    }

    #[must_use]
    pub fn pid_of(&self, task_id: &str) -> Option<u32> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.get(task_id).map(|e| e.pid))
    }

    /// Deliver a control request to the local runner that owns `task_id`.
    /// Returns false when no live local entry exists.
    #[must_use]
    pub fn send(&self, task_id: &str, control: Control) -> bool {
        let Ok(inner) = self.inner.lock() else {
            return false;
        };
        match inner.get(task_id) {
            Some(entry) => entry.tx.send(control).is_ok(),
            None => false,
        }
    }

    #[must_use]
    pub fn active_tasks(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deliver an OS signal to a PID via kill(1). Returns true when delivery
/// succeeded.
#[must_use]
pub fn signal_pid(pid: u32, sig: Sig) -> bool {
    Command::new("kill")
        .arg(sig.flag())
        .arg(pid.to_string())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// kill -0: existence probe without delivering anything.
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
