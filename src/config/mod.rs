#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;

use crate::error::NightshiftError;

/// Directory layout rooted at the data dir (default `~/.nightshift`).
#[derive(Debug, Clone)]
pub struct Paths {
    pub base_dir: PathBuf,
}

impl Paths {
    pub fn new(base_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let base_dir = match base_dir {
            Some(dir) => dir,
            None => match env_nonempty("NIGHTSHIFT_DATA_DIR") {
                Some(dir) => expand_path(&dir)?,
                None => home_dir()
                    .context("failed to determine home directory")?
                    .join(".nightshift"),
            },
        };
        let paths = Self { base_dir };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [
            self.base_dir.clone(),
            self.database_dir(),
            self.logs_dir(),
            self.output_dir(),
            self.notifications_dir(),
            self.config_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn database_dir(&self) -> PathBuf {
        self.base_dir.join("database")
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.database_dir().join("nightshift.db")
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.base_dir.join("output")
    }

    #[must_use]
    pub fn notifications_dir(&self) -> PathBuf {
        self.base_dir.join("notifications")
    }

    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    #[must_use]
    pub fn output_artifact(&self, task_id: &str) -> PathBuf {
        self.output_dir().join(format!("{task_id}_output.json"))
    }

    #[must_use]
    pub fn files_artifact(&self, task_id: &str) -> PathBuf {
        self.output_dir().join(format!("{task_id}_files.json"))
    }

    #[must_use]
    pub fn notification_artifact(&self, task_id: &str) -> PathBuf {
        self.notifications_dir()
            .join(format!("{task_id}_notification.json"))
    }

    /// Routing metadata written by an adapter before submit, consumed by the
    /// notifier after completion.
    #[must_use]
    pub fn routing_metadata(&self, task_id: &str) -> PathBuf {
        self.notifications_dir()
            .join(format!("{task_id}_routing.json"))
    }

    #[must_use]
    pub fn executor_lock(&self) -> PathBuf {
        self.base_dir.join("executor.lock")
    }

    #[must_use]
    pub fn executor_stop(&self) -> PathBuf {
        self.base_dir.join("executor.stop")
    }

    #[must_use]
    pub fn tool_registry_path(&self) -> PathBuf {
        self.config_dir().join("tool_servers.json")
    }

    #[must_use]
    pub fn tools_reference_path(&self) -> PathBuf {
        self.config_dir().join("tools_reference.md")
    }

    #[must_use]
    pub fn directory_map_path(&self) -> PathBuf {
        self.config_dir().join("directory_map.md")
    }

    #[must_use]
    pub fn sink_config_path(&self) -> PathBuf {
        self.config_dir().join("sinks.json")
    }

    #[must_use]
    pub fn subscription_token_file(&self) -> PathBuf {
        self.base_dir.join("claude_token")
    }
}

/// Runtime settings, consumed from the environment with defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub auto_start: bool,
    pub agent_bin: String,
    pub enable_sandbox: bool,
    pub terminal_notifications: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_workers: 3,
            poll_interval: Duration::from_secs_f64(1.0),
            auto_start: true,
            agent_bin: "claude".to_owned(),
            enable_sandbox: true,
            terminal_notifications: true,
        }
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut s = Self::default();
        if let Some(v) = env_nonempty("NIGHTSHIFT_MAX_WORKERS") {
            s.max_workers = v
                .parse()
                .map_err(|_| NightshiftError::Config(format!("invalid NIGHTSHIFT_MAX_WORKERS '{v}'")))?;
        }
        if let Some(v) = env_nonempty("NIGHTSHIFT_POLL_INTERVAL") {
            let secs: f64 = v
                .parse()
                .map_err(|_| NightshiftError::Config(format!("invalid NIGHTSHIFT_POLL_INTERVAL '{v}'")))?;
            s.poll_interval = Duration::from_secs_f64(secs);
        }
        if let Some(v) = env_nonempty("NIGHTSHIFT_AUTO_START") {
            s.auto_start = parse_bool(&v)
                .map_err(|msg| NightshiftError::Config(format!("NIGHTSHIFT_AUTO_START: {msg}")))?;
        }
        if let Some(v) = env_nonempty("NIGHTSHIFT_AGENT_BIN") {
            s.agent_bin = expand_tilde(&v);
        }
        if let Some(v) = env_nonempty("NIGHTSHIFT_SANDBOX") {
            s.enable_sandbox = parse_bool(&v)
                .map_err(|msg| NightshiftError::Config(format!("NIGHTSHIFT_SANDBOX: {msg}")))?;
        }
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<(), NightshiftError> {
        if self.max_workers == 0 {
            return Err(NightshiftError::Config(
                "max_workers must be >= 1".to_owned(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(NightshiftError::Config(
                "poll_interval must be > 0".to_owned(),
            ));
        }
        if self.agent_bin.trim().is_empty() {
            return Err(NightshiftError::Config(
                "agent binary must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Name of the env var holding the subscription-mode token for the agent
/// binary. The conflicting direct-API variable is stripped from every child
/// environment.
pub const SUBSCRIPTION_TOKEN_VAR: &str = "CLAUDE_CODE_OAUTH_TOKEN";
pub const CONFLICTING_TOKEN_VAR: &str = "ANTHROPIC_API_KEY";

/// API keys passed through to the sandboxed child when present, since the
/// sandbox blocks keychain access.
pub const PASSTHROUGH_KEY_VARS: &[&str] = &["GEMINI_API_KEY", "OPENAI_API_KEY"];

fn env_nonempty(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(format!("expected true|false, got '{other}'")),
    }
}

#[must_use]
pub fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        return Some(PathBuf::from(v));
    }
    None
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    input.to_owned()
}

pub fn expand_path(input: &str) -> anyhow::Result<PathBuf> {
    let expanded = expand_env_vars(&expand_tilde(input));
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(cwd.join(p))
}

fn expand_env_vars(input: &str) -> String {
    // Expand $VAR and ${VAR}. Leave unknown vars untouched.
    let re = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .unwrap_or_else(|_| regex::Regex::new("$^").unwrap());
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        std::env::var(key).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}
