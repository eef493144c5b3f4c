#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context as _;
use tempfile::NamedTempFile;

use crate::config::home_dir;
use crate::error::NightshiftError;

/// Paths that must never be writable, matched exactly or as a prefix.
const DANGEROUS_PATHS: &[&str] = &[
    "/",
    "/private",
    "/etc",
    "/private/etc",
    "/var",
    "/private/var",
    "/bin",
    "/usr",
    "/sbin",
    "/System",
    "/Library",
    "/Applications",
    "/Volumes",
];

/// Generates deny-by-default write profiles for the platform sandbox
/// facility (`sandbox-exec`). Where the facility is absent, `generate`
/// returns None and `wrap` leaves commands untouched.
#[derive(Debug, Clone)]
pub struct SandboxManager {
    available: bool,
}

/// Scoped release of the profile temp file: the path is deleted on drop.
#[derive(Debug)]
pub struct SandboxProfile {
    path: tempfile::TempPath,
}

impl SandboxProfile {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SandboxManager {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            available: enabled && Self::facility_available(),
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available
    }

    fn facility_available() -> bool {
        Command::new("sandbox-exec")
            .arg("-n")
            .arg("no-network")
            .arg("/usr/bin/true")
            .output()
            .is_ok()
    }

    /// Reject directories under any system root; warn on the home directory.
    pub fn validate_directories(directories: &[String]) -> anyhow::Result<Vec<PathBuf>> {
        let home = home_dir();
        let mut validated = Vec::with_capacity(directories.len());

        for dir in directories {
            let path = PathBuf::from(dir);
            let resolved = path.canonicalize().unwrap_or(path);
            let as_str = resolved.to_string_lossy();

            for dangerous in DANGEROUS_PATHS {
                if as_str == *dangerous || as_str.starts_with(&format!("{dangerous}/")) {
                    return Err(NightshiftError::DangerousPath(resolved).into());
                }
            }
            if let Some(home) = &home {
                if &resolved == home {
                    tracing::warn!(
                        "allowing writes to entire home directory {}; consider a subdirectory",
                        resolved.display()
                    );
                }
            }
            validated.push(resolved);
        }
        Ok(validated)
    }

    /// Write a profile allowing writes only inside `allowed_directories`
    /// (plus temp dirs and the agent config dir). Returns None when the
    /// sandbox facility is unavailable.
    pub fn generate(
        &self,
        allowed_directories: &[String],
        needs_git: bool,
    ) -> anyhow::Result<Option<SandboxProfile>> {
        if !self.available {
            return Ok(None);
        }
        let validated = Self::validate_directories(allowed_directories)?;
        let content = render_profile(&validated, needs_git);

        let mut file = NamedTempFile::with_prefix("nightshift_sandbox_")
            .context("failed to create sandbox profile temp file")?;
        file.write_all(content.as_bytes())
            .context("failed to write sandbox profile")?;
        let path = file.into_temp_path();
        tracing::debug!("sandbox profile written to {}", path.display());
        Ok(Some(SandboxProfile { path }))
    }

    /// Prefix `program args...` with the sandbox invocation. Identity when
    /// no profile exists.
    #[must_use]
    pub fn wrap(
        &self,
        profile: Option<&SandboxProfile>,
        program: &str,
        args: &[String],
    ) -> (String, Vec<String>) {
        match profile {
            Some(profile) => {
                let mut wrapped = vec![
                    "-f".to_owned(),
                    profile.path().to_string_lossy().to_string(),
                    program.to_owned(),
                ];
                wrapped.extend(args.iter().cloned());
                ("sandbox-exec".to_owned(), wrapped)
            }
            None => (program.to_owned(), args.to_vec()),
        }
    }
}

/// The write-allow set for a profile: allowed directories, temp dirs, the
/// agent config dir, and the git-support entries when requested.
#[must_use]
pub fn write_allow_entries(allowed: &[PathBuf], needs_git: bool) -> BTreeSet<String> {
    let mut entries: BTreeSet<String> = allowed
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect();

    entries.insert("/tmp".to_owned());
    entries.insert("/private/tmp".to_owned());
    entries.insert("/private/var/tmp".to_owned());
    entries.insert(std::env::temp_dir().to_string_lossy().to_string());
    if let Some(home) = home_dir() {
        // The agent binary writes session state and debug logs here.
        entries.insert(home.join(".claude").to_string_lossy().to_string());
        entries.insert(home.join(".claude.json").to_string_lossy().to_string());
        if needs_git {
            entries.insert(home.join(".config/gh").to_string_lossy().to_string());
        }
    }
    entries
}

fn render_profile(allowed: &[PathBuf], needs_git: bool) -> String {
    let mut lines = vec![
        "(version 1)".to_owned(),
        String::new(),
        ";; deny everything by default".to_owned(),
        "(deny default)".to_owned(),
        String::new(),
        "(allow process-exec*)".to_owned(),
        "(allow process-fork)".to_owned(),
        "(allow signal)".to_owned(),
        "(allow sysctl-read)".to_owned(),
        String::new(),
        "(allow file-read*)".to_owned(),
        "(allow network*)".to_owned(),
        "(allow ipc*)".to_owned(),
        "(allow mach*)".to_owned(),
        String::new(),
        ";; writes only inside the allow-list".to_owned(),
    ];
    for entry in write_allow_entries(allowed, needs_git) {
        lines.push(format!("(allow file-write* (subpath \"{entry}\"))"));
    }
    if needs_git {
        lines.push(String::new());
        lines.push(";; gh needs the tty and null devices, plus TLS/DNS services".to_owned());
        lines.push("(allow file-write* (literal \"/dev/null\"))".to_owned());
        lines.push("(allow file-write* (literal \"/dev/tty\"))".to_owned());
        lines.push("(allow mach-lookup (global-name \"com.apple.trustd\"))".to_owned());
        lines.push("(allow mach-lookup (global-name \"com.apple.dnssd.service\"))".to_owned());
    }
    lines.push(String::new());
    lines.join("\n")
}
