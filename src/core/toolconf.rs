#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

/// How to launch one external tool server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ToolConfig {
    #[serde(rename = "toolServers")]
    tool_servers: BTreeMap<String, ServerSpec>,
}

/// Per-run tool config file; deleted when dropped.
#[derive(Debug)]
pub struct ToolConfigFile {
    path: tempfile::TempPath,
}

impl ToolConfigFile {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Registry of external tool servers, read once at startup. Emits minimal
/// per-run config files containing only the servers a plan's tools name.
/// The agent binary loads every declared server into context, so shipping
/// only the required subset cuts fixed overhead; the sandbox, not this
/// file, is the security boundary.
#[derive(Debug, Clone, Default)]
pub struct ToolConfigManager {
    servers: BTreeMap<String, ServerSpec>,
}

impl ToolConfigManager {
    /// Load the registry. A missing file is equivalent to an empty registry.
    pub fn load(registry_path: &Path) -> anyhow::Result<Self> {
        if !registry_path.exists() {
            tracing::debug!(
                "tool registry not found at {}, using empty registry",
                registry_path.display()
            );
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(registry_path)
            .with_context(|| format!("failed to read {}", registry_path.display()))?;
        let servers: BTreeMap<String, ServerSpec> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", registry_path.display()))?;
        tracing::info!("tool registry loaded with {} servers", servers.len());
        Ok(Self { servers })
    }

    #[must_use]
    pub fn from_servers(servers: BTreeMap<String, ServerSpec>) -> Self {
        Self { servers }
    }

    #[must_use]
    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    #[must_use]
    pub fn knows(&self, server: &str) -> bool {
        self.servers.contains_key(server)
    }

    /// Emit the minimal config for `allowed_tools`. Unqualified tool names
    /// contribute nothing; unknown servers are logged and skipped (the
    /// planner rejects them earlier).
    pub fn write_minimal(&self, allowed_tools: &[String]) -> anyhow::Result<ToolConfigFile> {
        let needed = extract_server_names(allowed_tools);
        let missing: Vec<&String> = needed
            .iter()
            .filter(|name| !self.servers.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                "tool servers not present in registry: {}",
                missing
                    .iter()
                    .map(|name| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let config = ToolConfig {
            tool_servers: self
                .servers
                .iter()
                .filter(|(name, _)| needed.contains(*name))
                .map(|(name, spec)| (name.clone(), spec.clone()))
                .collect(),
        };
        write_config(&config)
    }

    /// Config with no servers at all (planner runs, tool-free tasks).
    pub fn write_empty(&self) -> anyhow::Result<ToolConfigFile> {
        write_config(&ToolConfig::default())
    }
}

/// Pull server names out of qualified identifiers `ext__<server>__<op>`.
#[must_use]
pub fn extract_server_names(tool_names: &[String]) -> BTreeSet<String> {
    let mut servers = BTreeSet::new();
    for tool in tool_names {
        if let Some(rest) = tool.strip_prefix("ext__") {
            if let Some((server, _op)) = rest.split_once("__") {
                if !server.is_empty() {
                    servers.insert(server.to_owned());
                }
            }
        }
    }
    servers
}

fn write_config(config: &ToolConfig) -> anyhow::Result<ToolConfigFile> {
    let mut file = NamedTempFile::with_prefix("nightshift_tools_")
        .context("failed to create tool config temp file")?;
    let data = serde_json::to_vec_pretty(config)?;
    file.write_all(&data).context("failed to write tool config")?;
    Ok(ToolConfigFile {
        path: file.into_temp_path(),
    })
}
