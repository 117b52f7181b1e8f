use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::model::SandboxConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HearthConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub sandbox: SandboxSettings,
    pub ipc: IpcConfig,
    pub scheduler: SchedulerConfig,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7340".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding messages, groups, tasks, sessions and cursors.
    pub database_path: String,
    pub groups_dir: String,
    /// Root for IPC namespaces and per-group session state.
    pub data_dir: String,
    /// Project root mounted read-only into the primary group's sandbox.
    /// Defaults to the working directory when unset.
    pub project_root: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "store/hearth.db".to_string(),
            groups_dir: "groups".to_string(),
            data_dir: "data".to_string(),
            project_root: None,
        }
    }
}

impl StorageConfig {
    pub fn resolve_project_root(&self) -> anyhow::Result<PathBuf> {
        match &self.project_root {
            Some(root) => Ok(PathBuf::from(root)),
            None => std::env::current_dir().context("failed to resolve current working directory"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Run the message loop, queue, IPC watcher and sandbox dispatch.
    /// When false only the HTTP surface is served.
    pub enabled: bool,
    pub assistant_name: String,
    /// Global ceiling on simultaneously live sandboxes.
    pub max_concurrent_sandboxes: usize,
    pub poll_interval_ms: u64,
    /// Quiet period after the last result before an interactive sandbox is closed.
    pub idle_timeout_ms: u64,
    pub main_group_folder: String,
    /// Prefix outbound text with `{assistant_name}: `.
    pub prefix_assistant_name: bool,
    pub primary_group: Option<PrimaryGroupBootstrap>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            assistant_name: "Hearth".to_string(),
            max_concurrent_sandboxes: 5,
            poll_interval_ms: 2000,
            idle_timeout_ms: 1_800_000,
            main_group_folder: "main".to_string(),
            prefix_assistant_name: false,
            primary_group: None,
        }
    }
}

/// Registers the primary group at startup when the store has none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryGroupBootstrap {
    pub jid: String,
    pub name: String,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub runtime_bin: String,
    pub image: String,
    /// Instance name prefix. Orphan cleanup removes everything matching `{prefix}-`.
    pub name_prefix: String,
    pub timeout_ms: u64,
    /// Wait between graceful stop and hard kill.
    pub kill_grace_ms: u64,
    /// Mount allowlist path. Defaults to `~/.config/hearth/mount-allowlist.json`.
    pub allowlist_path: Option<String>,
    /// Keys read from the project `.env` and handed to the sandbox over stdin.
    pub secret_keys: Vec<String>,
    pub timezone: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            runtime_bin: "docker".to_string(),
            image: "hearth-agent:latest".to_string(),
            name_prefix: "hearth".to_string(),
            timeout_ms: 1_800_000,
            kill_grace_ms: 15_000,
            allowlist_path: None,
            secret_keys: vec![
                "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
                "ANTHROPIC_API_KEY".to_string(),
            ],
            timezone: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub poll_interval_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// IANA timezone used for cron expressions and local `once` timestamps.
    pub timezone: String,
    /// Delay between a task's first result and its close sentinel.
    pub task_close_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 60_000,
            timezone: String::new(),
            task_close_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChannelConfig {
    pub http: HttpBridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBridgeConfig {
    pub enabled: bool,
    /// Outbound messages and typing updates are POSTed here.
    pub outbound_url: String,
    /// Addresses this bridge owns, e.g. `http:` matches `http:team-chat`.
    pub address_prefix: String,
    pub request_timeout_ms: u64,
}

impl Default for HttpBridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            outbound_url: "http://127.0.0.1:7341/outbound".to_string(),
            address_prefix: "http:".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<HearthConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(HearthConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: HearthConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

impl HearthConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(bind) = non_empty_env("HEARTHD_BIND") {
            self.server.bind = bind;
        }

        if let Some(path) = non_empty_env("HEARTH_DATABASE_PATH") {
            self.storage.database_path = path;
        }

        if let Some(name) = non_empty_env("ASSISTANT_NAME") {
            self.orchestrator.assistant_name = name;
        }

        if let Some(url) = non_empty_env("HEARTH_BRIDGE_URL") {
            self.channel.http.outbound_url = url;
            self.channel.http.enabled = true;
        }

        let host_tz = non_empty_env("TZ").unwrap_or_else(|| "UTC".to_string());
        if self.scheduler.timezone.trim().is_empty() {
            self.scheduler.timezone = host_tz.clone();
        }
        if self.sandbox.timezone.trim().is_empty() {
            self.sandbox.timezone = host_tz;
        }

        self
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_ceiling() {
        let cfg = HearthConfig::default();
        assert_eq!(cfg.orchestrator.max_concurrent_sandboxes, 5);
        assert_eq!(cfg.scheduler.poll_interval_ms, 60_000);
        assert_eq!(cfg.ipc.poll_interval_ms, 1000);
        assert!(cfg.sandbox.secret_keys.contains(&"ANTHROPIC_API_KEY".to_string()));
    }

    #[test]
    fn parse_toml_uses_defaults_for_missing_fields() {
        let parsed: HearthConfig = toml::from_str(
            r#"
            [server]
            bind = "127.0.0.1:9999"

            [orchestrator]
            max_concurrent_sandboxes = 2

            [orchestrator.primary_group]
            jid = "http:owner"
            name = "Owner"

            [orchestrator.primary_group.sandbox]
            timeout_ms = 900000
            additional_mounts = [{ host_path = "~/projects", readonly = false }]
            "#,
        )
        .expect("parse toml");

        assert_eq!(parsed.server.bind, "127.0.0.1:9999");
        assert_eq!(parsed.orchestrator.max_concurrent_sandboxes, 2);
        assert_eq!(parsed.orchestrator.poll_interval_ms, 2000);
        assert_eq!(parsed.sandbox.runtime_bin, "docker");
        let primary = parsed.orchestrator.primary_group.expect("primary group");
        assert_eq!(primary.jid, "http:owner");
        assert_eq!(primary.sandbox.timeout_ms, Some(900_000));
        assert_eq!(primary.sandbox.additional_mounts[0].host_path, "~/projects");
        assert!(!primary.sandbox.additional_mounts[0].readonly);
    }

    #[test]
    fn missing_file_yields_defaults_with_timezone_filled() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(dir.path().join("absent.toml")).unwrap();
        assert!(!cfg.scheduler.timezone.is_empty());
        assert!(!cfg.sandbox.timezone.is_empty());
    }

    #[test]
    fn explicit_project_root_wins() {
        let storage = StorageConfig {
            project_root: Some("/srv/hearth".to_string()),
            ..StorageConfig::default()
        };
        assert_eq!(
            storage.resolve_project_root().unwrap(),
            PathBuf::from("/srv/hearth")
        );
    }
}
