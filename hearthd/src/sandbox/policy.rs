//! Mount policy: validates additional sandbox mounts against an external allowlist.
//!
//! The allowlist lives outside the project root (`~/.config/hearth/mount-allowlist.json`)
//! so a sandbox can never edit its own security configuration. Every check fails
//! closed: a missing allowlist, a missing path or an unmatched root is an error.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use hearth_core::model::AdditionalMount;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Patterns that are always blocked, merged into every loaded allowlist.
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".gpg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    "credentials",
    ".env",
    ".netrc",
    ".npmrc",
    ".pypirc",
    "id_rsa",
    "id_ed25519",
    "private_key",
    ".secret",
];

/// Folder names reserved by the host layout.
const RESERVED_FOLDERS: &[&str] = &["global", "errors"];

static FOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("folder pattern compiles")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountError {
    #[error("additional mounts requested but no mount allowlist is loaded")]
    AllowlistMissing,
    #[error("invalid group folder {0:?}")]
    InvalidFolder(String),
    #[error("invalid sandbox path {0:?}: must be relative, non-empty and free of '..'")]
    InvalidSandboxPath(String),
    #[error("host path does not exist: {0}")]
    HostPathMissing(String),
    #[error("path {path} matches blocked pattern {pattern:?}")]
    Blocked { path: String, pattern: String },
    #[error("path {0} is not under any allowed root")]
    OutsideAllowedRoots(String),
}

/// External mount allowlist configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountAllowlist {
    #[serde(default)]
    pub allowed_roots: Vec<AllowedRoot>,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub non_main_read_only: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedRoot {
    pub path: String,
    #[serde(default)]
    pub allow_read_write: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Mount that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMount {
    pub host_path: PathBuf,
    /// Absolute path inside the sandbox, always under `/workspace/extra/`.
    pub container_path: String,
    pub readonly: bool,
}

pub fn is_valid_group_folder(folder: &str) -> bool {
    FOLDER_RE.is_match(folder) && !RESERVED_FOLDERS.contains(&folder.to_ascii_lowercase().as_str())
}

pub fn default_allowlist_path() -> PathBuf {
    home_dir().join(".config/hearth/mount-allowlist.json")
}

/// Loads the allowlist and merges in the default blocked patterns.
/// Returns `None` (additional mounts blocked) when the file is missing or unreadable.
pub fn load_allowlist(path: &Path) -> Option<MountAllowlist> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "mount allowlist not found, additional mounts will be rejected"
        );
        return None;
    }

    let parsed = std::fs::read_to_string(path)
        .map_err(|err| err.to_string())
        .and_then(|raw| serde_json::from_str::<MountAllowlist>(&raw).map_err(|err| err.to_string()));

    let mut allowlist = match parsed {
        Ok(a) => a,
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "failed to load mount allowlist, additional mounts will be rejected"
            );
            return None;
        }
    };

    allowlist.blocked_patterns = merge_blocked_patterns(&allowlist.blocked_patterns);

    info!(
        path = %path.display(),
        allowed_roots = allowlist.allowed_roots.len(),
        blocked_patterns = allowlist.blocked_patterns.len(),
        "mount allowlist loaded"
    );
    Some(allowlist)
}

fn merge_blocked_patterns(extra: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = DEFAULT_BLOCKED_PATTERNS.iter().map(|s| s.to_string()).collect();
    for pattern in extra {
        if !merged.contains(pattern) {
            merged.push(pattern.clone());
        }
    }
    merged
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/root".to_string()))
}

fn expand_tilde(p: &str) -> PathBuf {
    if p == "~" {
        home_dir()
    } else if let Some(rest) = p.strip_prefix("~/") {
        home_dir().join(rest)
    } else {
        PathBuf::from(p)
    }
}

fn matches_blocked_pattern(real: &Path, patterns: &[String]) -> Option<String> {
    patterns
        .iter()
        .find(|pattern| {
            real.components()
                .any(|c| c.as_os_str().to_string_lossy().contains(pattern.as_str()))
        })
        .cloned()
}

fn find_allowed_root<'a>(real: &Path, roots: &'a [AllowedRoot]) -> Option<&'a AllowedRoot> {
    roots.iter().find(|root| {
        std::fs::canonicalize(expand_tilde(&root.path))
            .map(|real_root| real.starts_with(real_root))
            .unwrap_or(false)
    })
}

fn is_valid_sandbox_path(p: &str) -> bool {
    !p.trim().is_empty() && !p.starts_with('/') && !p.split('/').any(|part| part == "..")
}

/// Name the mount gets under `/workspace/extra/`. Checked at registration
/// time as well as at spawn.
pub fn sandbox_name(mount: &AdditionalMount) -> Result<String, MountError> {
    let name = match mount.container_path.as_deref() {
        Some(name) => name.to_string(),
        None => Path::new(&mount.host_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string(),
    };
    if !is_valid_sandbox_path(&name) {
        return Err(MountError::InvalidSandboxPath(name));
    }
    Ok(name)
}

/// Validates one additional mount. `is_primary` governs read-write eligibility.
pub fn validate_mount(
    mount: &AdditionalMount,
    is_primary: bool,
    allowlist: &MountAllowlist,
) -> Result<ValidatedMount, MountError> {
    let sandbox_name = sandbox_name(mount)?;
    let expanded = expand_tilde(&mount.host_path);
    let real = std::fs::canonicalize(&expanded)
        .map_err(|_| MountError::HostPathMissing(expanded.display().to_string()))?;

    if let Some(pattern) = matches_blocked_pattern(&real, &allowlist.blocked_patterns) {
        return Err(MountError::Blocked {
            path: real.display().to_string(),
            pattern,
        });
    }

    let root = find_allowed_root(&real, &allowlist.allowed_roots)
        .ok_or_else(|| MountError::OutsideAllowedRoots(real.display().to_string()))?;

    let readonly = if mount.readonly {
        true
    } else if !is_primary && allowlist.non_main_read_only {
        info!(mount = %mount.host_path, "mount downgraded to read-only for non-primary group");
        true
    } else if !root.allow_read_write {
        info!(
            mount = %mount.host_path,
            root = %root.path,
            "mount downgraded to read-only, root does not allow read-write"
        );
        true
    } else {
        false
    };

    Ok(ValidatedMount {
        host_path: real,
        container_path: format!("/workspace/extra/{sandbox_name}"),
        readonly,
    })
}

/// Validates every requested mount. The first failure fails the whole set.
pub fn validate_additional_mounts(
    mounts: &[AdditionalMount],
    group_folder: &str,
    is_primary: bool,
    allowlist: Option<&MountAllowlist>,
) -> Result<Vec<ValidatedMount>, MountError> {
    if mounts.is_empty() {
        return Ok(Vec::new());
    }
    let Some(allowlist) = allowlist else {
        warn!(group = group_folder, count = mounts.len(), "additional mounts rejected, no allowlist loaded");
        return Err(MountError::AllowlistMissing);
    };

    mounts
        .iter()
        .map(|mount| {
            validate_mount(mount, is_primary, allowlist).inspect_err(|err| {
                warn!(
                    group = group_folder,
                    requested_path = %mount.host_path,
                    reason = %err,
                    "additional mount rejected"
                );
            })
        })
        .collect()
}
