//! Volume mount planning for sandbox execution.
//!
//! `plan_mounts` is pure: it decides the bindings or refuses. Creating the
//! directories those bindings point at is `prepare_group_dirs`, run afterwards.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use hearth_core::ipc::{ERRORS_DIR, INPUT_DIR, MESSAGES_DIR, TASKS_DIR};
use hearth_core::model::RegisteredGroup;
use hearth_core::protocol::VolumeMount;

use crate::mailbox::ensure_real_dir;

use super::policy::{MountAllowlist, MountError, is_valid_group_folder, validate_additional_mounts};

/// Host directories the planner maps into a sandbox.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub project_root: PathBuf,
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl HostPaths {
    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.groups_dir.join(folder)
    }

    pub fn global_dir(&self) -> PathBuf {
        self.groups_dir.join("global")
    }

    pub fn session_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("sessions").join(folder).join(".claude")
    }

    pub fn ipc_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("ipc").join(folder)
    }
}

/// Ordered bindings for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPlan {
    pub mounts: Vec<VolumeMount>,
}

impl MountPlan {
    fn push(&mut self, host: &Path, container: &str, readonly: bool) {
        self.mounts
            .push(VolumeMount::new(host.to_string_lossy(), container, readonly));
    }

    pub fn find(&self, container_path: &str) -> Option<&VolumeMount> {
        self.mounts.iter().find(|m| m.container_path == container_path)
    }
}

/// Mount structure:
/// - Primary only: project root (ro)
/// - All: group folder (rw), global (ro), agent session state (rw), IPC namespace (rw)
/// - Additional mounts from group config, each validated against the allowlist
pub fn plan_mounts(
    group: &RegisteredGroup,
    paths: &HostPaths,
    allowlist: Option<&MountAllowlist>,
) -> Result<MountPlan, MountError> {
    if !is_valid_group_folder(&group.folder) {
        return Err(MountError::InvalidFolder(group.folder.clone()));
    }

    let mut plan = MountPlan::default();

    if group.is_primary {
        plan.push(&paths.project_root, "/workspace/project", true);
    }
    plan.push(&paths.group_dir(&group.folder), "/workspace/group", false);
    plan.push(&paths.global_dir(), "/workspace/global", true);
    plan.push(&paths.session_dir(&group.folder), "/home/node/.claude", false);
    plan.push(&paths.ipc_dir(&group.folder), "/workspace/ipc", false);

    let extra = validate_additional_mounts(
        &group.sandbox.additional_mounts,
        &group.folder,
        group.is_primary,
        allowlist,
    )?;
    for mount in extra {
        plan.push(&mount.host_path, &mount.container_path, mount.readonly);
    }

    Ok(plan)
}

/// Creates the group workspace, shared workspace, session state and IPC namespace.
/// Group, session and IPC trees are writable from inside the sandbox, so
/// symlinks planted there are replaced rather than followed.
pub fn prepare_group_dirs(paths: &HostPaths, folder: &str) -> anyhow::Result<()> {
    let session_dir = paths.session_dir(folder);
    let ipc_dir = paths.ipc_dir(folder);
    let mut dirs = vec![
        (&paths.groups_dir, paths.group_dir(folder).join("logs")),
        (&paths.groups_dir, paths.global_dir()),
        (&paths.data_dir, session_dir.clone()),
    ];
    for sub in [MESSAGES_DIR, TASKS_DIR, INPUT_DIR, ERRORS_DIR] {
        dirs.push((&paths.data_dir, ipc_dir.join(sub)));
    }
    for (root, dir) in &dirs {
        ensure_real_dir(root, dir)
            .with_context(|| format!("failed to create directory: {}", dir.display()))?;
    }

    let settings_file = session_dir.join("settings.json");
    match fs::symlink_metadata(&settings_file) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let defaults = serde_json::json!({
                "env": {
                    "CLAUDE_CODE_ADDITIONAL_DIRECTORIES_CLAUDE_MD": "1",
                    "CLAUDE_CODE_DISABLE_AUTO_MEMORY": "0"
                }
            });
            let body = serde_json::to_string_pretty(&defaults).context("encode agent settings")? + "\n";
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&settings_file)
                .with_context(|| format!("failed to create {}", settings_file.display()))?;
            file.write_all(body.as_bytes())
                .with_context(|| format!("failed to write {}", settings_file.display()))?;
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to inspect {}", settings_file.display()));
        }
    }
    Ok(())
}

/// `{prefix}-{folder}-{millis}` with anything outside `[A-Za-z0-9-]` replaced.
pub fn instance_name(prefix: &str, group_folder: &str) -> String {
    let safe: String = group_folder
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("{}-{}-{}", prefix, safe, chrono::Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::model::{AdditionalMount, SandboxConfig};
    use tempfile::TempDir;

    fn paths(tmp: &TempDir) -> HostPaths {
        HostPaths {
            project_root: tmp.path().join("project"),
            groups_dir: tmp.path().join("groups"),
            data_dir: tmp.path().join("data"),
        }
    }

    fn group(folder: &str, is_primary: bool) -> RegisteredGroup {
        RegisteredGroup {
            jid: format!("http:{folder}"),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger: None,
            added_at: "2026-01-01T00:00:00.000Z".to_string(),
            sandbox: SandboxConfig::default(),
            is_primary,
        }
    }

    #[test]
    fn primary_gets_project_root_read_only() {
        let tmp = TempDir::new().unwrap();
        let plan = plan_mounts(&group("main", true), &paths(&tmp), None).unwrap();

        let project = plan.find("/workspace/project").unwrap();
        assert!(project.readonly);
        assert!(!plan.find("/workspace/group").unwrap().readonly);
        assert!(plan.find("/workspace/global").unwrap().readonly);
        assert!(!plan.find("/workspace/ipc").unwrap().readonly);
        assert_eq!(plan.mounts[0].container_path, "/workspace/project");
    }

    #[test]
    fn non_primary_never_sees_project_root() {
        let tmp = TempDir::new().unwrap();
        let plan = plan_mounts(&group("team", false), &paths(&tmp), None).unwrap();
        assert!(plan.find("/workspace/project").is_none());
        let ipc = plan.find("/workspace/ipc").unwrap();
        assert!(ipc.host_path.ends_with("data/ipc/team"));
        let session = plan.find("/home/node/.claude").unwrap();
        assert!(session.host_path.ends_with("data/sessions/team/.claude"));
    }

    #[test]
    fn planning_has_no_side_effects() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        plan_mounts(&group("team", false), &p, None).unwrap();
        assert!(!p.ipc_dir("team").exists());
    }

    #[test]
    fn extra_mount_without_allowlist_fails_the_plan() {
        let tmp = TempDir::new().unwrap();
        let mut g = group("team", false);
        g.sandbox.additional_mounts.push(AdditionalMount {
            host_path: tmp.path().to_string_lossy().to_string(),
            container_path: Some("x".to_string()),
            readonly: true,
        });
        assert_eq!(
            plan_mounts(&g, &paths(&tmp), None),
            Err(MountError::AllowlistMissing)
        );
    }

    #[test]
    fn invalid_folder_fails_the_plan() {
        let tmp = TempDir::new().unwrap();
        let err = plan_mounts(&group("../escape", false), &paths(&tmp), None).unwrap_err();
        assert!(matches!(err, MountError::InvalidFolder(_)));
    }

    #[test]
    fn prepare_creates_ipc_layout_and_settings() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        prepare_group_dirs(&p, "team").unwrap();
        for sub in ["messages", "tasks", "input", "errors"] {
            assert!(p.ipc_dir("team").join(sub).is_dir(), "{sub}");
        }
        assert!(p.group_dir("team").join("logs").is_dir());
        assert!(p.session_dir("team").join("settings.json").exists());
        prepare_group_dirs(&p, "team").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn prepare_replaces_links_planted_by_a_sandbox() {
        use std::os::unix::fs::symlink;

        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        prepare_group_dirs(&p, "team").unwrap();

        let logs = p.group_dir("team").join("logs");
        fs::remove_dir(&logs).unwrap();
        symlink(&outside, &logs).unwrap();
        let input = p.ipc_dir("team").join("input");
        fs::remove_dir(&input).unwrap();
        symlink(&outside, &input).unwrap();
        let settings = p.session_dir("team").join("settings.json");
        fs::remove_file(&settings).unwrap();
        symlink(outside.join("settings.json"), &settings).unwrap();

        prepare_group_dirs(&p, "team").unwrap();
        assert!(!fs::symlink_metadata(&logs).unwrap().file_type().is_symlink());
        assert!(!fs::symlink_metadata(&input).unwrap().file_type().is_symlink());
        assert!(fs::symlink_metadata(&settings).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_dir(&outside).unwrap().count(), 0);
    }

    #[test]
    fn instance_name_is_sanitized() {
        let name = instance_name("hearth", "team.eng/special");
        assert!(name.starts_with("hearth-team-eng-special-"));
        assert!(!name.contains('.'));
        assert!(!name.contains('/'));
    }
}
