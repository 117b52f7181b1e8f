//! Filesystem side of the IPC channel: namespace layout, atomic writes,
//! follow-up input, the close sentinel, quarantine and snapshots.
//!
//! Layout: `{data}/ipc/{folder}/{messages,tasks,input,errors}` plus the
//! `current_tasks.json` / `available_groups.json` snapshots at the namespace root.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use hearth_core::ipc::{
    AVAILABLE_GROUPS_SNAPSHOT, CLOSE_SENTINEL, CURRENT_TASKS_SNAPSHOT, ERRORS_DIR, GroupSnapshot,
    INPUT_DIR, InputMessage, IpcChannel, TaskSnapshot,
};
use hearth_core::model::{RegisteredGroup, ScheduledTask};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct IpcLayout {
    base: PathBuf,
}

impl IpcLayout {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            base: data_dir.as_ref().join("ipc"),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn namespace(&self, folder: &str) -> PathBuf {
        self.base.join(folder)
    }

    pub fn channel_dir(&self, folder: &str, channel: IpcChannel) -> PathBuf {
        self.namespace(folder).join(channel.dir_name())
    }

    pub fn input_dir(&self, folder: &str) -> PathBuf {
        self.namespace(folder).join(INPUT_DIR)
    }

    pub fn errors_dir(&self, folder: &str) -> PathBuf {
        self.namespace(folder).join(ERRORS_DIR)
    }

    /// [`ensure_real_dir`] rooted at the IPC base.
    pub fn ensure_dir(&self, dir: &Path) -> std::io::Result<()> {
        ensure_real_dir(&self.base, dir)
    }

    /// Namespace directory names in lexical order. Missing base yields none.
    pub fn list_namespaces(&self) -> std::io::Result<Vec<String>> {
        let entries = match fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}

static WRITE_SEQ: AtomicU32 = AtomicU32::new(0);

pub(crate) fn unique_suffix() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos ^ WRITE_SEQ.fetch_add(1, Ordering::Relaxed).wrapping_mul(2_654_435_761)
}

/// Creates `dir` and every directory between `root` and it, replacing any
/// symlink found on the way with an empty directory. Everything below `root`
/// may be writable from inside a sandbox, so links there are never followed.
pub fn ensure_real_dir(root: &Path, dir: &Path) -> std::io::Result<()> {
    let rel = dir.strip_prefix(root).map_err(|_| {
        std::io::Error::other(format!("{} is outside {}", dir.display(), root.display()))
    })?;
    fs::create_dir_all(root)?;

    let mut current = root.to_path_buf();
    for component in rel.components() {
        let Component::Normal(part) = component else {
            return Err(std::io::Error::other(format!("unexpected path component in {}", dir.display())));
        };
        current.push(part);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) if meta.file_type().is_symlink() => {
                warn!(path = %current.display(), "replacing symlink in sandbox-writable directory");
                fs::remove_file(&current)?;
                make_dir(&current)?;
            }
            Ok(_) => {
                return Err(std::io::Error::other(format!("{} is not a directory", current.display())));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => make_dir(&current)?,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn make_dir(path: &Path) -> std::io::Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            if fs::symlink_metadata(path)?.is_dir() {
                Ok(())
            } else {
                Err(std::io::Error::other(format!("{} is not a directory", path.display())))
            }
        }
        Err(err) => Err(err),
    }
}

/// Writes via a hidden temp file in the same directory, then renames.
/// Readers only ever see complete files.
pub fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    fs::create_dir_all(parent)?;
    let tmp_path = parent.join(format!(
        ".{}.tmp-{}-{:08x}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("ipc"),
        std::process::id(),
        unique_suffix(),
    ));

    {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)
}

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec_pretty(value).context("encode json")?;
    atomic_write(path, &body).with_context(|| format!("failed to write {}", path.display()))
}

/// Drops a follow-up message into the sandbox's `input/` directory.
pub fn write_input_message(layout: &IpcLayout, folder: &str, text: &str) -> anyhow::Result<PathBuf> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let input_dir = layout.input_dir(folder);
    layout
        .ensure_dir(&input_dir)
        .with_context(|| format!("failed to prepare {}", input_dir.display()))?;
    let path = input_dir.join(format!("{millis}-{:08x}.json", unique_suffix()));
    atomic_write_json(&path, &InputMessage::new(text))?;
    debug!(group = folder, file = %path.display(), "follow-up input written");
    Ok(path)
}

/// Asks the sandbox to end its session.
pub fn write_close_sentinel(layout: &IpcLayout, folder: &str) -> anyhow::Result<()> {
    let input_dir = layout.input_dir(folder);
    layout
        .ensure_dir(&input_dir)
        .with_context(|| format!("failed to prepare {}", input_dir.display()))?;
    let path = input_dir.join(CLOSE_SENTINEL);
    atomic_write(&path, b"").with_context(|| format!("failed to write {}", path.display()))?;
    debug!(group = folder, "close sentinel written");
    Ok(())
}

/// Removes a sentinel left over from a previous sandbox before a new spawn.
pub fn clear_close_sentinel(layout: &IpcLayout, folder: &str) {
    let input_dir = layout.input_dir(folder);
    if let Err(err) = layout.ensure_dir(&input_dir) {
        warn!(group = folder, error = %err, "input directory unusable, sentinel left in place");
        return;
    }
    let path = input_dir.join(CLOSE_SENTINEL);
    match fs::remove_file(&path) {
        Ok(()) => debug!(group = folder, "stale close sentinel removed"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(group = folder, error = %err, "failed to remove stale close sentinel"),
    }
}

/// Regular `.json` files in `dir`, lexical filename order. A missing directory
/// is empty. Symlinks are skipped, and so is `dir` itself when it is one.
pub fn read_json_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            warn!(dir = %dir.display(), "ipc directory is not a real directory, skipping");
            return Ok(Vec::new());
        }
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

/// Moves a rejected IPC file into the namespace's `errors/` directory.
pub fn quarantine(layout: &IpcLayout, folder: &str, file: &Path, reason: &str) -> anyhow::Result<PathBuf> {
    let errors_dir = layout.errors_dir(folder);
    layout
        .ensure_dir(&errors_dir)
        .with_context(|| format!("failed to create {}", errors_dir.display()))?;
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed.json");
    let mut target = errors_dir.join(name);
    if target.exists() {
        target = errors_dir.join(format!("{:08x}-{name}", unique_suffix()));
    }
    fs::rename(file, &target)
        .with_context(|| format!("failed to quarantine {}", file.display()))?;
    warn!(group = folder, file = name, reason, "ipc file quarantined");
    Ok(target)
}

/// Writes the task and group snapshots a sandbox reads at startup.
/// Non-primary namespaces see only their own tasks and no groups.
pub fn write_snapshots(
    layout: &IpcLayout,
    group: &RegisteredGroup,
    tasks: &[ScheduledTask],
    groups: &[RegisteredGroup],
) -> anyhow::Result<()> {
    let ns = layout.namespace(&group.folder);
    layout
        .ensure_dir(&ns)
        .with_context(|| format!("failed to prepare {}", ns.display()))?;

    let visible_tasks: Vec<TaskSnapshot> = tasks
        .iter()
        .filter(|t| group.is_primary || t.group_folder == group.folder)
        .map(|t| TaskSnapshot {
            id: t.id.clone(),
            group_folder: t.group_folder.clone(),
            prompt: t.prompt.clone(),
            schedule_type: t.schedule_type.to_string(),
            schedule_value: t.schedule_value.clone(),
            status: t.status.to_string(),
            next_run: t.next_run.clone(),
        })
        .collect();

    let visible_groups: Vec<GroupSnapshot> = if group.is_primary {
        groups
            .iter()
            .map(|g| GroupSnapshot {
                jid: g.jid.clone(),
                name: g.name.clone(),
                folder: g.folder.clone(),
                is_primary: g.is_primary,
            })
            .collect()
    } else {
        Vec::new()
    };

    atomic_write_json(&ns.join(CURRENT_TASKS_SNAPSHOT), &visible_tasks)?;
    atomic_write_json(&ns.join(AVAILABLE_GROUPS_SNAPSHOT), &visible_groups)?;
    Ok(())
}
