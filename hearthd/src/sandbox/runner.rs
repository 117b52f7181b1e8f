//! Sandbox runner: plans mounts, spawns an instance, delivers input over
//! stdin, streams result frames and enforces the activity deadline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use hearth_core::config::HearthConfig;
use hearth_core::model::RegisteredGroup;
use hearth_core::protocol::{
    OUTPUT_START_MARKER, OutputStatus, SandboxInput, SandboxOutput, VolumeMount,
    extract_output_frames, parse_output_frame,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::mounts::{HostPaths, MountPlan, instance_name, plan_mounts, prepare_group_dirs};
use super::policy::{MountAllowlist, MountError, default_allowlist_path, load_allowlist};
use super::process::{SandboxSpawner, SpawnRequest};
use super::secrets::SecretBundle;

/// Per-stream capture limit for run logs.
const MAX_OUTPUT_SIZE: usize = 1_048_576;

/// Extra time past the idle timeout before the hard deadline fires.
const IDLE_GRACE: Duration = Duration::from_secs(30);

const STDERR_TAIL_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("mount validation failed: {0}")]
    Validation(#[from] MountError),
    #[error("failed to start sandbox: {0}")]
    Spawn(String),
    #[error("sandbox timed out after {0:?} without output")]
    Timeout(Duration),
    #[error("sandbox exited with code {code:?}")]
    Exited {
        code: Option<i32>,
        stderr_tail: String,
    },
    #[error("sandbox protocol error: {0}")]
    Protocol(String),
    #[error("sandbox i/o error: {0}")]
    Io(String),
}

pub struct RunnerConfig {
    pub paths: HostPaths,
    pub image: String,
    pub name_prefix: String,
    pub timezone: String,
    pub assistant_name: String,
    pub timeout: Duration,
    pub idle_timeout: Duration,
    pub kill_grace: Duration,
    pub secret_keys: Vec<String>,
    pub allowlist: Option<MountAllowlist>,
}

impl RunnerConfig {
    pub fn from_config(config: &HearthConfig) -> anyhow::Result<Self> {
        let allowlist_path = config
            .sandbox
            .allowlist_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_allowlist_path);
        Ok(Self {
            paths: HostPaths {
                project_root: config.storage.resolve_project_root()?,
                groups_dir: config.storage.groups_dir.clone().into(),
                data_dir: config.storage.data_dir.clone().into(),
            },
            image: config.sandbox.image.clone(),
            name_prefix: config.sandbox.name_prefix.clone(),
            timezone: config.sandbox.timezone.clone(),
            assistant_name: config.orchestrator.assistant_name.clone(),
            timeout: Duration::from_millis(config.sandbox.timeout_ms),
            idle_timeout: Duration::from_millis(config.orchestrator.idle_timeout_ms),
            kill_grace: Duration::from_millis(config.sandbox.kill_grace_ms),
            secret_keys: config.sandbox.secret_keys.clone(),
            allowlist: load_allowlist(&allowlist_path),
        })
    }
}

/// One request to run the agent.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub prompt: String,
    pub session_id: Option<String>,
    pub chat_jid: String,
    pub is_scheduled_task: bool,
}

/// Identity of a live sandbox, handed to the queue for follow-up routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub name: String,
    pub folder: String,
}

pub type SpawnHook = Box<dyn FnOnce(SandboxHandle) -> BoxFuture<'static, ()> + Send>;
pub type OutputHook = Box<dyn FnMut(SandboxOutput) -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
pub struct RunHooks {
    /// Called once the input payload has been delivered.
    pub on_spawn: Option<SpawnHook>,
    /// Called for every parsed frame, in order, as soon as it arrives.
    pub on_output: Option<OutputHook>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub instance_name: String,
    pub status: OutputStatus,
    pub session_id: Option<String>,
    pub had_output: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

pub struct SandboxRunner {
    spawner: Arc<dyn SandboxSpawner>,
    config: RunnerConfig,
    reconciled: OnceCell<()>,
}

impl SandboxRunner {
    pub fn new(spawner: Arc<dyn SandboxSpawner>, config: RunnerConfig) -> Self {
        Self {
            spawner,
            config,
            reconciled: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub async fn check_available(&self) -> anyhow::Result<()> {
        self.spawner.check_available().await
    }

    /// Removes instances left behind by a previous daemon. Runs at most once.
    pub async fn reconcile_once(&self) {
        self.reconciled
            .get_or_init(|| async {
                let removed = self.reconcile_orphans().await;
                if removed > 0 {
                    info!(count = removed, "removed orphaned sandboxes");
                }
            })
            .await;
    }

    async fn reconcile_orphans(&self) -> usize {
        let names = match self.spawner.list_instances(&self.config.name_prefix).await {
            Ok(names) => names,
            Err(err) => {
                warn!(error = %err, "failed to list orphaned sandboxes");
                return 0;
            }
        };
        let mut removed = 0;
        for name in &names {
            match self.spawner.force_remove(name).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(instance = %name, error = %err, "failed to remove orphaned sandbox"),
            }
        }
        removed
    }

    /// Runs one invocation to completion.
    pub async fn run(
        &self,
        group: &RegisteredGroup,
        invocation: Invocation,
        mut hooks: RunHooks,
    ) -> Result<RunOutcome, SandboxError> {
        self.reconcile_once().await;
        let started = Instant::now();
        let cfg = &self.config;

        let plan = plan_mounts(group, &cfg.paths, cfg.allowlist.as_ref())?;
        prepare_group_dirs(&cfg.paths, &group.folder)
            .map_err(|err| SandboxError::Io(format!("{err:#}")))?;

        let name = instance_name(&cfg.name_prefix, &group.folder);
        let request = SpawnRequest {
            instance_name: name.clone(),
            image: cfg.image.clone(),
            mounts: plan.mounts.clone(),
            timezone: cfg.timezone.clone(),
        };

        info!(
            group = %group.folder,
            instance = %name,
            mount_count = plan.mounts.len(),
            is_primary = group.is_primary,
            scheduled = invocation.is_scheduled_task,
            "spawning sandbox"
        );

        let mut process = self
            .spawner
            .spawn(&request)
            .map_err(|err| SandboxError::Spawn(format!("{err:#}")))?;

        let input = SandboxInput {
            prompt: invocation.prompt,
            session_id: invocation.session_id,
            group_folder: group.folder.clone(),
            chat_jid: invocation.chat_jid,
            is_main: group.is_primary,
            is_scheduled_task: invocation.is_scheduled_task.then_some(true),
            assistant_name: Some(cfg.assistant_name.clone()),
            model: group.sandbox.model.clone(),
            secrets: BTreeMap::new(),
        };
        let secrets = SecretBundle::load(&cfg.paths.project_root, &cfg.secret_keys);
        let delivered = match secrets.into_payload(input) {
            Ok(payload) => {
                let written = process.stdin.write_all(&payload).await;
                drop(payload);
                match written {
                    Ok(()) => process.stdin.shutdown().await,
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(std::io::Error::other(format!("{err:#}"))),
        };
        if let Err(err) = delivered {
            error!(group = %group.folder, instance = %name, error = %err, "failed to deliver sandbox input");
            let _ = process.handle.kill().await;
            return Err(SandboxError::Io(err.to_string()));
        }
        drop(process.stdin);

        if let Some(on_spawn) = hooks.on_spawn.take() {
            on_spawn(SandboxHandle {
                name: name.clone(),
                folder: group.folder.clone(),
            })
            .await;
        }

        let timeout = group
            .sandbox
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(cfg.timeout)
            .max(cfg.idle_timeout + IDLE_GRACE);

        let mut stdout = BufReader::new(process.stdout).lines();
        let mut stderr = BufReader::new(process.stderr).lines();
        let mut stderr_open = true;
        let mut stdout_log = CappedLog::default();
        let mut stderr_log = CappedLog::default();
        let mut frame_buf = String::new();
        let mut deadline = Instant::now() + timeout;
        let mut timed_out = false;
        let mut stream = StreamState::default();

        loop {
            tokio::select! {
                line = stdout.next_line() => match line {
                    Ok(Some(line)) => {
                        stdout_log.push_line(&line);
                        frame_buf.push_str(&line);
                        frame_buf.push('\n');

                        let (bodies, consumed) = extract_output_frames(&frame_buf);
                        frame_buf.drain(..consumed);
                        if !frame_buf.contains(OUTPUT_START_MARKER) {
                            frame_buf.clear();
                        } else if frame_buf.len() > MAX_OUTPUT_SIZE {
                            warn!(group = %group.folder, instance = %name, "unterminated output frame discarded");
                            stream.bad_frames += 1;
                            frame_buf.clear();
                        }

                        for body in bodies {
                            match parse_output_frame(&body) {
                                Ok(frame) => {
                                    deadline = Instant::now() + timeout;
                                    stream.accept(&frame);
                                    if let Some(on_output) = hooks.on_output.as_mut() {
                                        on_output(frame).await;
                                    }
                                }
                                Err(err) => {
                                    warn!(group = %group.folder, instance = %name, error = %err, "malformed output frame");
                                    stream.bad_frames += 1;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(group = %group.folder, instance = %name, error = %err, "error reading sandbox stdout");
                        break;
                    }
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() {
                            debug!(sandbox = %group.folder, "{}", line);
                        }
                        stderr_log.push_line(&line);
                    }
                    _ => stderr_open = false,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
            }
        }

        // Drain what is left of stderr so the exit tail is complete.
        while stderr_open {
            match tokio::time::timeout(Duration::from_millis(200), stderr.next_line()).await {
                Ok(Ok(Some(line))) => stderr_log.push_line(&line),
                _ => stderr_open = false,
            }
        }

        let mut exit_code = None;
        if !timed_out {
            tokio::select! {
                status = process.handle.wait() => {
                    exit_code = status.map_err(|err| SandboxError::Io(err.to_string()))?;
                }
                _ = tokio::time::sleep_until(deadline) => timed_out = true,
            }
        }

        if timed_out {
            error!(group = %group.folder, instance = %name, timeout_ms = timeout.as_millis() as u64, "sandbox deadline reached, stopping");
            exit_code = self.stop(&name, process.handle.as_mut()).await;
        }

        let duration = started.elapsed();
        let summary = RunSummary {
            group: &group.folder,
            instance: &name,
            duration,
            exit_code,
            timed_out,
            had_output: stream.frames > 0,
        };
        write_run_log(
            &cfg.paths.group_dir(&group.folder).join("logs"),
            &summary,
            &plan,
            &stdout_log,
            &stderr_log,
        )
        .await;

        let outcome = RunOutcome {
            instance_name: name.clone(),
            status: stream.last_status.unwrap_or(OutputStatus::Success),
            session_id: stream.session_id.clone(),
            had_output: stream.frames > 0,
            error: stream.last_error.clone(),
            duration,
        };

        if timed_out {
            if stream.frames > 0 {
                info!(group = %group.folder, instance = %name, duration_ms = duration.as_millis() as u64, "sandbox stopped after output (idle cleanup)");
                return Ok(RunOutcome {
                    status: OutputStatus::Success,
                    ..outcome
                });
            }
            return Err(SandboxError::Timeout(timeout));
        }

        match exit_code {
            Some(0) => {}
            Some(125) => {
                return Err(SandboxError::Spawn(format!(
                    "container runtime could not start {name} (exit 125)"
                )));
            }
            code => {
                error!(group = %group.folder, instance = %name, exit_code = ?code, "sandbox exited with error");
                return Err(SandboxError::Exited {
                    code,
                    stderr_tail: stderr_log.tail(STDERR_TAIL_CHARS),
                });
            }
        }

        if stream.frames == 0 {
            let reason = if stream.bad_frames > 0 {
                format!("{} malformed output frame(s) and no valid result", stream.bad_frames)
            } else {
                "sandbox produced no output frames".to_string()
            };
            return Err(SandboxError::Protocol(reason));
        }

        info!(group = %group.folder, instance = %name, duration_ms = duration.as_millis() as u64, frames = stream.frames, "sandbox completed");
        Ok(outcome)
    }

    /// Graceful stop, then a hard kill once the grace window passes.
    async fn stop(&self, name: &str, handle: &mut dyn super::process::ProcessHandle) -> Option<i32> {
        let grace = self.config.kill_grace;
        match tokio::time::timeout(grace + Duration::from_secs(5), self.spawner.terminate(name, grace)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(instance = %name, error = %err, "graceful stop failed"),
            Err(_) => warn!(instance = %name, "graceful stop did not return in time"),
        }
        match tokio::time::timeout(grace, handle.wait()).await {
            Ok(Ok(code)) => code,
            _ => {
                warn!(instance = %name, "sandbox still running after grace window, killing");
                if let Err(err) = handle.kill().await {
                    warn!(instance = %name, error = %err, "kill failed");
                }
                None
            }
        }
    }
}

#[derive(Default)]
struct StreamState {
    frames: usize,
    bad_frames: usize,
    last_status: Option<OutputStatus>,
    last_error: Option<String>,
    session_id: Option<String>,
}

impl StreamState {
    fn accept(&mut self, frame: &SandboxOutput) {
        self.frames += 1;
        self.last_status = Some(frame.status);
        self.last_error = frame.error.clone();
        if let Some(sid) = &frame.session_id {
            self.session_id = Some(sid.clone());
        }
    }
}

#[derive(Default)]
struct CappedLog {
    text: String,
    truncated: bool,
}

impl CappedLog {
    fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        let remaining = MAX_OUTPUT_SIZE.saturating_sub(self.text.len());
        if line.len() + 1 > remaining {
            let mut cut = remaining.min(line.len());
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            self.text.push_str(&line[..cut]);
            self.truncated = true;
        } else {
            self.text.push_str(line);
            self.text.push('\n');
        }
    }

    fn tail(&self, chars: usize) -> String {
        let trimmed = self.text.trim_end();
        let count = trimmed.chars().count();
        trimmed.chars().skip(count.saturating_sub(chars)).collect()
    }
}

struct RunSummary<'a> {
    group: &'a str,
    instance: &'a str,
    duration: Duration,
    exit_code: Option<i32>,
    timed_out: bool,
    had_output: bool,
}

/// Writes `sandbox-{ts}.log`. Mount host paths and stream contents only on error.
async fn write_run_log(
    logs_dir: &Path,
    summary: &RunSummary<'_>,
    plan: &MountPlan,
    stdout: &CappedLog,
    stderr: &CappedLog,
) {
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let log_file = logs_dir.join(format!("sandbox-{timestamp}.log"));
    let is_error = summary.timed_out || summary.exit_code != Some(0);

    let mut lines = vec![
        format!(
            "=== Sandbox Run Log{} ===",
            if summary.timed_out { " (TIMEOUT)" } else { "" }
        ),
        format!("Timestamp: {timestamp}"),
        format!("Group: {}", summary.group),
        format!("Instance: {}", summary.instance),
        format!("Duration: {}ms", summary.duration.as_millis()),
        format!("Exit Code: {:?}", summary.exit_code),
        format!("Had Output: {}", summary.had_output),
        String::new(),
        "=== Mounts ===".to_string(),
    ];

    for m in &plan.mounts {
        lines.push(describe_mount(m, is_error));
    }

    if is_error {
        lines.push(String::new());
        lines.push(format!(
            "=== Stderr{} ===",
            if stderr.truncated { " (TRUNCATED)" } else { "" }
        ));
        lines.push(stderr.text.clone());
        lines.push(format!(
            "=== Stdout{} ===",
            if stdout.truncated { " (TRUNCATED)" } else { "" }
        ));
        lines.push(stdout.text.clone());
    }

    // create_new refuses an existing name, symlinks included.
    let written = async {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&log_file)
            .await?;
        file.write_all(lines.join("\n").as_bytes()).await?;
        file.flush().await
    }
    .await;
    if let Err(err) = written {
        warn!(log_file = %log_file.display(), error = %err, "failed to write sandbox log");
    } else {
        debug!(log_file = %log_file.display(), "sandbox log written");
    }
}

fn describe_mount(m: &VolumeMount, with_host: bool) -> String {
    let ro = if m.readonly { " (ro)" } else { "" };
    if with_host {
        format!("{} -> {}{}", m.host_path, m.container_path, ro)
    } else {
        format!("{}{}", m.container_path, ro)
    }
}
