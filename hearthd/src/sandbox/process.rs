//! Process seam between the runner and the container runtime.
//!
//! `SandboxSpawner` is everything the runner needs from a runtime: spawn an
//! instance with piped stdio, stop it, list and remove leftovers. `DockerSpawner`
//! drives the `docker` CLI through `tokio::process`.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, bail};
use futures::future::BoxFuture;
use hearth_core::protocol::VolumeMount;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Everything needed to start one sandbox instance. Never carries secrets.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub instance_name: String,
    pub image: String,
    pub mounts: Vec<VolumeMount>,
    pub timezone: String,
}

/// Exit and kill control for a spawned instance.
pub trait ProcessHandle: Send {
    /// Resolves when the process exits. `None` when killed by a signal.
    fn wait(&mut self) -> BoxFuture<'_, std::io::Result<Option<i32>>>;
    fn kill(&mut self) -> BoxFuture<'_, std::io::Result<()>>;
}

pub struct SandboxProcess {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub handle: Box<dyn ProcessHandle>,
}

pub trait SandboxSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<SandboxProcess>;

    /// Graceful stop, escalating inside the runtime after `grace`.
    fn terminate<'a>(&'a self, instance_name: &'a str, grace: Duration) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Instance names (running or stopped) that start with `{prefix}-`.
    fn list_instances<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<String>>>;

    fn force_remove<'a>(&'a self, instance_name: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    fn check_available(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

// ---------------------------------------------------------------------------
// Docker
// ---------------------------------------------------------------------------

pub struct DockerSpawner {
    runtime_bin: String,
}

impl DockerSpawner {
    pub fn new(runtime_bin: impl Into<String>) -> Self {
        Self {
            runtime_bin: runtime_bin.into(),
        }
    }

    async fn run_cli(&self, args: &[&str]) -> anyhow::Result<std::process::Output> {
        Command::new(&self.runtime_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to execute {} {}", self.runtime_bin, args.join(" ")))
    }
}

struct DockerChild {
    child: Child,
}

impl ProcessHandle for DockerChild {
    fn wait(&mut self) -> BoxFuture<'_, std::io::Result<Option<i32>>> {
        Box::pin(async move { self.child.wait().await.map(|status| status.code()) })
    }

    fn kill(&mut self) -> BoxFuture<'_, std::io::Result<()>> {
        Box::pin(async move { self.child.kill().await })
    }
}

impl SandboxSpawner for DockerSpawner {
    fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<SandboxProcess> {
        let args = build_sandbox_args(request, host_user());
        debug!(
            instance = %request.instance_name,
            mount_count = request.mounts.len(),
            "starting container"
        );

        let mut child = Command::new(&self.runtime_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.runtime_bin))?;

        let stdin = child.stdin.take().context("container stdin not piped")?;
        let stdout = child.stdout.take().context("container stdout not piped")?;
        let stderr = child.stderr.take().context("container stderr not piped")?;

        Ok(SandboxProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            handle: Box::new(DockerChild { child }),
        })
    }

    fn terminate<'a>(&'a self, instance_name: &'a str, grace: Duration) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let grace_secs = grace.as_secs().max(1).to_string();
            let output = self.run_cli(&["stop", "-t", &grace_secs, instance_name]).await?;
            if !output.status.success() {
                bail!(
                    "{} stop {} failed: {}",
                    self.runtime_bin,
                    instance_name,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            info!(instance = instance_name, "container stopped");
            Ok(())
        })
    }

    fn list_instances<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<String>>> {
        Box::pin(async move {
            let filter = format!("name={prefix}-");
            let output = self
                .run_cli(&["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"])
                .await?;
            if !output.status.success() {
                bail!(
                    "{} ps failed: {}",
                    self.runtime_bin,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(parse_instance_names(&String::from_utf8_lossy(&output.stdout), prefix))
        })
    }

    fn force_remove<'a>(&'a self, instance_name: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let output = self.run_cli(&["rm", "-f", instance_name]).await?;
            if !output.status.success() {
                warn!(
                    instance = instance_name,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "failed to remove container"
                );
            }
            Ok(())
        })
    }

    fn check_available(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let output = self
                .run_cli(&["info"])
                .await
                .context("container runtime not found")?;
            if !output.status.success() {
                bail!("container runtime is not running; ensure {} is installed and started", self.runtime_bin);
            }
            debug!("container runtime available");
            Ok(())
        })
    }
}

/// `docker ps --filter name=` is a substring match; keep only true prefix hits.
fn parse_instance_names(stdout: &str, prefix: &str) -> Vec<String> {
    let wanted = format!("{prefix}-");
    stdout
        .lines()
        .map(str::trim)
        .filter(|name| name.starts_with(&wanted))
        .map(str::to_string)
        .collect()
}

/// Host uid/gid to run as, skipped for root and the image's default user.
fn host_user() -> Option<(u32, u32)> {
    // SAFETY: getuid/getgid have no preconditions and cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    if uid == 0 || uid == 1000 {
        None
    } else {
        Some((uid, gid))
    }
}

/// `run -i --rm --name N -e TZ=... [--user uid:gid -e HOME=/home/node] -v ... image`
pub fn build_sandbox_args(request: &SpawnRequest, user: Option<(u32, u32)>) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-i".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        request.instance_name.clone(),
        "-e".to_string(),
        format!("TZ={}", request.timezone),
    ];

    if let Some((uid, gid)) = user {
        args.push("--user".to_string());
        args.push(format!("{uid}:{gid}"));
        args.push("-e".to_string());
        args.push("HOME=/home/node".to_string());
    }

    for mount in &request.mounts {
        args.push("-v".to_string());
        args.push(mount.to_volume_arg());
    }

    args.push(request.image.clone());
    args
}
