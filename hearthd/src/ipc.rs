//! Filesystem IPC watcher.
//!
//! Polls `{data}/ipc/{folder}/{messages,tasks}/` for commands written by
//! sandboxes. Each file is consumed (deleted) after a successful dispatch or
//! moved to `{folder}/errors/` when it fails validation or authorization.
//!
//! Authorization model:
//! - The acting group is the namespace directory, never a payload field.
//! - The primary group may message any registered chat and manage any task.
//! - Other groups may only message, schedule for, and manage their own group.
//! - `register_group` and `refresh_groups` are primary-only.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use futures::future::BoxFuture;
use hearth_core::ipc::{IpcChannel, IpcCommand};
use hearth_core::model::{ContextMode, NewMessage, RegisteredGroup, ScheduledTask, TaskStatus, now_ts};
use hearth_core::store::Store;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::mailbox::{self, IpcLayout};
use crate::registry::{GroupRegistry, Registration};
use crate::sandbox::{HostPaths, prepare_group_dirs};
use crate::schedule::{self, ScheduleError};

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("unreadable ipc file: {0}")]
    Read(String),
    #[error("malformed ipc payload: {0}")]
    Parse(String),
    #[error("{kind} is not accepted in {dir}/")]
    WrongChannel { kind: &'static str, dir: &'static str },
    #[error("namespace {0:?} is not a registered group")]
    UnknownNamespace(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

impl IpcError {
    fn dispatch(err: anyhow::Error) -> Self {
        Self::Dispatch(format!("{err:#}"))
    }
}

/// Host actions an IPC command can trigger outside the store.
pub trait IpcDelegate: Send + Sync {
    /// Delivers an agent-authored message to a chat.
    fn send_message<'a>(&'a self, chat_jid: &'a str, text: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;
}

#[derive(Debug, Clone)]
pub struct IpcWatcherConfig {
    pub poll_interval: Duration,
    /// Zone for cron expressions and local `once` timestamps.
    pub timezone: Tz,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub consumed: usize,
    pub quarantined: usize,
}

pub struct IpcWatcher {
    config: IpcWatcherConfig,
    layout: IpcLayout,
    paths: HostPaths,
    store: Store,
    registry: Arc<GroupRegistry>,
    delegate: Arc<dyn IpcDelegate>,
}

impl IpcWatcher {
    pub fn new(
        config: IpcWatcherConfig,
        paths: HostPaths,
        store: Store,
        registry: Arc<GroupRegistry>,
        delegate: Arc<dyn IpcDelegate>,
    ) -> Self {
        Self {
            config,
            layout: IpcLayout::new(&paths.data_dir),
            paths,
            store,
            registry,
            delegate,
        }
    }

    /// Polling loop; returns when `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = fs::create_dir_all(self.layout.base()) {
            error!(dir = %self.layout.base().display(), error = %err, "failed to create ipc base directory");
        }
        info!(
            dir = %self.layout.base().display(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "ipc watcher started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("ipc watcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over every namespace: lexical namespace order, `messages/`
    /// before `tasks/`, lexical filename order within each.
    pub async fn poll_once(&self) -> PollStats {
        let mut stats = PollStats::default();
        let namespaces = match self.layout.list_namespaces() {
            Ok(namespaces) => namespaces,
            Err(err) => {
                debug!(error = %err, "ipc base directory not readable");
                return stats;
            }
        };

        for namespace in namespaces {
            for channel in [IpcChannel::Messages, IpcChannel::Tasks] {
                let dir = self.layout.channel_dir(&namespace, channel);
                let files = match mailbox::read_json_files(&dir) {
                    Ok(files) => files,
                    Err(err) => {
                        warn!(group = %namespace, dir = %dir.display(), error = %err, "failed to list ipc directory");
                        continue;
                    }
                };
                for file in files {
                    match self.process_file(&namespace, channel, &file).await {
                        Ok(kind) => {
                            debug!(group = %namespace, kind, "ipc command processed");
                            if let Err(err) = fs::remove_file(&file) {
                                warn!(file = %file.display(), error = %err, "failed to remove processed ipc file");
                            }
                            stats.consumed += 1;
                        }
                        Err(err) => {
                            warn!(group = %namespace, file = %file.display(), error = %err, "ipc command rejected");
                            if let Err(qerr) = mailbox::quarantine(&self.layout, &namespace, &file, &err.to_string()) {
                                error!(file = %file.display(), error = %qerr, "failed to quarantine ipc file");
                            }
                            stats.quarantined += 1;
                        }
                    }
                }
            }
        }

        if stats.consumed + stats.quarantined > 0 {
            debug!(consumed = stats.consumed, quarantined = stats.quarantined, "ipc poll complete");
        }
        stats
    }

    async fn process_file(
        &self,
        namespace: &str,
        channel: IpcChannel,
        file: &Path,
    ) -> Result<&'static str, IpcError> {
        let raw = fs::read_to_string(file).map_err(|err| IpcError::Read(err.to_string()))?;
        let command: IpcCommand =
            serde_json::from_str(&raw).map_err(|err| IpcError::Parse(err.to_string()))?;
        if command.expected_channel() != channel {
            return Err(IpcError::WrongChannel {
                kind: command.kind(),
                dir: channel.dir_name(),
            });
        }
        let actor = self
            .registry
            .by_folder(namespace)
            .ok_or_else(|| IpcError::UnknownNamespace(namespace.to_string()))?;
        let kind = command.kind();
        self.dispatch(&actor, command).await?;
        Ok(kind)
    }

    async fn dispatch(&self, actor: &RegisteredGroup, command: IpcCommand) -> Result<(), IpcError> {
        match command {
            IpcCommand::Message { chat_jid, text, sender } => {
                let target = self.authorized_target(actor, &chat_jid)?;
                if text.trim().is_empty() {
                    return Err(IpcError::Invalid("message text is empty".to_string()));
                }
                self.delegate
                    .send_message(&target.jid, &text)
                    .await
                    .map_err(IpcError::dispatch)?;
                let sender_name = sender
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| actor.folder.clone());
                let record = NewMessage {
                    id: format!(
                        "ipc-{}-{:08x}",
                        Utc::now().timestamp_millis(),
                        mailbox::unique_suffix()
                    ),
                    chat_jid: target.jid.clone(),
                    sender: format!("ipc:{}", actor.folder),
                    sender_name,
                    content: text,
                    timestamp: now_ts(),
                    is_from_me: true,
                    is_bot_message: true,
                };
                // Already delivered; a store failure must not redeliver it.
                if let Err(err) = self.store.store_message(&record) {
                    warn!(chat_jid = %target.jid, err = %err, "failed to store ipc message");
                }
                info!(chat_jid = %target.jid, group = %actor.folder, "ipc message sent");
                Ok(())
            }
            IpcCommand::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                target_jid,
            } => {
                let target_jid = target_jid.unwrap_or_else(|| actor.jid.clone());
                let target = self.authorized_target(actor, &target_jid)?;
                self.schedule_task(&target, prompt, &schedule_type, schedule_value, context_mode)
            }
            IpcCommand::PauseTask { task_id } => self.set_task_state(actor, &task_id, TaskStatus::Paused),
            IpcCommand::ResumeTask { task_id } => self.set_task_state(actor, &task_id, TaskStatus::Active),
            IpcCommand::CancelTask { task_id } => {
                self.set_task_state(actor, &task_id, TaskStatus::Cancelled)
            }
            IpcCommand::RegisterGroup {
                jid,
                name,
                folder,
                trigger,
                sandbox,
            } => {
                require_primary(actor, "register_group")?;
                let group = self
                    .registry
                    .register(
                        &self.store,
                        Registration {
                            jid,
                            name,
                            folder,
                            trigger,
                            sandbox,
                            is_primary: false,
                        },
                    )
                    .map_err(|err| IpcError::Invalid(err.to_string()))?;
                prepare_group_dirs(&self.paths, &group.folder).map_err(IpcError::dispatch)?;
                Ok(())
            }
            IpcCommand::RefreshGroups => {
                require_primary(actor, "refresh_groups")?;
                let count = self.registry.reload(&self.store).map_err(IpcError::dispatch)?;
                let tasks = self.store.get_all_tasks().map_err(IpcError::dispatch)?;
                let primary = self.registry.by_folder(&actor.folder).unwrap_or_else(|| actor.clone());
                mailbox::write_snapshots(&self.layout, &primary, &tasks, &self.registry.all())
                    .map_err(IpcError::dispatch)?;
                info!(count, "group registry refreshed");
                Ok(())
            }
        }
    }

    /// The registered group behind `jid`, if `actor` may act on it.
    fn authorized_target(&self, actor: &RegisteredGroup, jid: &str) -> Result<RegisteredGroup, IpcError> {
        let target = self
            .registry
            .get(jid)
            .ok_or_else(|| IpcError::Unauthorized(format!("{jid} is not a registered chat")))?;
        if !actor.is_primary && target.folder != actor.folder {
            return Err(IpcError::Unauthorized(format!(
                "{} may not act on {jid}",
                actor.folder
            )));
        }
        Ok(target)
    }

    fn schedule_task(
        &self,
        target: &RegisteredGroup,
        prompt: String,
        schedule_type: &str,
        schedule_value: String,
        context_mode: ContextMode,
    ) -> Result<(), IpcError> {
        if prompt.trim().is_empty() {
            return Err(IpcError::Invalid("task prompt is empty".to_string()));
        }
        let kind = schedule::parse_kind(schedule_type)?;
        let tz = self.config.timezone;
        schedule::validate(kind, &schedule_value, tz)?;
        let next_run = schedule::initial_next_run(kind, &schedule_value, tz, Utc::now())?;

        let task = ScheduledTask {
            id: new_task_id(),
            group_folder: target.folder.clone(),
            chat_jid: target.jid.clone(),
            prompt,
            schedule_type: kind,
            schedule_value,
            context_mode,
            next_run,
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: now_ts(),
        };
        self.store.create_task(&task).map_err(IpcError::dispatch)?;
        info!(
            task_id = %task.id,
            group = %task.group_folder,
            schedule_type = %kind,
            next_run = ?task.next_run,
            "task scheduled via ipc"
        );
        Ok(())
    }

    fn set_task_state(&self, actor: &RegisteredGroup, task_id: &str, status: TaskStatus) -> Result<(), IpcError> {
        let task = self
            .store
            .get_task_by_id(task_id)
            .map_err(IpcError::dispatch)?
            .ok_or_else(|| IpcError::Invalid(format!("no task {task_id}")))?;
        if !actor.is_primary && task.group_folder != actor.folder {
            return Err(IpcError::Unauthorized(format!(
                "{} may not manage task {task_id}",
                actor.folder
            )));
        }
        if matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled) {
            return Err(IpcError::Invalid(format!("task {task_id} is already {}", task.status)));
        }

        if status == TaskStatus::Active {
            let next_run = schedule::resumed_next_run(
                task.schedule_type,
                &task.schedule_value,
                task.next_run.as_deref(),
                self.config.timezone,
                Utc::now(),
            )?;
            self.store
                .set_task_next_run(task_id, next_run.as_deref())
                .map_err(IpcError::dispatch)?;
        }
        self.store
            .set_task_status(task_id, status)
            .map_err(IpcError::dispatch)?;
        info!(task_id, group = %actor.folder, status = %status, "task status changed via ipc");
        Ok(())
    }
}

fn require_primary(actor: &RegisteredGroup, kind: &str) -> Result<(), IpcError> {
    if actor.is_primary {
        Ok(())
    } else {
        Err(IpcError::Unauthorized(format!("{kind} is restricted to the primary group")))
    }
}

fn new_task_id() -> String {
    format!(
        "task-{}-{:08x}",
        Utc::now().timestamp_millis(),
        mailbox::unique_suffix()
    )
}
