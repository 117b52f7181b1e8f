//! Conversation dispatch: the callback `GroupQueue` invokes when a group's
//! turn comes up.
//!
//! Flow:
//! 1. Look up the group and fetch its unprocessed batch (bounded by seen)
//! 2. Re-check the trigger
//! 3. Write IPC snapshots, clear any stale close sentinel, set typing
//! 4. Run the sandbox; commit the processed cursor once stdin is delivered
//! 5. Stream results to the channel and store them as bot messages
//! 6. On failure with nothing sent, roll the cursor back and report failure

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use hearth_core::model::{NewMessage, RegisteredGroup, now_ts};
use hearth_core::protocol::{OutputStatus, SandboxOutput};
use hearth_core::store::Store;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::mailbox::{self, IpcLayout};
use crate::message_loop::{Cursors, pending_batch};
use crate::queue::{FailureFn, GroupQueue, ProcessMessagesFn};
use crate::registry::GroupRegistry;
use crate::router::{ChannelRouter, batch_triggers, format_messages, format_outbound};
use crate::sandbox::{Invocation, RunHooks, SandboxHandle, SandboxRunner};

/// Reply sent after a conversation exhausts its retries. Carries no detail.
pub const FAILURE_APOLOGY: &str =
    "Sorry, I ran into a problem and couldn't respond to your last message. Please try again later.";

/// Shared collaborators for conversation and task runs.
#[derive(Clone)]
pub struct RunContext {
    pub store: Store,
    pub queue: GroupQueue,
    pub registry: Arc<GroupRegistry>,
    pub runner: Arc<SandboxRunner>,
    pub router: ChannelRouter,
    pub cursors: Cursors,
    pub layout: IpcLayout,
    pub assistant_name: String,
    pub prefix_assistant_name: bool,
    pub idle_timeout: Duration,
}

impl RunContext {
    /// Refreshes the snapshot files the sandbox reads at startup.
    pub fn write_snapshots(&self, group: &RegisteredGroup) {
        let tasks = match self.store.get_all_tasks() {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(group = %group.folder, err = %err, "failed to load tasks for snapshot");
                Vec::new()
            }
        };
        if let Err(err) = mailbox::write_snapshots(&self.layout, group, &tasks, &self.registry.all()) {
            warn!(group = %group.folder, err = %err, "failed to write ipc snapshots");
        }
    }

    /// Sends an agent result to the chat and records it as a bot message.
    /// Returns whether anything was delivered.
    pub async fn deliver_result(&self, chat_jid: &str, raw: &str) -> bool {
        let prefix = self.prefix_assistant_name.then_some(self.assistant_name.as_str());
        let Some(text) = format_outbound(raw, prefix) else {
            return false;
        };
        if let Err(err) = self.router.send(chat_jid, &text).await {
            error!(chat_jid, err = %err, "failed to send agent output");
            return false;
        }

        let bot_msg = NewMessage {
            id: format!(
                "bot-{}-{:08x}",
                chrono::Utc::now().timestamp_millis(),
                mailbox::unique_suffix()
            ),
            chat_jid: chat_jid.to_string(),
            sender: "bot".to_string(),
            sender_name: self.assistant_name.clone(),
            content: text,
            timestamp: now_ts(),
            is_from_me: true,
            is_bot_message: true,
        };
        if let Err(err) = self.store.store_message(&bot_msg) {
            warn!(chat_jid, err = %err, "failed to store bot response");
        }
        true
    }

    pub fn record_session(&self, folder: &str, session_id: &str) {
        if let Err(err) = self.store.set_session(folder, session_id) {
            warn!(group = folder, err = %err, "failed to persist session");
        }
    }
}

// ---------------------------------------------------------------------------
// Idle timer
// ---------------------------------------------------------------------------

/// Closes a conversation sandbox after a quiet period with no results.
#[derive(Clone, Default)]
pub struct IdleTimer {
    pending: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl IdleTimer {
    /// Restarts the countdown; the previous one is dropped.
    pub fn reset(&self, queue: GroupQueue, jid: String, after: Duration) {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            debug!(group = %jid, "idle timeout, closing sandbox");
            queue.close_stdin(&jid).await;
        });
        let previous = self.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.lock().take() {
            handle.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Queue callbacks
// ---------------------------------------------------------------------------

/// Builds the `ProcessMessagesFn` the queue invokes for conversation runs.
pub fn build_process_messages_fn(ctx: RunContext) -> ProcessMessagesFn {
    Arc::new(move |chat_jid: String| {
        let ctx = ctx.clone();
        Box::pin(async move {
            match process_group_messages(&ctx, &chat_jid).await {
                Ok(success) => success,
                Err(err) => {
                    error!(chat_jid = %chat_jid, err = %err, "message processing failed");
                    false
                }
            }
        })
    })
}

/// Builds the hook the queue fires once a conversation exhausts its retries.
pub fn build_failure_fn(router: ChannelRouter) -> FailureFn {
    Arc::new(move |chat_jid: String| {
        let router = router.clone();
        Box::pin(async move {
            error!(chat_jid = %chat_jid, "giving up on conversation after repeated failures");
            if let Err(err) = router.send(&chat_jid, FAILURE_APOLOGY).await {
                warn!(chat_jid = %chat_jid, err = %err, "failed to send failure notice");
            }
        })
    })
}

/// Runs one conversation turn. `Ok(false)` asks the queue to retry.
pub async fn process_group_messages(ctx: &RunContext, chat_jid: &str) -> anyhow::Result<bool> {
    let Some(group) = ctx.registry.get(chat_jid) else {
        return Ok(true);
    };

    let pending = pending_batch(&ctx.store, &ctx.cursors, chat_jid, &ctx.assistant_name)?;
    if pending.is_empty() || !batch_triggers(&group, &pending) {
        return Ok(true);
    }
    let batch_end = pending
        .last()
        .map(|m| m.timestamp.clone())
        .unwrap_or_default();

    info!(
        group = %group.folder,
        message_count = pending.len(),
        "processing messages"
    );

    ctx.write_snapshots(&group);
    mailbox::clear_close_sentinel(&ctx.layout, &group.folder);
    ctx.router.set_typing(chat_jid, true).await;

    let session_id = ctx.store.get_session(&group.folder).unwrap_or_else(|err| {
        warn!(group = %group.folder, err = %err, "failed to load session");
        None
    });

    let invocation = Invocation {
        prompt: format_messages(&pending),
        session_id,
        chat_jid: chat_jid.to_string(),
        is_scheduled_task: false,
    };

    let previous_cursor: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let output_sent = Arc::new(AtomicBool::new(false));
    let idle = IdleTimer::default();

    let hooks = RunHooks {
        on_spawn: Some({
            let queue = ctx.queue.clone();
            let cursors = ctx.cursors.clone();
            let previous_cursor = previous_cursor.clone();
            let jid = chat_jid.to_string();
            Box::new(move |handle: SandboxHandle| -> BoxFuture<'static, ()> {
                Box::pin(async move {
                    let previous = cursors.commit(&jid, &batch_end);
                    *previous_cursor.lock().unwrap_or_else(PoisonError::into_inner) = Some(previous);
                    queue.register_process(&jid, handle).await;
                })
            })
        }),
        on_output: Some({
            let ctx = ctx.clone();
            let output_sent = output_sent.clone();
            let idle = idle.clone();
            let jid = chat_jid.to_string();
            let folder = group.folder.clone();
            Box::new(move |output: SandboxOutput| -> BoxFuture<'static, ()> {
                let ctx = ctx.clone();
                let output_sent = output_sent.clone();
                let idle = idle.clone();
                let jid = jid.clone();
                let folder = folder.clone();
                Box::pin(async move {
                    if let Some(sid) = &output.session_id {
                        ctx.record_session(&folder, sid);
                    }
                    if let Some(text) = &output.result {
                        if ctx.deliver_result(&jid, text).await {
                            output_sent.store(true, Ordering::SeqCst);
                        }
                    }
                    match output.status {
                        OutputStatus::Success => ctx.queue.notify_idle(&jid).await,
                        OutputStatus::Error => {
                            warn!(group = %folder, error = ?output.error, "agent reported an error")
                        }
                    }
                    idle.reset(ctx.queue.clone(), jid, ctx.idle_timeout);
                })
            })
        }),
    };

    let result = ctx.runner.run(&group, invocation, hooks).await;
    idle.cancel();
    ctx.router.set_typing(chat_jid, false).await;

    let sent = output_sent.load(Ordering::SeqCst);
    let failure = match result {
        Ok(outcome) => {
            if let Some(sid) = &outcome.session_id {
                ctx.record_session(&group.folder, sid);
            }
            if outcome.status == OutputStatus::Success {
                return Ok(true);
            }
            outcome.error.unwrap_or_else(|| "agent reported an error".to_string())
        }
        Err(err) => err.to_string(),
    };

    if sent {
        // Output already reached the chat.
        warn!(group = %group.folder, error = %failure, "run failed after output was sent, not retrying");
        return Ok(true);
    }

    let previous = previous_cursor
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(previous) = previous {
        ctx.cursors.rollback(chat_jid, &previous);
    }
    error!(group = %group.folder, error = %failure, "run failed, cursor rolled back for retry");
    Ok(false)
}
