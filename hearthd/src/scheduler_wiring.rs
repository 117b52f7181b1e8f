//! Scheduler to GroupQueue wiring.
//!
//! `build_task_callback` returns the `TaskCallback` the scheduler invokes for
//! each due task. The callback enqueues a `TaskFn` that:
//! 1. Re-checks the task is still active and due
//! 2. Resolves the session from the task's context mode
//! 3. Runs the sandbox with the task prompt and forwards results to the chat
//! 4. Closes the sandbox a short delay after the first result
//! 5. Logs the run and advances `next_run`

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use futures::future::BoxFuture;
use hearth_core::model::{ContextMode, RunStatus, ScheduledTask, TaskRunLog, TaskStatus, now_ts};
use hearth_core::protocol::{OutputStatus, SandboxOutput};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::mailbox;
use crate::process_group::{IdleTimer, RunContext};
use crate::queue::{Dispatch, TaskFn};
use crate::sandbox::{Invocation, RunHooks, SandboxHandle};
use crate::schedule::next_run_after;
use crate::scheduler::{TaskCallback, result_summary};

#[derive(Debug, Clone)]
pub struct TaskRunConfig {
    pub timezone: Tz,
    /// Delay between the first result and the close sentinel.
    pub close_delay: Duration,
}

pub fn build_task_callback(ctx: RunContext, config: TaskRunConfig) -> TaskCallback {
    Arc::new(move |task: ScheduledTask| -> BoxFuture<'static, Dispatch> {
        let ctx = ctx.clone();
        let config = config.clone();
        Box::pin(async move {
            let queue = ctx.queue.clone();
            let task_id = task.id.clone();
            let chat_jid = task.chat_jid.clone();
            let task_fn: TaskFn = Box::new(move || -> BoxFuture<'static, ()> {
                Box::pin(async move { run_scheduled_task(&ctx, &config, &task_id).await })
            });
            queue.enqueue_task(&chat_jid, &task.id, task_fn).await
        })
    })
}

#[derive(Default)]
struct TaskOutput {
    result: Option<String>,
    error: Option<String>,
}

/// Executes one scheduled task inside a sandbox.
pub async fn run_scheduled_task(ctx: &RunContext, config: &TaskRunConfig, task_id: &str) {
    let task = match ctx.store.get_task_by_id(task_id) {
        Ok(Some(task)) => task,
        Ok(None) => {
            debug!(task_id, "task deleted before it ran");
            return;
        }
        Err(err) => {
            error!(task_id, err = %err, "failed to load task");
            return;
        }
    };
    let now = now_ts();
    let due = task.next_run.as_deref().is_some_and(|next| next <= now.as_str());
    if task.status != TaskStatus::Active || !due {
        debug!(task_id, status = %task.status, "task no longer active and due, skipping");
        return;
    }

    let started = Instant::now();
    let Some(group) = ctx.registry.by_folder(&task.group_folder) else {
        error!(task_id, group = %task.group_folder, "scheduled task references unknown group folder");
        finish_task(ctx, config, &task, started, None, Some("unknown group folder"));
        return;
    };

    let session_id = match task.context_mode {
        ContextMode::Group => ctx.store.get_session(&group.folder).unwrap_or_else(|err| {
            warn!(group = %group.folder, err = %err, "failed to load session");
            None
        }),
        ContextMode::Isolated => None,
    };

    ctx.write_snapshots(&group);
    mailbox::clear_close_sentinel(&ctx.layout, &group.folder);

    info!(task_id, group = %group.folder, "running scheduled task");

    let collected: Arc<Mutex<TaskOutput>> = Arc::new(Mutex::new(TaskOutput::default()));
    let closer = IdleTimer::default();

    let hooks = RunHooks {
        on_spawn: Some({
            let queue = ctx.queue.clone();
            let jid = task.chat_jid.clone();
            Box::new(move |handle: SandboxHandle| -> BoxFuture<'static, ()> {
                Box::pin(async move { queue.register_process(&jid, handle).await })
            })
        }),
        on_output: Some({
            let ctx = ctx.clone();
            let collected = collected.clone();
            let closer = closer.clone();
            let jid = task.chat_jid.clone();
            let folder = group.folder.clone();
            let keep_session = task.context_mode == ContextMode::Group;
            let close_delay = config.close_delay;
            let mut close_scheduled = false;
            Box::new(move |output: SandboxOutput| -> BoxFuture<'static, ()> {
                let first_result = output.result.is_some() && !close_scheduled;
                if first_result {
                    close_scheduled = true;
                    closer.reset(ctx.queue.clone(), jid.clone(), close_delay);
                }
                let ctx = ctx.clone();
                let collected = collected.clone();
                let jid = jid.clone();
                let folder = folder.clone();
                Box::pin(async move {
                    if keep_session {
                        if let Some(sid) = &output.session_id {
                            ctx.record_session(&folder, sid);
                        }
                    }
                    if let Some(text) = &output.result {
                        ctx.deliver_result(&jid, text).await;
                    }
                    let mut out = collected.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(text) = output.result {
                        out.result = Some(text);
                    }
                    if output.status == OutputStatus::Error {
                        out.error = Some(output.error.unwrap_or_else(|| "unknown error".to_string()));
                    }
                })
            })
        }),
    };

    let invocation = Invocation {
        prompt: task.prompt.clone(),
        session_id,
        chat_jid: task.chat_jid.clone(),
        is_scheduled_task: true,
    };
    let run = ctx.runner.run(&group, invocation, hooks).await;
    closer.cancel();

    let TaskOutput { result, mut error } =
        std::mem::take(&mut *collected.lock().unwrap_or_else(PoisonError::into_inner));
    match run {
        Ok(outcome) => {
            if task.context_mode == ContextMode::Group {
                if let Some(sid) = &outcome.session_id {
                    ctx.record_session(&group.folder, sid);
                }
            }
            if outcome.status == OutputStatus::Error && error.is_none() {
                error = Some(outcome.error.unwrap_or_else(|| "unknown error".to_string()));
            }
        }
        Err(err) => {
            error!(task_id, err = %err, "task sandbox failed");
            error = Some(err.to_string());
        }
    }

    finish_task(ctx, config, &task, started, result.as_deref(), error.as_deref());
}

/// Appends the run log and advances the schedule.
fn finish_task(
    ctx: &RunContext,
    config: &TaskRunConfig,
    task: &ScheduledTask,
    started: Instant,
    result: Option<&str>,
    error: Option<&str>,
) {
    let duration_ms = started.elapsed().as_millis() as i64;
    let status = if error.is_some() { RunStatus::Error } else { RunStatus::Success };

    let log = TaskRunLog {
        task_id: task.id.clone(),
        run_at: now_ts(),
        duration_ms,
        status: status.clone(),
        result: result.map(str::to_string),
        error: error.map(str::to_string),
    };
    if let Err(err) = ctx.store.log_task_run(&log) {
        error!(task_id = %task.id, err = %err, "failed to log task run");
    }

    let next_run = match next_run_after(task.schedule_type, &task.schedule_value, config.timezone, Utc::now()) {
        Ok(next) => next,
        Err(err) => {
            error!(task_id = %task.id, err = %err, "schedule no longer valid, completing task");
            None
        }
    };
    let summary = result_summary(result, error);
    if let Err(err) = ctx.store.update_task_after_run(&task.id, next_run.as_deref(), &summary) {
        error!(task_id = %task.id, err = %err, "failed to update task after run");
    }

    info!(
        task_id = %task.id,
        status = ?status,
        duration_ms,
        next_run = next_run.as_deref().unwrap_or("none"),
        "scheduled task completed"
    );
}
