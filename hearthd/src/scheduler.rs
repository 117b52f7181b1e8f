//! Task scheduler: polls the store for due tasks and hands them to a callback
//! that enqueues them on `GroupQueue`.
//!
//! The first poll runs at startup, then every `poll_interval`. Each due row
//! is re-read before dispatch so a task paused or cancelled between the query
//! and the dispatch is skipped. Next-run math lives in `schedule`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use hearth_core::model::{ScheduledTask, TaskStatus, format_ts};
use hearth_core::store::Store;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::queue::Dispatch;

const SUMMARY_MAX_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct SchedulerLoopConfig {
    pub poll_interval: Duration,
}

/// Invoked for each due task. Expected to enqueue the run, not perform it.
pub type TaskCallback = Arc<dyn Fn(ScheduledTask) -> BoxFuture<'static, Dispatch> + Send + Sync>;

/// `last_result` text for a finished run.
pub fn result_summary(result: Option<&str>, error: Option<&str>) -> String {
    match (result, error) {
        (_, Some(err)) => format!("Error: {err}"),
        (Some(text), None) => text.chars().take(SUMMARY_MAX_CHARS).collect(),
        (None, None) => "Completed".to_string(),
    }
}

pub struct Scheduler {
    config: SchedulerLoopConfig,
    store: Store,
    on_task: TaskCallback,
}

impl Scheduler {
    pub fn new(config: SchedulerLoopConfig, store: Store, on_task: TaskCallback) -> Self {
        Self { config, store, on_task }
    }

    /// Polls immediately, then on every interval until shutdown fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "scheduler loop started"
        );

        loop {
            self.poll_once(Utc::now()).await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Dispatches every task due at `now`. Returns how many were handed off.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> usize {
        let due = match self.store.get_due_tasks(&format_ts(now)) {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(err = %err, "failed to query due tasks");
                return 0;
            }
        };
        if !due.is_empty() {
            info!(count = due.len(), "found due tasks");
        }

        let mut dispatched = 0;
        for task in due {
            match self.store.get_task_by_id(&task.id) {
                Ok(Some(current)) if current.status == TaskStatus::Active => {
                    debug!(task_id = %current.id, group = %current.group_folder, "dispatching task");
                    match (self.on_task)(current).await {
                        Dispatch::Ignored => debug!(task_id = %task.id, "task already queued or running"),
                        _ => dispatched += 1,
                    }
                }
                Ok(Some(_)) => debug!(task_id = %task.id, "task no longer active, skipping"),
                Ok(None) => debug!(task_id = %task.id, "task deleted, skipping"),
                Err(err) => error!(task_id = %task.id, err = %err, "failed to re-check task"),
            }
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::model::{ContextMode, ScheduleKind};
    use std::sync::Mutex;

    fn task(id: &str, status: TaskStatus, next_run: Option<&str>) -> ScheduledTask {
        ScheduledTask {
            id: id.into(),
            group_folder: "team".into(),
            chat_jid: "http:team".into(),
            prompt: "report".into(),
            schedule_type: ScheduleKind::Interval,
            schedule_value: "60000".into(),
            context_mode: ContextMode::Isolated,
            next_run: next_run.map(String::from),
            last_run: None,
            last_result: None,
            status,
            created_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    fn recording() -> (TaskCallback, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: TaskCallback = Arc::new(move |t: ScheduledTask| -> BoxFuture<'static, Dispatch> {
            sink.lock().unwrap().push(t.id);
            Box::pin(async { Dispatch::Started })
        });
        (cb, seen)
    }

    #[tokio::test]
    async fn only_active_due_tasks_dispatch() {
        let store = Store::open_in_memory().unwrap();
        store.create_task(&task("due", TaskStatus::Active, Some("2026-05-01T09:00:00.000Z"))).unwrap();
        store.create_task(&task("later", TaskStatus::Active, Some("2026-05-01T11:00:00.000Z"))).unwrap();
        store.create_task(&task("paused", TaskStatus::Paused, Some("2026-05-01T09:00:00.000Z"))).unwrap();
        store.create_task(&task("done", TaskStatus::Completed, None)).unwrap();

        let (cb, seen) = recording();
        let scheduler = Scheduler::new(
            SchedulerLoopConfig { poll_interval: Duration::from_secs(60) },
            store,
            cb,
        );
        let now = DateTime::parse_from_rfc3339("2026-05-01T10:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(scheduler.poll_once(now).await, 1);
        assert_eq!(seen.lock().unwrap().as_slice(), ["due".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_runs_immediately() {
        let store = Store::open_in_memory().unwrap();
        store.create_task(&task("due", TaskStatus::Active, Some("2000-01-01T00:00:00.000Z"))).unwrap();
        let (cb, seen) = recording();
        let scheduler = Arc::new(Scheduler::new(
            SchedulerLoopConfig { poll_interval: Duration::from_secs(3600) },
            store,
            cb,
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn summaries() {
        assert_eq!(result_summary(Some("ok"), None), "ok");
        assert_eq!(result_summary(Some("ok"), Some("boom")), "Error: boom");
        assert_eq!(result_summary(None, None), "Completed");
        assert_eq!(result_summary(Some(&"é".repeat(300)), None).chars().count(), 200);
    }
}
