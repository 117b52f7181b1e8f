//! Per-group serialization queue with a global concurrency ceiling.
//!
//! At most one sandbox runs per group and at most `max_concurrent` overall.
//!
//! - Pending tasks drain before pending messages.
//! - Follow-up messages are piped to an idle-waiting sandbox through its IPC
//!   `input/` directory instead of spawning a second one.
//! - Failed conversation runs are retried with exponential backoff.
//! - Shutdown stops new dispatches; running sandboxes are detached, not killed.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::mailbox::{self, IpcLayout};
use crate::sandbox::SandboxHandle;

/// Processes pending messages for a group. Returns `true` on success.
pub type ProcessMessagesFn = Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

/// One queued scheduled-task run.
pub type TaskFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Called once a conversation has exhausted its retry attempts.
pub type FailureFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPhase {
    #[default]
    Idle,
    Active,
    IdleWaiting,
    Draining,
}

impl SlotPhase {
    pub fn can_become(self, next: SlotPhase) -> bool {
        use SlotPhase::*;
        matches!(
            (self, next),
            (Idle, Active)
                | (Active, IdleWaiting)
                | (Active, Draining)
                | (IdleWaiting, Active)
                | (IdleWaiting, Draining)
                | (Draining, Active)
                | (Draining, Idle)
        )
    }

    fn is_running(self) -> bool {
        matches!(self, SlotPhase::Active | SlotPhase::IdleWaiting)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunKind {
    Conversation,
    Task(String),
}

struct QueuedTask {
    id: String,
    task_fn: TaskFn,
}

#[derive(Default)]
struct GroupSlot {
    phase: SlotPhase,
    run: Option<RunKind>,
    pending_messages: bool,
    pending_tasks: VecDeque<QueuedTask>,
    sandbox: Option<SandboxHandle>,
    close_requested: bool,
    retry_count: u32,
    retry_scheduled: bool,
}

impl GroupSlot {
    fn transition(&mut self, jid: &str, next: SlotPhase) {
        assert!(
            self.phase.can_become(next),
            "illegal slot transition for {jid}: {:?} -> {next:?}",
            self.phase
        );
        self.phase = next;
    }

    fn is_conversation(&self) -> bool {
        self.run == Some(RunKind::Conversation)
    }

    fn has_pending_work(&self) -> bool {
        self.pending_messages || !self.pending_tasks.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub retry_base: Duration,
    /// Total conversation attempts before the failure hook fires.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            retry_base: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

/// Result of an enqueue call. `Deferred` is the normal at-capacity outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Started,
    Deferred,
    Ignored,
}

/// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub active_count: usize,
    pub max_concurrent: usize,
    pub shutting_down: bool,
    pub waiting: Vec<String>,
    pub groups: Vec<SlotSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub jid: String,
    pub phase: SlotPhase,
    pub running_task: Option<String>,
    pub pending_messages: bool,
    pub pending_tasks: usize,
    pub sandbox: Option<String>,
    pub retry_count: u32,
}

enum Completion {
    Conversation { success: bool },
    Task,
}

struct Inner {
    slots: HashMap<String, GroupSlot>,
    active_count: usize,
    waiting: VecDeque<String>,
    config: QueueConfig,
    process_messages: Option<ProcessMessagesFn>,
    on_failure: Option<FailureFn>,
    shutting_down: bool,
    layout: IpcLayout,
}

impl Inner {
    fn at_capacity(&self) -> bool {
        self.active_count >= self.config.max_concurrent
    }

    fn push_waiting(&mut self, jid: &str) {
        if !self.waiting.iter().any(|w| w == jid) {
            self.waiting.push_back(jid.to_string());
        }
    }

    /// Drops a slot once nothing refers to it any more.
    fn prune(&mut self, jid: &str) {
        let removable = self.slots.get(jid).is_some_and(|slot| {
            slot.phase == SlotPhase::Idle && !slot.has_pending_work() && !slot.retry_scheduled
        });
        if removable && !self.waiting.iter().any(|w| w == jid) {
            self.slots.remove(jid);
        }
    }
}

fn request_close(layout: &IpcLayout, jid: &str, slot: &mut GroupSlot) {
    if slot.close_requested {
        return;
    }
    slot.close_requested = true;
    if let Some(handle) = &slot.sandbox {
        if let Err(err) = mailbox::write_close_sentinel(layout, &handle.folder) {
            warn!(group = jid, error = %err, "failed to write close sentinel");
        }
    }
}

/// Cloneable handle; all coordination state sits behind one async mutex.
#[derive(Clone)]
pub struct GroupQueue {
    inner: Arc<Mutex<Inner>>,
}

impl GroupQueue {
    pub fn new(config: QueueConfig, layout: IpcLayout) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slots: HashMap::new(),
                active_count: 0,
                waiting: VecDeque::new(),
                config,
                process_messages: None,
                on_failure: None,
                shutting_down: false,
                layout,
            })),
        }
    }

    pub async fn set_process_messages_fn(&self, f: ProcessMessagesFn) {
        self.inner.lock().await.process_messages = Some(f);
    }

    pub async fn set_failure_fn(&self, f: FailureFn) {
        self.inner.lock().await.on_failure = Some(f);
    }

    /// Requests a message-processing run for a group.
    pub async fn enqueue_message_check(&self, jid: &str) -> Dispatch {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.shutting_down {
            return Dispatch::Ignored;
        }

        let at_capacity = inner.at_capacity();
        let slot = inner.slots.entry(jid.to_string()).or_default();

        if slot.phase != SlotPhase::Idle {
            slot.pending_messages = true;
            debug!(group = jid, phase = ?slot.phase, "sandbox active, message check deferred");
            return Dispatch::Deferred;
        }

        if at_capacity {
            slot.pending_messages = true;
            inner.push_waiting(jid);
            debug!(
                group = jid,
                active_count = inner.active_count,
                "at concurrency limit, message check deferred"
            );
            return Dispatch::Deferred;
        }

        self.launch_conversation(inner, jid);
        Dispatch::Started
    }

    /// Queues a scheduled-task run. Tasks outrank messages when the group drains.
    pub async fn enqueue_task(&self, jid: &str, task_id: &str, task_fn: TaskFn) -> Dispatch {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.shutting_down {
            return Dispatch::Ignored;
        }

        let at_capacity = inner.at_capacity();
        let slot = inner.slots.entry(jid.to_string()).or_default();

        let running_same = slot.run.as_ref() == Some(&RunKind::Task(task_id.to_string()));
        if running_same || slot.pending_tasks.iter().any(|t| t.id == task_id) {
            debug!(group = jid, task_id, "task already queued, skipping");
            return Dispatch::Ignored;
        }

        let task = QueuedTask {
            id: task_id.to_string(),
            task_fn,
        };

        if slot.phase.is_running() {
            slot.pending_tasks.push_back(task);
            if slot.phase == SlotPhase::IdleWaiting && slot.is_conversation() {
                request_close(&inner.layout, jid, slot);
            }
            debug!(group = jid, task_id, "sandbox active, task queued");
            return Dispatch::Deferred;
        }

        if at_capacity {
            slot.pending_tasks.push_back(task);
            inner.push_waiting(jid);
            preempt_idle_conversation(inner, jid);
            debug!(
                group = jid,
                task_id,
                active_count = inner.active_count,
                "at concurrency limit, task queued"
            );
            return Dispatch::Deferred;
        }

        self.launch_task(inner, jid, task);
        Dispatch::Started
    }

    /// Pipes a follow-up message into the group's live conversation sandbox.
    pub async fn send_message(&self, jid: &str, text: &str) -> bool {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(slot) = inner.slots.get_mut(jid) else {
            return false;
        };
        if !slot.phase.is_running() || !slot.is_conversation() || slot.close_requested {
            return false;
        }
        let Some(folder) = slot.sandbox.as_ref().map(|h| h.folder.clone()) else {
            return false;
        };

        match mailbox::write_input_message(&inner.layout, &folder, text) {
            Ok(_) => {
                if slot.phase == SlotPhase::IdleWaiting {
                    slot.transition(jid, SlotPhase::Active);
                }
                debug!(group = jid, "follow-up piped to active sandbox");
                true
            }
            Err(err) => {
                warn!(group = jid, error = %err, "failed to pipe follow-up message");
                false
            }
        }
    }

    /// Marks a conversation sandbox idle-waiting; closes it when other work is waiting.
    pub async fn notify_idle(&self, jid: &str) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let saturated = inner.at_capacity();
        let waiting_has_tasks = inner
            .waiting
            .iter()
            .any(|w| inner.slots.get(w).is_some_and(|s| !s.pending_tasks.is_empty()));

        let Some(slot) = inner.slots.get_mut(jid) else {
            return;
        };
        if !slot.phase.is_running() || !slot.is_conversation() {
            return;
        }
        if slot.phase == SlotPhase::Active {
            slot.transition(jid, SlotPhase::IdleWaiting);
        }

        if !slot.pending_tasks.is_empty() {
            debug!(group = jid, "idle with pending tasks, closing sandbox");
            request_close(&inner.layout, jid, slot);
        } else if saturated && waiting_has_tasks {
            info!(group = jid, "idle at capacity with waiting tasks, closing sandbox");
            request_close(&inner.layout, jid, slot);
        }
    }

    /// Records the live sandbox for a running group.
    pub async fn register_process(&self, jid: &str, handle: SandboxHandle) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(slot) = inner.slots.get_mut(jid) else {
            warn!(group = jid, sandbox = %handle.name, "sandbox registered for unknown group");
            return;
        };
        if slot.close_requested {
            if let Err(err) = mailbox::write_close_sentinel(&inner.layout, &handle.folder) {
                warn!(group = jid, error = %err, "failed to write close sentinel");
            }
        }
        slot.sandbox = Some(handle);
    }

    /// Asks the group's sandbox to wind down.
    pub async fn close_stdin(&self, jid: &str) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if let Some(slot) = inner.slots.get_mut(jid) {
            if slot.phase.is_running() {
                request_close(&inner.layout, jid, slot);
            }
        }
    }

    pub async fn is_active(&self, jid: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.slots.get(jid).is_some_and(|s| s.phase.is_running())
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active_count
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().await;
        let mut groups: Vec<SlotSnapshot> = inner
            .slots
            .iter()
            .map(|(jid, slot)| SlotSnapshot {
                jid: jid.clone(),
                phase: slot.phase,
                running_task: match &slot.run {
                    Some(RunKind::Task(id)) => Some(id.clone()),
                    _ => None,
                },
                pending_messages: slot.pending_messages,
                pending_tasks: slot.pending_tasks.len(),
                sandbox: slot.sandbox.as_ref().map(|h| h.name.clone()),
                retry_count: slot.retry_count,
            })
            .collect();
        groups.sort_by(|a, b| a.jid.cmp(&b.jid));
        QueueSnapshot {
            active_count: inner.active_count,
            max_concurrent: inner.config.max_concurrent,
            shutting_down: inner.shutting_down,
            waiting: inner.waiting.iter().cloned().collect(),
            groups,
        }
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.shutting_down = true;
        let detached: Vec<String> = inner
            .slots
            .values()
            .filter_map(|s| s.sandbox.as_ref().map(|h| h.name.clone()))
            .collect();
        info!(
            active_count = inner.active_count,
            detached = ?detached,
            "group queue shutting down (sandboxes detached, not killed)"
        );
    }

    // -----------------------------------------------------------------------
    // Internal execution
    // -----------------------------------------------------------------------

    fn launch_conversation(&self, inner: &mut Inner, jid: &str) {
        let Some(slot) = inner.slots.get_mut(jid) else {
            return;
        };
        slot.transition(jid, SlotPhase::Active);
        slot.run = Some(RunKind::Conversation);
        slot.pending_messages = false;
        slot.close_requested = false;
        inner.active_count += 1;
        inner.waiting.retain(|w| w != jid);

        let process = inner.process_messages.clone();
        let queue = self.clone();
        let jid = jid.to_string();
        debug!(group = %jid, active_count = inner.active_count, "starting message processing");
        tokio::spawn(async move {
            let success = match process {
                Some(f) => {
                    let run = AssertUnwindSafe(f(jid.clone())).catch_unwind().await;
                    run.unwrap_or_else(|_| {
                        error!(group = %jid, "message processing panicked");
                        false
                    })
                }
                None => {
                    warn!(group = %jid, "no message processor installed, skipping");
                    false
                }
            };
            queue.finish(&jid, Completion::Conversation { success }).await;
        });
    }

    fn launch_task(&self, inner: &mut Inner, jid: &str, task: QueuedTask) {
        let Some(slot) = inner.slots.get_mut(jid) else {
            return;
        };
        slot.transition(jid, SlotPhase::Active);
        slot.run = Some(RunKind::Task(task.id.clone()));
        slot.close_requested = false;
        inner.active_count += 1;
        inner.waiting.retain(|w| w != jid);

        let queue = self.clone();
        let jid = jid.to_string();
        debug!(group = %jid, task_id = %task.id, "running queued task");
        tokio::spawn(async move {
            let QueuedTask { id, task_fn } = task;
            let run = AssertUnwindSafe(async move { task_fn().await }).catch_unwind().await;
            if run.is_err() {
                error!(group = %jid, task_id = %id, "task run panicked");
            }
            queue.finish(&jid, Completion::Task).await;
        });
    }

    async fn finish(&self, jid: &str, completion: Completion) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.active_count = inner.active_count.saturating_sub(1);

        let base = inner.config.retry_base;
        let max_attempts = inner.config.max_attempts;
        let shutting_down = inner.shutting_down;
        let mut failure_hook = None;

        let Some(slot) = inner.slots.get_mut(jid) else {
            warn!(group = jid, "finished run for unknown group");
            return;
        };
        slot.transition(jid, SlotPhase::Draining);
        slot.run = None;
        slot.sandbox = None;
        slot.close_requested = false;

        if let Completion::Conversation { success } = completion {
            if success {
                slot.retry_count = 0;
            } else {
                slot.retry_count += 1;
                if slot.retry_count >= max_attempts {
                    error!(
                        group = jid,
                        attempts = slot.retry_count,
                        "giving up on conversation after repeated failures"
                    );
                    slot.retry_count = 0;
                    failure_hook = inner.on_failure.clone();
                } else if !shutting_down {
                    let delay = retry_delay(base, slot.retry_count);
                    slot.retry_scheduled = true;
                    // The retry re-reads everything past the cursor.
                    slot.pending_messages = false;
                    info!(
                        group = jid,
                        attempt = slot.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling retry with backoff"
                    );
                    let queue = self.clone();
                    let jid = jid.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        queue.retry(&jid).await;
                    });
                }
            }
        }

        if let Some(hook) = failure_hook {
            let jid = jid.to_string();
            tokio::spawn(async move { hook(jid).await });
        }

        self.drain(inner, jid);
    }

    /// Own pending tasks first, then own messages, then waiting groups FIFO.
    fn drain(&self, inner: &mut Inner, jid: &str) {
        let shutting_down = inner.shutting_down;
        if let Some(slot) = inner.slots.get_mut(jid) {
            if shutting_down {
                slot.transition(jid, SlotPhase::Idle);
            } else if let Some(task) = slot.pending_tasks.pop_front() {
                self.launch_task(inner, jid, task);
            } else if slot.pending_messages {
                self.launch_conversation(inner, jid);
            } else {
                slot.transition(jid, SlotPhase::Idle);
            }
        }

        while !shutting_down && !inner.at_capacity() {
            let Some(next) = inner.waiting.pop_front() else {
                break;
            };
            let Some(slot) = inner.slots.get_mut(&next) else {
                continue;
            };
            if slot.phase != SlotPhase::Idle {
                continue;
            }
            if let Some(task) = slot.pending_tasks.pop_front() {
                self.launch_task(inner, &next, task);
            } else if slot.pending_messages {
                self.launch_conversation(inner, &next);
            } else {
                inner.prune(&next);
            }
        }

        inner.prune(jid);
    }

    async fn retry(&self, jid: &str) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(slot) = inner.slots.get_mut(jid) {
                slot.retry_scheduled = false;
            }
            if inner.shutting_down {
                return;
            }
        }
        self.enqueue_message_check(jid).await;
    }
}

/// Closes one idle-waiting conversation elsewhere so a queued task can run.
fn preempt_idle_conversation(inner: &mut Inner, except: &str) {
    let Inner { slots, layout, .. } = inner;
    for (jid, slot) in slots.iter_mut() {
        if jid != except
            && slot.phase == SlotPhase::IdleWaiting
            && slot.is_conversation()
            && !slot.close_requested
        {
            info!(group = %jid, for_group = except, "preempting idle sandbox for queued task");
            request_close(layout, jid, slot);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    fn queue(max_concurrent: usize, tmp: &TempDir) -> GroupQueue {
        GroupQueue::new(
            QueueConfig {
                max_concurrent,
                ..QueueConfig::default()
            },
            IpcLayout::new(tmp.path()),
        )
    }

    /// Message processor that logs the jid and blocks until a permit is added.
    fn gated_processor(gate: Arc<Semaphore>, log: Arc<StdMutex<Vec<String>>>) -> ProcessMessagesFn {
        Arc::new(move |jid: String| {
            let gate = gate.clone();
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(format!("msg:{jid}"));
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                true
            })
        })
    }

    fn logging_task(log: Arc<StdMutex<Vec<String>>>, label: &str) -> TaskFn {
        let label = label.to_string();
        Box::new(move || {
            Box::pin(async move {
                log.lock().unwrap().push(label);
            })
        })
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn handle(folder: &str) -> SandboxHandle {
        SandboxHandle {
            name: format!("hearth-{folder}-1"),
            folder: folder.to_string(),
        }
    }

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_secs(5);
        let delays: Vec<u64> = (1..=4).map(|n| retry_delay(base, n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40]);
    }

    #[test]
    fn only_listed_transitions_are_legal() {
        use SlotPhase::*;
        assert!(Idle.can_become(Active));
        assert!(IdleWaiting.can_become(Active));
        assert!(Draining.can_become(Idle));
        assert!(!Idle.can_become(IdleWaiting));
        assert!(!Idle.can_become(Draining));
        assert!(!Active.can_become(Idle));
        assert!(!Draining.can_become(IdleWaiting));
    }

    #[test]
    #[should_panic(expected = "illegal slot transition")]
    fn illegal_transition_panics() {
        let mut slot = GroupSlot::default();
        slot.transition("http:x", SlotPhase::Draining);
    }

    #[tokio::test]
    async fn single_flight_per_group() {
        let tmp = TempDir::new().unwrap();
        let q = queue(3, &tmp);
        let gate = Arc::new(Semaphore::new(0));
        let log = Arc::new(StdMutex::new(Vec::new()));
        q.set_process_messages_fn(gated_processor(gate.clone(), log.clone())).await;

        assert_eq!(q.enqueue_message_check("http:a").await, Dispatch::Started);
        assert_eq!(q.enqueue_message_check("http:a").await, Dispatch::Deferred);
        assert_eq!(q.active_count().await, 1);

        gate.add_permits(1);
        wait_until(|| log.lock().unwrap().len() == 2).await;
        assert_eq!(q.active_count().await, 1);

        gate.add_permits(1);
        for _ in 0..400 {
            if q.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(q.active_count().await, 0);
        assert!(q.snapshot().await.groups.is_empty());
    }

    #[tokio::test]
    async fn ceiling_defers_and_drains_fifo() {
        let tmp = TempDir::new().unwrap();
        let q = queue(2, &tmp);
        let gate = Arc::new(Semaphore::new(0));
        let log = Arc::new(StdMutex::new(Vec::new()));
        q.set_process_messages_fn(gated_processor(gate.clone(), log.clone())).await;

        assert_eq!(q.enqueue_message_check("http:a").await, Dispatch::Started);
        assert_eq!(q.enqueue_message_check("http:b").await, Dispatch::Started);
        assert_eq!(q.enqueue_message_check("http:c").await, Dispatch::Deferred);
        assert_eq!(q.enqueue_message_check("http:d").await, Dispatch::Deferred);
        assert_eq!(q.active_count().await, 2);
        assert_eq!(q.snapshot().await.waiting, vec!["http:c", "http:d"]);

        gate.add_permits(1);
        wait_until(|| log.lock().unwrap().len() == 3).await;
        assert_eq!(log.lock().unwrap()[2], "msg:http:c");
        assert_eq!(q.active_count().await, 2);
        gate.add_permits(10);
    }

    #[tokio::test]
    async fn duplicate_task_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let q = queue(1, &tmp);
        let gate = Arc::new(Semaphore::new(0));
        let log = Arc::new(StdMutex::new(Vec::new()));
        q.set_process_messages_fn(gated_processor(gate.clone(), log.clone())).await;

        q.enqueue_message_check("http:a").await;
        let first = q.enqueue_task("http:b", "t1", logging_task(log.clone(), "task:t1")).await;
        let again = q.enqueue_task("http:b", "t1", logging_task(log.clone(), "task:t1")).await;
        assert_eq!(first, Dispatch::Deferred);
        assert_eq!(again, Dispatch::Ignored);
        gate.add_permits(10);
        wait_until(|| log.lock().unwrap().iter().filter(|l| *l == "task:t1").count() == 1).await;
    }

    #[tokio::test]
    async fn tasks_drain_before_messages() {
        let tmp = TempDir::new().unwrap();
        let q = queue(1, &tmp);
        let gate = Arc::new(Semaphore::new(0));
        let log = Arc::new(StdMutex::new(Vec::new()));
        q.set_process_messages_fn(gated_processor(gate.clone(), log.clone())).await;

        q.enqueue_message_check("http:a").await;
        q.enqueue_message_check("http:a").await;
        q.enqueue_task("http:a", "t1", logging_task(log.clone(), "task:t1")).await;

        gate.add_permits(10);
        wait_until(|| log.lock().unwrap().len() == 3).await;
        assert_eq!(*log.lock().unwrap(), vec!["msg:http:a", "task:t1", "msg:http:a"]);
    }

    #[tokio::test]
    async fn idle_conversation_is_preempted_for_waiting_task() {
        let tmp = TempDir::new().unwrap();
        let q = queue(1, &tmp);
        let gate = Arc::new(Semaphore::new(0));
        let log = Arc::new(StdMutex::new(Vec::new()));
        q.set_process_messages_fn(gated_processor(gate.clone(), log.clone())).await;
        let layout = IpcLayout::new(tmp.path());

        q.enqueue_message_check("http:a").await;
        q.register_process("http:a", handle("a")).await;
        q.notify_idle("http:a").await;
        assert!(!layout.input_dir("a").join("_close").exists());

        let dispatch = q.enqueue_task("http:b", "t1", logging_task(log.clone(), "task:t1")).await;
        assert_eq!(dispatch, Dispatch::Deferred);
        assert!(layout.input_dir("a").join("_close").exists());
        // A closing sandbox no longer accepts follow-ups.
        assert!(!q.send_message("http:a", "late").await);

        gate.add_permits(1);
        wait_until(|| log.lock().unwrap().contains(&"task:t1".to_string())).await;
    }

    #[tokio::test]
    async fn active_sandbox_is_never_preempted() {
        let tmp = TempDir::new().unwrap();
        let q = queue(1, &tmp);
        let gate = Arc::new(Semaphore::new(0));
        let log = Arc::new(StdMutex::new(Vec::new()));
        q.set_process_messages_fn(gated_processor(gate.clone(), log.clone())).await;
        let layout = IpcLayout::new(tmp.path());

        q.enqueue_message_check("http:a").await;
        q.register_process("http:a", handle("a")).await;
        q.enqueue_task("http:b", "t1", logging_task(log.clone(), "task:t1")).await;
        assert!(!layout.input_dir("a").join("_close").exists());

        // Going idle with a task waiting at capacity closes it.
        q.notify_idle("http:a").await;
        assert!(layout.input_dir("a").join("_close").exists());
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn follow_up_is_piped_and_reactivates() {
        let tmp = TempDir::new().unwrap();
        let q = queue(2, &tmp);
        let gate = Arc::new(Semaphore::new(0));
        let log = Arc::new(StdMutex::new(Vec::new()));
        q.set_process_messages_fn(gated_processor(gate.clone(), log.clone())).await;
        let layout = IpcLayout::new(tmp.path());

        assert!(!q.send_message("http:a", "nobody home").await);
        q.enqueue_message_check("http:a").await;
        assert!(!q.send_message("http:a", "not registered yet").await);

        q.register_process("http:a", handle("a")).await;
        q.notify_idle("http:a").await;
        assert_eq!(q.snapshot().await.groups[0].phase, SlotPhase::IdleWaiting);

        assert!(q.send_message("http:a", "follow-up").await);
        assert_eq!(q.snapshot().await.groups[0].phase, SlotPhase::Active);
        assert_eq!(mailbox::read_json_files(&layout.input_dir("a")).unwrap().len(), 1);

        q.close_stdin("http:a").await;
        assert!(!q.send_message("http:a", "after close").await);
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn task_runs_do_not_accept_follow_ups() {
        let tmp = TempDir::new().unwrap();
        let q = queue(1, &tmp);
        let gate = Arc::new(Semaphore::new(0));
        let g = gate.clone();
        let task: TaskFn = Box::new(move || {
            Box::pin(async move {
                if let Ok(p) = g.acquire().await {
                    p.forget();
                }
            })
        });
        assert_eq!(q.enqueue_task("http:a", "t1", task).await, Dispatch::Started);
        q.register_process("http:a", handle("a")).await;
        assert!(!q.send_message("http:a", "hi").await);
        assert_eq!(q.snapshot().await.groups[0].running_task.as_deref(), Some("t1"));
        gate.add_permits(1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_conversation_backs_off_then_gives_up() {
        let tmp = TempDir::new().unwrap();
        let q = queue(2, &tmp);
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        q.set_process_messages_fn(Arc::new(move |_jid: String| {
            let a = a.clone();
            Box::pin(async move {
                a.fetch_add(1, Ordering::SeqCst);
                false
            })
        }))
        .await;

        let (tx, rx) = tokio::sync::oneshot::channel::<String>();
        let tx = Arc::new(StdMutex::new(Some(tx)));
        q.set_failure_fn(Arc::new(move |jid: String| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(jid);
                }
            })
        }))
        .await;

        let started = tokio::time::Instant::now();
        q.enqueue_message_check("http:a").await;
        let jid = tokio::time::timeout(Duration::from_secs(600), rx).await.unwrap().unwrap();

        assert_eq!(jid, "http:a");
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() >= Duration::from_secs(75));
        assert!(started.elapsed() < Duration::from_secs(80));
    }

    #[tokio::test]
    async fn shutdown_ignores_new_work() {
        let tmp = TempDir::new().unwrap();
        let q = queue(3, &tmp);
        q.shutdown().await;
        assert_eq!(q.enqueue_message_check("http:a").await, Dispatch::Ignored);
        let noop: TaskFn = Box::new(|| Box::pin(async {}));
        assert_eq!(q.enqueue_task("http:a", "t", noop).await, Dispatch::Ignored);
        assert!(!q.is_active("http:a").await);
        assert!(q.snapshot().await.shutting_down);
    }
}
