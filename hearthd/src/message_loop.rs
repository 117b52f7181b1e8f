//! Message poll loop: reads new inbound messages and dispatches to `GroupQueue`.
//!
//! Two cursors, both persisted in `router_state`:
//! - `last_timestamp` (seen): advances whenever new messages are fetched,
//!   trigger or not.
//! - `last_agent_timestamp` (processed, per group): advances when a batch is
//!   handed to a sandbox and is rolled back when the run fails.
//!
//! Processed never passes seen. On startup, `recover_pending_messages`
//! re-enqueues groups holding unprocessed triggered messages.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hearth_core::model::NewMessage;
use hearth_core::store::Store;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::queue::GroupQueue;
use crate::registry::GroupRegistry;
use crate::router::{batch_triggers, format_messages};

pub const SEEN_CURSOR_KEY: &str = "last_timestamp";
pub const PROCESSED_CURSOR_KEY: &str = "last_agent_timestamp";

#[derive(Debug, Clone)]
pub struct MessageLoopConfig {
    pub poll_interval: Duration,
    /// Also the prefix that marks bot-authored content.
    pub assistant_name: String,
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProcessedMap(HashMap<String, String>);

#[derive(Debug, Default)]
struct CursorState {
    seen: String,
    processed: ProcessedMap,
}

/// Shared handle over the seen and per-group processed cursors.
#[derive(Clone)]
pub struct Cursors {
    store: Store,
    state: Arc<Mutex<CursorState>>,
}

impl Cursors {
    pub fn load(store: Store) -> Self {
        let seen = match store.get_router_state(SEEN_CURSOR_KEY) {
            Ok(v) => v.unwrap_or_default(),
            Err(err) => {
                warn!(err = %err, "failed to load seen cursor, starting from empty");
                String::new()
            }
        };
        let processed = match store.get_router_state(PROCESSED_CURSOR_KEY) {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|err| {
                warn!(err = %err, "corrupt processed cursors, starting from empty");
                ProcessedMap::default()
            }),
            Ok(None) => ProcessedMap::default(),
            Err(err) => {
                warn!(err = %err, "failed to load processed cursors, starting from empty");
                ProcessedMap::default()
            }
        };

        let mut state = CursorState { seen, processed };
        // processed <= seen
        let seen = state.seen.clone();
        for ts in state.processed.0.values_mut() {
            if *ts > seen {
                *ts = seen.clone();
            }
        }
        Self {
            store,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn seen(&self) -> String {
        self.lock().seen.clone()
    }

    pub fn processed(&self, jid: &str) -> String {
        self.lock().processed.0.get(jid).cloned().unwrap_or_default()
    }

    /// Moves the seen cursor forward; older values are ignored.
    pub fn advance_seen(&self, ts: &str) {
        let mut state = self.lock();
        if ts <= state.seen.as_str() {
            return;
        }
        state.seen = ts.to_string();
        if let Err(err) = self.store.set_router_state(SEEN_CURSOR_KEY, ts) {
            error!(err = %err, "failed to save seen cursor");
        }
    }

    /// Marks `jid` processed up to `ts`, clamped to the seen cursor. Never
    /// moves the cursor back; only [`Cursors::rollback`] does that.
    /// Returns the previous value for rollback.
    pub fn commit(&self, jid: &str, ts: &str) -> String {
        let mut state = self.lock();
        let clamped = if ts > state.seen.as_str() {
            state.seen.clone()
        } else {
            ts.to_string()
        };
        let previous = state.processed.0.get(jid).cloned().unwrap_or_default();
        if clamped <= previous {
            return previous;
        }
        state.processed.0.insert(jid.to_string(), clamped);
        self.persist_processed(&state.processed);
        previous
    }

    /// Restores the processed cursor of `jid` after a failed run.
    pub fn rollback(&self, jid: &str, previous: &str) {
        let mut state = self.lock();
        if previous.is_empty() {
            state.processed.0.remove(jid);
        } else {
            state.processed.0.insert(jid.to_string(), previous.to_string());
        }
        self.persist_processed(&state.processed);
    }

    fn persist_processed(&self, processed: &ProcessedMap) {
        let json = match serde_json::to_string(processed) {
            Ok(json) => json,
            Err(err) => {
                error!(err = %err, "failed to encode processed cursors");
                return;
            }
        };
        if let Err(err) = self.store.set_router_state(PROCESSED_CURSOR_KEY, &json) {
            error!(err = %err, "failed to save processed cursors");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CursorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unprocessed human messages of `jid`, bounded by the seen cursor.
pub fn pending_batch(store: &Store, cursors: &Cursors, jid: &str, bot_prefix: &str) -> anyhow::Result<Vec<NewMessage>> {
    let seen = cursors.seen();
    if seen.is_empty() {
        return Ok(Vec::new());
    }
    store.get_messages_since(jid, &cursors.processed(jid), &seen, bot_prefix)
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

pub struct MessageLoop {
    config: MessageLoopConfig,
    store: Store,
    cursors: Cursors,
    registry: Arc<GroupRegistry>,
    queue: GroupQueue,
}

impl MessageLoop {
    pub fn new(
        config: MessageLoopConfig,
        store: Store,
        cursors: Cursors,
        registry: Arc<GroupRegistry>,
        queue: GroupQueue,
    ) -> Self {
        Self {
            config,
            store,
            cursors,
            registry,
            queue,
        }
    }

    /// Runs recovery, then polls until shutdown fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            last_timestamp = %self.cursors.seen(),
            "message loop started"
        );

        self.recover_pending_messages().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("message loop shutting down");
                        return;
                    }
                }
            }

            if let Err(err) = self.poll_once().await {
                error!(err = %err, "error in message poll");
            }
        }
    }

    /// One poll. Returns the number of new messages seen.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let jids = self.registry.jids();
        if jids.is_empty() {
            return Ok(0);
        }

        let (messages, newest) =
            self.store
                .get_new_messages(&jids, &self.cursors.seen(), &self.config.assistant_name)?;
        if messages.is_empty() {
            return Ok(0);
        }
        let count = messages.len();
        info!(count, "new messages");
        self.cursors.advance_seen(&newest);

        let mut by_group: BTreeMap<String, Vec<NewMessage>> = BTreeMap::new();
        for msg in messages {
            by_group.entry(msg.chat_jid.clone()).or_default().push(msg);
        }

        for (chat_jid, group_messages) in by_group {
            let Some(group) = self.registry.get(&chat_jid) else {
                continue;
            };
            // Untriggered messages stay in the store and ride along as
            // context with the next triggered batch.
            if !batch_triggers(&group, &group_messages) {
                debug!(chat_jid = %chat_jid, count = group_messages.len(), "no trigger, holding messages");
                continue;
            }

            let pending = pending_batch(&self.store, &self.cursors, &chat_jid, &self.config.assistant_name)
                .unwrap_or_else(|err| {
                    warn!(chat_jid = %chat_jid, err = %err, "failed to load pending batch");
                    Vec::new()
                });
            let batch = if pending.is_empty() { &group_messages } else { &pending };

            if self.queue.send_message(&chat_jid, &format_messages(batch)).await {
                debug!(chat_jid = %chat_jid, count = batch.len(), "piped messages to active sandbox");
                if let Some(last) = batch.last() {
                    self.cursors.commit(&chat_jid, &last.timestamp);
                }
            } else {
                self.queue.enqueue_message_check(&chat_jid).await;
            }
        }

        Ok(count)
    }

    /// Startup recovery: enqueue groups whose unprocessed messages carry a trigger.
    pub async fn recover_pending_messages(&self) -> usize {
        let mut enqueued = 0;
        for group in self.registry.all() {
            let pending =
                match pending_batch(&self.store, &self.cursors, &group.jid, &self.config.assistant_name) {
                    Ok(msgs) => msgs,
                    Err(err) => {
                        warn!(chat_jid = %group.jid, err = %err, "recovery: failed to check pending messages");
                        continue;
                    }
                };
            if pending.is_empty() || !batch_triggers(&group, &pending) {
                continue;
            }
            info!(
                group = %group.folder,
                pending_count = pending.len(),
                "recovery: enqueuing unprocessed messages"
            );
            self.queue.enqueue_message_check(&group.jid).await;
            enqueued += 1;
        }
        enqueued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::IpcLayout;
    use crate::queue::QueueConfig;
    use crate::registry::Registration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn msg(id: &str, jid: &str, content: &str, ts: &str) -> NewMessage {
        NewMessage {
            id: id.into(),
            chat_jid: jid.into(),
            sender: "u1".into(),
            sender_name: "Alice".into(),
            content: content.into(),
            timestamp: ts.into(),
            is_from_me: false,
            is_bot_message: false,
        }
    }

    #[test]
    fn processed_never_passes_seen() {
        let store = Store::open_in_memory().unwrap();
        let cursors = Cursors::load(store.clone());
        cursors.advance_seen("2026-01-01T00:00:05.000Z");
        cursors.advance_seen("2026-01-01T00:00:01.000Z");
        assert_eq!(cursors.seen(), "2026-01-01T00:00:05.000Z");

        let previous = cursors.commit("http:a", "2026-01-01T00:00:09.000Z");
        assert_eq!(previous, "");
        assert_eq!(cursors.processed("http:a"), "2026-01-01T00:00:05.000Z");

        cursors.rollback("http:a", &previous);
        assert_eq!(cursors.processed("http:a"), "");

        cursors.commit("http:a", "2026-01-01T00:00:03.000Z");
        let reloaded = Cursors::load(store);
        assert_eq!(reloaded.seen(), "2026-01-01T00:00:05.000Z");
        assert_eq!(reloaded.processed("http:a"), "2026-01-01T00:00:03.000Z");
    }

    #[test]
    fn stale_commit_never_moves_processed_back() {
        let store = Store::open_in_memory().unwrap();
        let cursors = Cursors::load(store.clone());
        cursors.advance_seen("2026-01-01T00:00:09.000Z");

        assert_eq!(cursors.commit("http:a", "2026-01-01T00:00:07.000Z"), "");
        let previous = cursors.commit("http:a", "2026-01-01T00:00:05.000Z");
        assert_eq!(previous, "2026-01-01T00:00:07.000Z");
        assert_eq!(cursors.processed("http:a"), "2026-01-01T00:00:07.000Z");
        assert_eq!(Cursors::load(store).processed("http:a"), "2026-01-01T00:00:07.000Z");

        cursors.rollback("http:a", "2026-01-01T00:00:02.000Z");
        assert_eq!(cursors.processed("http:a"), "2026-01-01T00:00:02.000Z");
    }

    #[test]
    fn load_clamps_processed_ahead_of_seen() {
        let store = Store::open_in_memory().unwrap();
        store.set_router_state(SEEN_CURSOR_KEY, "2026-01-01T00:00:05.000Z").unwrap();
        store
            .set_router_state(PROCESSED_CURSOR_KEY, r#"{"http:a":"2026-01-02T00:00:00.000Z"}"#)
            .unwrap();
        let cursors = Cursors::load(store);
        assert_eq!(cursors.processed("http:a"), "2026-01-01T00:00:05.000Z");
    }

    struct Harness {
        store: Store,
        looper: MessageLoop,
        dispatched: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    async fn harness(trigger: Option<&str>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let registry = Arc::new(GroupRegistry::default());
        registry
            .register(
                &store,
                Registration {
                    jid: "http:team".into(),
                    name: "Team".into(),
                    folder: "team".into(),
                    trigger: trigger.map(String::from),
                    sandbox: Default::default(),
                    is_primary: false,
                },
            )
            .unwrap();
        let queue = GroupQueue::new(QueueConfig::default(), IpcLayout::new(dir.path()));
        let dispatched = Arc::new(AtomicUsize::new(0));
        let counter = dispatched.clone();
        queue
            .set_process_messages_fn(Arc::new(move |_jid| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { true })
            }))
            .await;
        let cursors = Cursors::load(store.clone());
        let looper = MessageLoop::new(
            MessageLoopConfig {
                poll_interval: Duration::from_millis(10),
                assistant_name: "Hearth".into(),
            },
            store.clone(),
            cursors,
            registry,
            queue,
        );
        Harness {
            store,
            looper,
            dispatched,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn untriggered_messages_advance_seen_only() {
        let h = harness(Some("@Hearth")).await;
        h.store
            .store_message(&msg("1", "http:team", "just chatting", "2026-01-01T00:00:01.000Z"))
            .unwrap();
        assert_eq!(h.looper.poll_once().await.unwrap(), 1);
        assert_eq!(h.looper.cursors.seen(), "2026-01-01T00:00:01.000Z");
        assert_eq!(h.looper.cursors.processed("http:team"), "");
        tokio::task::yield_now().await;
        assert_eq!(h.dispatched.load(Ordering::SeqCst), 0);

        h.store
            .store_message(&msg("2", "http:team", "@hearth summarize", "2026-01-01T00:00:02.000Z"))
            .unwrap();
        assert_eq!(h.looper.poll_once().await.unwrap(), 1);
        // The earlier message is still pending and goes out with the trigger.
        let batch = pending_batch(&h.store, &h.looper.cursors, "http:team", "Hearth").unwrap();
        assert_eq!(batch.len(), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bot_messages_and_unknown_chats_are_ignored() {
        let h = harness(None).await;
        let mut bot = msg("b", "http:team", "Hearth: hello", "2026-01-01T00:00:01.000Z");
        bot.is_bot_message = true;
        h.store.store_message(&bot).unwrap();
        h.store
            .store_message(&msg("x", "http:stranger", "hi", "2026-01-01T00:00:02.000Z"))
            .unwrap();
        assert_eq!(h.looper.poll_once().await.unwrap(), 0);
        assert_eq!(h.looper.cursors.seen(), "");
    }

    #[tokio::test]
    async fn recovery_enqueues_unprocessed_triggered_groups() {
        let h = harness(Some("@Hearth")).await;
        h.store
            .store_message(&msg("1", "http:team", "@Hearth ping", "2026-01-01T00:00:01.000Z"))
            .unwrap();
        // Seen advanced, then the process died before handoff.
        h.looper.cursors.advance_seen("2026-01-01T00:00:01.000Z");
        assert_eq!(h.looper.recover_pending_messages().await, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.dispatched.load(Ordering::SeqCst), 1);

        // Once processed, nothing is left to recover.
        h.looper.cursors.commit("http:team", "2026-01-01T00:00:01.000Z");
        assert_eq!(h.looper.recover_pending_messages().await, 0);
    }
}
