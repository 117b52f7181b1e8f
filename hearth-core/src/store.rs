use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::{info, warn};

use crate::model::{
    ContextMode, NewMessage, RegisteredGroup, RunStatus, SandboxConfig, ScheduleKind,
    ScheduledTask, TaskRunLog, TaskStatus, now_ts,
};

/// SQLite-backed durable state. One connection behind a mutex; every call is
/// a short synchronous statement.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database: {}", path.display()))?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "store opened and schema ensured");
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store connection mutex poisoned"))
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

fn ensure_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "\
        CREATE TABLE IF NOT EXISTS messages (
          id TEXT NOT NULL,
          chat_jid TEXT NOT NULL,
          sender TEXT,
          sender_name TEXT,
          content TEXT,
          timestamp TEXT NOT NULL,
          is_from_me INTEGER NOT NULL DEFAULT 0,
          is_bot_message INTEGER NOT NULL DEFAULT 0,
          PRIMARY KEY (id, chat_jid)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
          id TEXT PRIMARY KEY,
          group_folder TEXT NOT NULL,
          chat_jid TEXT NOT NULL,
          prompt TEXT NOT NULL,
          schedule_type TEXT NOT NULL,
          schedule_value TEXT NOT NULL,
          context_mode TEXT NOT NULL DEFAULT 'isolated',
          next_run TEXT,
          last_run TEXT,
          last_result TEXT,
          status TEXT NOT NULL DEFAULT 'active',
          created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks(next_run);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON scheduled_tasks(status);

        CREATE TABLE IF NOT EXISTS task_run_logs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          task_id TEXT NOT NULL,
          run_at TEXT NOT NULL,
          duration_ms INTEGER NOT NULL,
          status TEXT NOT NULL,
          result TEXT,
          error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_task_run_logs_task ON task_run_logs(task_id, run_at);

        CREATE TABLE IF NOT EXISTS router_state (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
          group_folder TEXT PRIMARY KEY,
          session_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS registered_groups (
          jid TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          folder TEXT NOT NULL UNIQUE,
          trigger_pattern TEXT,
          added_at TEXT NOT NULL,
          sandbox_config TEXT,
          is_primary INTEGER NOT NULL DEFAULT 0
        );
        ",
    )
    .context("failed to create sqlite schema")
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

const MESSAGE_COLUMNS: &str =
    "id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<NewMessage> {
    Ok(NewMessage {
        id: row.get("id")?,
        chat_jid: row.get("chat_jid")?,
        sender: row.get::<_, Option<String>>("sender")?.unwrap_or_default(),
        sender_name: row.get::<_, Option<String>>("sender_name")?.unwrap_or_default(),
        content: row.get::<_, Option<String>>("content")?.unwrap_or_default(),
        timestamp: row.get("timestamp")?,
        is_from_me: row.get("is_from_me")?,
        is_bot_message: row.get("is_bot_message")?,
    })
}

impl Store {
    pub fn store_message(&self, msg: &NewMessage) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "\
            INSERT INTO messages (id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (id, chat_jid) DO UPDATE SET
              content = excluded.content,
              is_bot_message = excluded.is_bot_message
            ",
            params![
                msg.id,
                msg.chat_jid,
                msg.sender,
                msg.sender_name,
                msg.content,
                msg.timestamp,
                msg.is_from_me,
                msg.is_bot_message,
            ],
        )
        .context("store_message")?;
        Ok(())
    }

    /// Human messages newer than `since` across `jids`, oldest first, plus the
    /// newest timestamp seen (or `since` when nothing is new).
    pub fn get_new_messages(
        &self,
        jids: &[String],
        since: &str,
        bot_prefix: &str,
    ) -> anyhow::Result<(Vec<NewMessage>, String)> {
        if jids.is_empty() {
            return Ok((Vec::new(), since.to_string()));
        }

        let placeholders: Vec<String> = (0..jids.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE timestamp > ?1 AND chat_jid IN ({}) \
               AND is_bot_message = 0 AND content NOT LIKE ?{} \
               AND content IS NOT NULL AND content != '' \
             ORDER BY timestamp, rowid",
            placeholders.join(", "),
            jids.len() + 2,
        );

        let mut values: Vec<String> = Vec::with_capacity(jids.len() + 2);
        values.push(since.to_string());
        values.extend(jids.iter().cloned());
        values.push(format!("{bot_prefix}:%"));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).context("get_new_messages")?;
        let messages = stmt
            .query_map(params_from_iter(values.iter()), row_to_message)
            .context("get_new_messages")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_new_messages")?;

        let newest = messages
            .iter()
            .map(|m| m.timestamp.as_str())
            .max()
            .filter(|ts| *ts > since)
            .unwrap_or(since)
            .to_string();
        Ok((messages, newest))
    }

    /// Human messages for one chat in `(since, until]`, oldest first.
    pub fn get_messages_since(
        &self,
        chat_jid: &str,
        since: &str,
        until: &str,
        bot_prefix: &str,
    ) -> anyhow::Result<Vec<NewMessage>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE chat_jid = ?1 AND timestamp > ?2 AND timestamp <= ?3 \
               AND is_bot_message = 0 AND content NOT LIKE ?4 \
               AND content IS NOT NULL AND content != '' \
             ORDER BY timestamp, rowid"
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).context("get_messages_since")?;
        let rows = stmt
            .query_map(
                params![chat_jid, since, until, format!("{bot_prefix}:%")],
                row_to_message,
            )
            .context("get_messages_since")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_messages_since")?;
        Ok(rows)
    }

    /// Latest `limit` messages for one chat, bot output included, oldest first.
    pub fn recent_messages(&self, chat_jid: &str, limit: usize) -> anyhow::Result<Vec<NewMessage>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_jid = ?1 \
             ORDER BY timestamp DESC, rowid DESC LIMIT ?2"
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).context("recent_messages")?;
        let mut rows = stmt
            .query_map(params![chat_jid, limit as i64], row_to_message)
            .context("recent_messages")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("recent_messages")?;
        rows.reverse();
        Ok(rows)
    }

    /// Timestamp of the newest stored message in any chat.
    pub fn newest_message_timestamp(&self) -> anyhow::Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row("SELECT MAX(timestamp) FROM messages", [], |r| r.get::<_, Option<String>>(0))
            .context("newest_message_timestamp")
    }
}

// ---------------------------------------------------------------------------
// Router state and sessions
// ---------------------------------------------------------------------------

impl Store {
    pub fn get_router_state(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM router_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("get_router_state")
    }

    pub fn set_router_state(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO router_state (key, value) VALUES (?1, ?2) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .context("set_router_state")?;
        Ok(())
    }

    pub fn get_session(&self, group_folder: &str) -> anyhow::Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT session_id FROM sessions WHERE group_folder = ?1",
            params![group_folder],
            |row| row.get(0),
        )
        .optional()
        .context("get_session")
    }

    pub fn set_session(&self, group_folder: &str, session_id: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (group_folder, session_id) VALUES (?1, ?2) \
             ON CONFLICT (group_folder) DO UPDATE SET session_id = excluded.session_id",
            params![group_folder, session_id],
        )
        .context("set_session")?;
        Ok(())
    }

    pub fn get_all_sessions(&self) -> anyhow::Result<HashMap<String, String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT group_folder, session_id FROM sessions")
            .context("get_all_sessions")?;
        let sessions = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("get_all_sessions")?
            .collect::<rusqlite::Result<HashMap<String, String>>>()
            .context("get_all_sessions")?;
        Ok(sessions)
    }
}

// ---------------------------------------------------------------------------
// Registered groups
// ---------------------------------------------------------------------------

fn row_to_group(row: &Row<'_>) -> rusqlite::Result<RegisteredGroup> {
    let jid: String = row.get("jid")?;
    let sandbox = match row.get::<_, Option<String>>("sandbox_config")? {
        Some(raw) => serde_json::from_str::<SandboxConfig>(&raw).unwrap_or_else(|err| {
            warn!(jid = %jid, err = %err, "ignoring unreadable sandbox config");
            SandboxConfig::default()
        }),
        None => SandboxConfig::default(),
    };
    Ok(RegisteredGroup {
        jid,
        name: row.get("name")?,
        folder: row.get("folder")?,
        trigger: row.get("trigger_pattern")?,
        added_at: row.get("added_at")?,
        sandbox,
        is_primary: row.get("is_primary")?,
    })
}

impl Store {
    pub fn get_all_registered_groups(&self) -> anyhow::Result<Vec<RegisteredGroup>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT jid, name, folder, trigger_pattern, added_at, sandbox_config, is_primary \
                 FROM registered_groups ORDER BY added_at, jid",
            )
            .context("get_all_registered_groups")?;
        let groups = stmt
            .query_map([], row_to_group)
            .context("get_all_registered_groups")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_all_registered_groups")?;
        Ok(groups)
    }

    pub fn set_registered_group(&self, group: &RegisteredGroup) -> anyhow::Result<()> {
        let sandbox = serde_json::to_string(&group.sandbox).context("encode sandbox config")?;
        let conn = self.lock()?;
        conn.execute(
            "\
            INSERT INTO registered_groups (jid, name, folder, trigger_pattern, added_at, sandbox_config, is_primary)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (jid) DO UPDATE SET
              name = excluded.name,
              folder = excluded.folder,
              trigger_pattern = excluded.trigger_pattern,
              sandbox_config = excluded.sandbox_config,
              is_primary = excluded.is_primary
            ",
            params![
                group.jid,
                group.name,
                group.folder,
                group.trigger,
                group.added_at,
                sandbox,
                group.is_primary,
            ],
        )
        .with_context(|| format!("set_registered_group {}", group.jid))?;
        Ok(())
    }

    /// True when `folder` belongs to a group other than `jid`.
    pub fn folder_in_use(&self, folder: &str, jid: &str) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM registered_groups WHERE folder = ?1 AND jid != ?2",
                params![folder, jid],
                |row| row.get(0),
            )
            .context("folder_in_use")?;
        Ok(count > 0)
    }
}

// ---------------------------------------------------------------------------
// Scheduled tasks
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str = "id, group_folder, chat_jid, prompt, schedule_type, schedule_value, \
     context_mode, next_run, last_run, last_result, status, created_at";

fn parse_column<T: std::str::FromStr>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: row.get(0)?,
        group_folder: row.get(1)?,
        chat_jid: row.get(2)?,
        prompt: row.get(3)?,
        schedule_type: parse_column::<ScheduleKind>(4, row.get(4)?)?,
        schedule_value: row.get(5)?,
        context_mode: parse_column::<ContextMode>(6, row.get(6)?)?,
        next_run: row.get(7)?,
        last_run: row.get(8)?,
        last_result: row.get(9)?,
        status: parse_column::<TaskStatus>(10, row.get(10)?)?,
        created_at: row.get(11)?,
    })
}

impl Store {
    pub fn create_task(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO scheduled_tasks ({TASK_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                task.id,
                task.group_folder,
                task.chat_jid,
                task.prompt,
                task.schedule_type.as_str(),
                task.schedule_value,
                task.context_mode.as_str(),
                task.next_run,
                task.last_run,
                task.last_result,
                task.status.as_str(),
                task.created_at,
            ],
        )
        .with_context(|| format!("create_task {}", task.id))?;
        Ok(())
    }

    pub fn get_task_by_id(&self, id: &str) -> anyhow::Result<Option<ScheduledTask>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
            params![id],
            row_to_task,
        )
        .optional()
        .context("get_task_by_id")
    }

    fn query_tasks(&self, sql: &str, args: &[&str]) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).context("prepare task query")?;
        let tasks = stmt
            .query_map(params_from_iter(args.iter()), row_to_task)
            .context("query tasks")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read task rows")?;
        Ok(tasks)
    }

    pub fn get_tasks_for_group(&self, group_folder: &str) -> anyhow::Result<Vec<ScheduledTask>> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE group_folder = ?1 \
                 ORDER BY created_at, id"
            ),
            &[group_folder],
        )
    }

    pub fn get_all_tasks(&self) -> anyhow::Result<Vec<ScheduledTask>> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at, id"),
            &[],
        )
    }

    /// Active tasks whose `next_run` is at or before `now`, soonest first.
    pub fn get_due_tasks(&self, now: &str) -> anyhow::Result<Vec<ScheduledTask>> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks \
                 WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1 \
                 ORDER BY next_run, id"
            ),
            &[now],
        )
    }

    pub fn set_task_status(&self, id: &str, status: TaskStatus) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_tasks SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .context("set_task_status")?;
        Ok(changed > 0)
    }

    pub fn set_task_next_run(&self, id: &str, next_run: Option<&str>) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE scheduled_tasks SET next_run = ?2 WHERE id = ?1",
            params![id, next_run],
        )
        .context("set_task_next_run")?;
        Ok(())
    }

    /// Records a finished run. A missing `next_run` completes an active task.
    pub fn update_task_after_run(
        &self,
        id: &str,
        next_run: Option<&str>,
        last_result: &str,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "\
            UPDATE scheduled_tasks SET
              next_run = ?2,
              last_run = ?3,
              last_result = ?4,
              status = CASE WHEN ?2 IS NULL AND status = 'active' THEN 'completed' ELSE status END
            WHERE id = ?1
            ",
            params![id, next_run, now_ts(), last_result],
        )
        .context("update_task_after_run")?;
        Ok(())
    }

    pub fn log_task_run(&self, log: &TaskRunLog) -> anyhow::Result<()> {
        let status = match log.status {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![log.task_id, log.run_at, log.duration_ms, status, log.result, log.error],
        )
        .context("log_task_run")?;
        Ok(())
    }

    pub fn get_task_runs(&self, task_id: &str) -> anyhow::Result<Vec<TaskRunLog>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT task_id, run_at, duration_ms, status, result, error \
                 FROM task_run_logs WHERE task_id = ?1 ORDER BY run_at, id",
            )
            .context("get_task_runs")?;
        let runs = stmt
            .query_map(params![task_id], |row| {
                let status: String = row.get(3)?;
                Ok(TaskRunLog {
                    task_id: row.get(0)?,
                    run_at: row.get(1)?,
                    duration_ms: row.get(2)?,
                    status: if status == "success" {
                        RunStatus::Success
                    } else {
                        RunStatus::Error
                    },
                    result: row.get(4)?,
                    error: row.get(5)?,
                })
            })
            .context("get_task_runs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_task_runs")?;
        Ok(runs)
    }
}
