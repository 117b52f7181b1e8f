//! IPC payloads shared between sandbox agents and the hearthd host.
//!
//! Sandboxes write one JSON object per file into `/workspace/ipc/{channel}/`.
//! Two outbound channels exist:
//! - **messages**: `message` commands (sandbox -> host -> chat)
//! - **tasks**: scheduling and group-management commands
//!
//! The host writes follow-up input into `input/` and never trusts identity
//! fields inside a payload; the namespace directory is the identity.

use serde::{Deserialize, Serialize};

use crate::model::{ContextMode, SandboxConfig};

pub const MESSAGES_DIR: &str = "messages";
pub const TASKS_DIR: &str = "tasks";
pub const INPUT_DIR: &str = "input";
pub const ERRORS_DIR: &str = "errors";

/// Sentinel filename in `input/` asking the sandbox to end its session.
pub const CLOSE_SENTINEL: &str = "_close";

pub const CURRENT_TASKS_SNAPSHOT: &str = "current_tasks.json";
pub const AVAILABLE_GROUPS_SNAPSHOT: &str = "available_groups.json";

/// Command written by a sandbox. Unknown extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcCommand {
    Message {
        #[serde(alias = "chatJid")]
        chat_jid: String,
        text: String,
        #[serde(default)]
        sender: Option<String>,
    },
    ScheduleTask {
        prompt: String,
        #[serde(alias = "scheduleType")]
        schedule_type: String,
        #[serde(alias = "scheduleValue")]
        schedule_value: String,
        #[serde(default, alias = "contextMode")]
        context_mode: ContextMode,
        #[serde(default, alias = "targetJid")]
        target_jid: Option<String>,
    },
    PauseTask {
        #[serde(alias = "taskId")]
        task_id: String,
    },
    ResumeTask {
        #[serde(alias = "taskId")]
        task_id: String,
    },
    CancelTask {
        #[serde(alias = "taskId")]
        task_id: String,
    },
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        #[serde(default)]
        trigger: Option<String>,
        #[serde(default, alias = "containerConfig")]
        sandbox: SandboxConfig,
    },
    RefreshGroups,
}

/// Which outbound directory a command was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcChannel {
    Messages,
    Tasks,
}

impl IpcChannel {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Messages => MESSAGES_DIR,
            Self::Tasks => TASKS_DIR,
        }
    }
}

impl IpcCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::ScheduleTask { .. } => "schedule_task",
            Self::PauseTask { .. } => "pause_task",
            Self::ResumeTask { .. } => "resume_task",
            Self::CancelTask { .. } => "cancel_task",
            Self::RegisterGroup { .. } => "register_group",
            Self::RefreshGroups => "refresh_groups",
        }
    }

    /// `message` belongs in `messages/`; everything else in `tasks/`.
    pub fn expected_channel(&self) -> IpcChannel {
        match self {
            Self::Message { .. } => IpcChannel::Messages,
            _ => IpcChannel::Tasks,
        }
    }
}

/// Follow-up input piped into a live sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl InputMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            text: text.into(),
        }
    }
}

/// Entry in the primary namespace's `available_groups.json` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub jid: String,
    pub name: String,
    pub folder: String,
    pub is_primary: bool,
}

/// Entry in a namespace's `current_tasks.json` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub group_folder: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub status: String,
    pub next_run: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_with_camel_case_jid_and_extra_fields() {
        let cmd: IpcCommand = serde_json::from_str(
            r#"{"type":"message","chatJid":"http:team","text":"hi","groupFolder":"team","timestamp":"x"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            IpcCommand::Message {
                chat_jid: "http:team".to_string(),
                text: "hi".to_string(),
                sender: None,
            }
        );
        assert_eq!(cmd.expected_channel(), IpcChannel::Messages);
    }

    #[test]
    fn schedule_task_defaults_to_isolated_context() {
        let cmd: IpcCommand = serde_json::from_str(
            r#"{"type":"schedule_task","prompt":"p","schedule_type":"interval","schedule_value":"60000"}"#,
        )
        .unwrap();
        match cmd {
            IpcCommand::ScheduleTask {
                context_mode,
                target_jid,
                ..
            } => {
                assert_eq!(context_mode, ContextMode::Isolated);
                assert!(target_jid.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn refresh_groups_is_a_unit_variant() {
        let cmd: IpcCommand = serde_json::from_str(r#"{"type":"refresh_groups"}"#).unwrap();
        assert_eq!(cmd.kind(), "refresh_groups");
        assert_eq!(cmd.expected_channel(), IpcChannel::Tasks);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<IpcCommand>(r#"{"type":"rm_rf"}"#).is_err());
    }

    #[test]
    fn input_message_shape() {
        let json = serde_json::to_string(&InputMessage::new("more")).unwrap();
        assert_eq!(json, r#"{"type":"message","text":"more"}"#);
    }
}
