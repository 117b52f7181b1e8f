//! Sandbox wire protocol.
//!
//! - `SandboxInput`: JSON written once to the sandbox's stdin
//! - `SandboxOutput`: JSON frames read from stdout between the output sentinels

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Sentinel lines wrapping each result frame on the sandbox's stdout.
pub const OUTPUT_START_MARKER: &str = "---OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---OUTPUT_END---";

/// Input payload written to sandbox stdin as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInput {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_scheduled_task: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Delivered only through stdin. Never logged, never persisted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
}

/// One result frame emitted by the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxOutput {
    pub status: OutputStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, alias = "newSessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    Success,
    Error,
}

/// Host to sandbox bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

impl VolumeMount {
    pub fn new(host_path: impl Into<String>, container_path: impl Into<String>, readonly: bool) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            readonly,
        }
    }

    /// `-v` argument value for the container runtime.
    pub fn to_volume_arg(&self) -> String {
        if self.readonly {
            format!("{}:{}:ro", self.host_path, self.container_path)
        } else {
            format!("{}:{}", self.host_path, self.container_path)
        }
    }
}

/// Extracts complete sentinel-delimited frames from `buf`.
///
/// Returns the trimmed frame bodies and the number of bytes consumed. Bytes
/// after the last complete frame (an open start marker) stay with the caller.
pub fn extract_output_frames(buf: &str) -> (Vec<String>, usize) {
    let mut frames = Vec::new();
    let mut consumed = 0;

    while let Some(pos) = buf[consumed..].find(OUTPUT_START_MARKER) {
        let body_start = consumed + pos + OUTPUT_START_MARKER.len();
        let Some(end) = buf[body_start..].find(OUTPUT_END_MARKER) else {
            break;
        };
        let body_end = body_start + end;
        frames.push(buf[body_start..body_end].trim().to_string());
        consumed = body_end + OUTPUT_END_MARKER.len();
    }

    (frames, consumed)
}

pub fn parse_output_frame(body: &str) -> serde_json::Result<SandboxOutput> {
    serde_json::from_str(body)
}
