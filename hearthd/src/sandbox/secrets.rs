//! Credential loading for sandbox invocations.
//!
//! Secrets reach the sandbox only through its stdin payload. They are never
//! placed in args, environment or files, and every copy held here is zeroed
//! when it is dropped.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use anyhow::Context;
use hearth_core::protocol::SandboxInput;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

const OAUTH_TOKEN_KEY: &str = "CLAUDE_CODE_OAUTH_TOKEN";
const API_KEY_KEY: &str = "ANTHROPIC_API_KEY";

/// Selected credentials for one invocation. Values are zeroed on drop.
#[derive(Default)]
pub struct SecretBundle {
    values: BTreeMap<String, String>,
}

impl SecretBundle {
    /// Reads `keys` from `{project_root}/.env`. Falls back to the agent's OAuth
    /// credential file when neither an OAuth token nor an API key is present.
    pub fn load(project_root: &Path, keys: &[String]) -> Self {
        let mut bundle = Self {
            values: read_env_file(&project_root.join(".env"), keys),
        };
        if !bundle.values.contains_key(OAUTH_TOKEN_KEY) && !bundle.values.contains_key(API_KEY_KEY) {
            if let Some(token) = read_oauth_credentials() {
                bundle.values.insert(OAUTH_TOKEN_KEY.to_string(), token);
            }
        }
        bundle
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Serializes `input` with these secrets attached. The returned buffer is
    /// zeroed when dropped; the bundle is consumed and zeroed here.
    pub fn into_payload(mut self, mut input: SandboxInput) -> anyhow::Result<Zeroizing<Vec<u8>>> {
        input.secrets = std::mem::take(&mut self.values);
        let encoded = serde_json::to_vec(&input).context("encode sandbox input");
        for value in input.secrets.values_mut() {
            value.zeroize();
        }
        Ok(Zeroizing::new(encoded?))
    }
}

impl Drop for SecretBundle {
    fn drop(&mut self) {
        for value in self.values.values_mut() {
            value.zeroize();
        }
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Parses a `.env` file and returns only the requested keys.
/// Nothing is loaded into the process environment.
fn read_env_file(env_path: &Path, keys: &[String]) -> BTreeMap<String, String> {
    let Ok(mut content) = std::fs::read_to_string(env_path) else {
        debug!(path = %env_path.display(), ".env file not found");
        return BTreeMap::new();
    };

    let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
    let mut result = BTreeMap::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let key = key.trim().trim_start_matches("export ").trim();
        if !wanted.contains(key) {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        if !value.is_empty() {
            result.insert(key.to_string(), value.to_string());
        }
    }

    content.zeroize();
    result
}

/// Reads the OAuth access token from `~/.claude/.credentials.json`.
fn read_oauth_credentials() -> Option<String> {
    let home = std::env::var("HOME").ok()?;
    let path = Path::new(&home).join(".claude/.credentials.json");
    let raw = Zeroizing::new(std::fs::read_to_string(&path).ok()?);
    let data: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let token = data.get("claudeAiOauth")?.get("accessToken")?.as_str()?;
    if token.is_empty() {
        return None;
    }
    debug!("read OAuth token from credentials file");
    Some(token.to_string())
}
