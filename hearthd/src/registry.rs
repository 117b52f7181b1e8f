//! In-memory view of registered groups, persisted through the store.
//!
//! Groups come into existence only here: an IPC `register_group` from the
//! primary namespace, or the startup bootstrap of the primary group.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use hearth_core::config::OrchestratorConfig;
use hearth_core::model::{RegisteredGroup, SandboxConfig, now_ts};
use hearth_core::store::Store;
use thiserror::Error;
use tracing::info;

use crate::router::normalize_trigger;
use crate::sandbox::policy::{is_valid_group_folder, sandbox_name};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("invalid group folder {0:?}")]
    InvalidFolder(String),
    #[error("folder {folder:?} already belongs to {owner}")]
    FolderTaken { folder: String, owner: String },
    #[error("{0} is already registered")]
    AlreadyRegistered(String),
    #[error("group jid and name must not be empty")]
    MissingField,
    #[error("invalid additional mount: {0}")]
    InvalidMount(String),
    #[error("failed to persist group: {0}")]
    Store(String),
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub jid: String,
    pub name: String,
    pub folder: String,
    pub trigger: Option<String>,
    pub sandbox: SandboxConfig,
    pub is_primary: bool,
}

#[derive(Default)]
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, RegisteredGroup>>,
}

impl GroupRegistry {
    pub fn load(store: &Store) -> anyhow::Result<Self> {
        let registry = Self::default();
        registry.reload(store)?;
        Ok(registry)
    }

    /// Replaces the in-memory view with what the store holds.
    pub fn reload(&self, store: &Store) -> anyhow::Result<usize> {
        let groups = store.get_all_registered_groups()?;
        let count = groups.len();
        let mut map = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        *map = groups.into_iter().map(|g| (g.jid.clone(), g)).collect();
        Ok(count)
    }

    pub fn get(&self, jid: &str) -> Option<RegisteredGroup> {
        self.read().get(jid).cloned()
    }

    pub fn by_folder(&self, folder: &str) -> Option<RegisteredGroup> {
        self.read().values().find(|g| g.folder == folder).cloned()
    }

    pub fn primary(&self) -> Option<RegisteredGroup> {
        self.read().values().find(|g| g.is_primary).cloned()
    }

    /// All groups, ordered by folder.
    pub fn all(&self) -> Vec<RegisteredGroup> {
        let mut groups: Vec<RegisteredGroup> = self.read().values().cloned().collect();
        groups.sort_by(|a, b| a.folder.cmp(&b.folder));
        groups
    }

    pub fn jids(&self) -> Vec<String> {
        let mut jids: Vec<String> = self.read().keys().cloned().collect();
        jids.sort();
        jids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Validates, persists and records a new group.
    pub fn register(&self, store: &Store, reg: Registration) -> Result<RegisteredGroup, RegistrationError> {
        let jid = reg.jid.trim();
        let name = reg.name.trim();
        if jid.is_empty() || name.is_empty() {
            return Err(RegistrationError::MissingField);
        }
        if !is_valid_group_folder(&reg.folder) {
            return Err(RegistrationError::InvalidFolder(reg.folder));
        }
        // Host paths are checked against the allowlist at spawn; only the
        // sandbox-side name is fixed here.
        for mount in &reg.sandbox.additional_mounts {
            sandbox_name(mount).map_err(|err| RegistrationError::InvalidMount(err.to_string()))?;
        }

        let mut map = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(jid) {
            return Err(RegistrationError::AlreadyRegistered(jid.to_string()));
        }
        if let Some(owner) = map.values().find(|g| g.folder == reg.folder) {
            return Err(RegistrationError::FolderTaken {
                folder: reg.folder,
                owner: owner.jid.clone(),
            });
        }
        let taken = store
            .folder_in_use(&reg.folder, jid)
            .map_err(|err| RegistrationError::Store(format!("{err:#}")))?;
        if taken {
            return Err(RegistrationError::FolderTaken {
                folder: reg.folder,
                owner: "another group".to_string(),
            });
        }

        let group = RegisteredGroup {
            jid: jid.to_string(),
            name: name.to_string(),
            folder: reg.folder,
            trigger: reg.trigger.as_deref().and_then(normalize_trigger),
            added_at: now_ts(),
            sandbox: reg.sandbox,
            is_primary: reg.is_primary,
        };
        store
            .set_registered_group(&group)
            .map_err(|err| RegistrationError::Store(format!("{err:#}")))?;
        map.insert(group.jid.clone(), group.clone());

        info!(
            jid = %group.jid,
            group = %group.folder,
            is_primary = group.is_primary,
            "group registered"
        );
        Ok(group)
    }

    /// Registers the configured primary group when none exists yet.
    pub fn bootstrap_primary(
        &self,
        store: &Store,
        config: &OrchestratorConfig,
    ) -> anyhow::Result<Option<RegisteredGroup>> {
        if self.primary().is_some() {
            return Ok(None);
        }
        let Some(bootstrap) = &config.primary_group else {
            return Ok(None);
        };
        let group = self.register(
            store,
            Registration {
                jid: bootstrap.jid.clone(),
                name: bootstrap.name.clone(),
                folder: config.main_group_folder.clone(),
                trigger: None,
                sandbox: bootstrap.sandbox.clone(),
                is_primary: true,
            },
        )?;
        Ok(Some(group))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RegisteredGroup>> {
        self.groups.read().unwrap_or_else(PoisonError::into_inner)
    }
}
