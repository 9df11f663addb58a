//! Persisted agent state.
//!
//! One JSON file holds the credential (`auth.apiKey`) and the managed-key
//! rotation metadata. Updates are read-modify-write under one lock and land
//! on disk via temp-file + rename, so the file always contains either the
//! previous state or the new state, never a torn write. The in-process
//! [`CredentialCache`] is updated inside the same operation, so calls made
//! after a rotation see the new value immediately.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::credential::CredentialCache;

/// When the authority rotates a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RotationMode {
    /// Rotated on a fixed schedule published by the authority.
    #[default]
    Scheduled,
    /// Rotated when the key is used.
    OnUse,
    /// Rotated on every bind.
    OnBind,
}

/// Persisted rotation metadata for the managed key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedKeyState {
    /// Key name, as known to the authority.
    pub name: String,

    /// When the authority will next rotate the key, if published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_rotation_at: Option<DateTime<Utc>>,

    /// End of the grace window in which the previous value stays accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_expires_at: Option<DateTime<Utc>>,

    /// Rotation policy reported by the authority.
    #[serde(default)]
    pub rotation_mode: RotationMode,

    /// Time of the last successful bind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bind: Option<DateTime<Utc>>,
}

impl ManagedKeyState {
    /// Creates empty metadata for a named key.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_rotation_at: None,
            grace_expires_at: None,
            rotation_mode: RotationMode::default(),
            last_bind: None,
        }
    }
}

/// Credential section of the persisted state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    /// The managed API key value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Full persisted state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    /// Credential section.
    #[serde(default)]
    pub auth: AuthState,

    /// Managed-key rotation metadata.
    pub managed_key: ManagedKeyState,
}

/// Metadata persisted alongside a freshly bound key.
#[derive(Debug, Clone, Copy)]
pub struct BindMetadata {
    /// Next scheduled rotation, if the authority published one.
    pub next_rotation_at: Option<DateTime<Utc>>,
    /// End of the grace window for the previous value.
    pub grace_expires_at: Option<DateTime<Utc>>,
    /// Rotation policy in force.
    pub rotation_mode: RotationMode,
}

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("state file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The state file exists but is not valid JSON.
    #[error("state file is corrupt: {0}")]
    Parse(#[from] serde_json::Error),

    /// The atomic rename failed; the original file is untouched.
    #[error("failed to commit state file: {0}")]
    Persist(String),
}

/// Disk-backed store for [`PersistedState`] plus the live credential cache.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
    cache: Arc<CredentialCache>,
}

impl ConfigStore {
    /// Opens (or initialises) the state file for `key_name`.
    ///
    /// `env_override` takes precedence over the persisted key value for the
    /// live credential cache; it is not written back to disk until the next
    /// successful bind.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing state file cannot be read or parsed.
    pub fn open(
        path: &Path,
        key_name: &str,
        env_override: Option<SecretString>,
    ) -> Result<Self, StoreError> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let mut state: PersistedState = serde_json::from_str(&content)?;
            if state.managed_key.name != key_name {
                info!(
                    previous = %state.managed_key.name,
                    current = %key_name,
                    "managed key name changed; resetting rotation metadata"
                );
                state.managed_key = ManagedKeyState::new(key_name);
            }
            state
        } else {
            PersistedState {
                auth: AuthState::default(),
                managed_key: ManagedKeyState::new(key_name),
            }
        };

        let initial = env_override.unwrap_or_else(|| {
            SecretString::from(state.auth.api_key.clone().unwrap_or_default())
        });

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
            cache: Arc::new(CredentialCache::new(initial)),
        })
    }

    /// Returns the shared credential cache.
    #[must_use]
    pub fn credential_cache(&self) -> Arc<CredentialCache> {
        Arc::clone(&self.cache)
    }

    /// Returns a snapshot of the managed-key metadata.
    ///
    /// # Panics
    ///
    /// Panics if the state lock is poisoned.
    #[must_use]
    pub fn managed_key(&self) -> ManagedKeyState {
        self.state.lock().expect("state lock poisoned").managed_key.clone()
    }

    /// Persists a freshly bound key value and its rotation metadata, then
    /// updates the live credential cache.
    ///
    /// The disk write happens before the cache update; a failed write leaves
    /// both the file and the cache on the previous good value.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written. The original
    /// file is left untouched on failure.
    pub fn record_bind(&self, key: &SecretString, meta: BindMetadata) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("state lock poisoned");
        let mut next = state.clone();
        next.auth.api_key = Some(key.expose_secret().to_owned());
        next.managed_key.next_rotation_at = meta.next_rotation_at;
        next.managed_key.grace_expires_at = meta.grace_expires_at;
        next.managed_key.rotation_mode = meta.rotation_mode;
        next.managed_key.last_bind = Some(Utc::now());

        Self::write_atomic(&self.path, &next)?;
        *state = next;
        drop(state);

        self.cache.replace(SecretString::from(key.expose_secret().to_owned()));
        debug!(path = %self.path.display(), "persisted bound key and metadata");
        Ok(())
    }

    /// Replaces the credential without touching rotation metadata.
    ///
    /// Used by the reprovision claim, which yields a brand-new key whose
    /// rotation schedule is not yet known.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn replace_api_key(&self, key: &SecretString) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("state lock poisoned");
        let mut next = state.clone();
        next.auth.api_key = Some(key.expose_secret().to_owned());
        next.managed_key.next_rotation_at = None;
        next.managed_key.grace_expires_at = None;

        Self::write_atomic(&self.path, &next)?;
        *state = next;
        drop(state);

        self.cache.replace(SecretString::from(key.expose_secret().to_owned()));
        Ok(())
    }

    fn write_atomic(path: &Path, state: &PersistedState) -> Result<(), StoreError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, state)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|e| StoreError::Persist(e.to_string()))?;
        Ok(())
    }
}
