//! Agent configuration parsing.
//!
//! The agent reads one TOML file describing the remote authority endpoints,
//! the managed key, the rotation scheduler, the push channel, and the
//! optional supervised workload. Rotation metadata and the key value itself
//! are not configuration; they live in the persisted state file managed by
//! [`store`].

pub mod store;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::ConnectionConfig;
use crate::rotation::SchedulerConfig;
use crate::supervisor::WorkloadConfig;

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable identifier for this agent instance, used by the reprovision
    /// claim and reported in degraded notifications.
    pub agent_id: String,

    /// Path of the persisted state file (JSON).
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Remote authority endpoints.
    pub authority: AuthorityConfig,

    /// The managed key this agent keeps current.
    pub managed_key: ManagedKeySection,

    /// Rotation scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Push channel tuning.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Supervised workload. Absent means the agent only maintains the key.
    #[serde(default)]
    pub workload: Option<WorkloadConfig>,

    /// Vault endpoint for `vault` secret sources.
    #[serde(default)]
    pub vault: Option<VaultConfig>,
}

impl AgentConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a required field fails
    /// validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.trim().is_empty() {
            return Err(ConfigError::Validation("agent_id must not be empty".into()));
        }
        if self.managed_key.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "managed_key.name must not be empty".into(),
            ));
        }
        if let Some(workload) = &self.workload {
            if workload.command.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "workload.command must not be empty".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Remote authority endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Managed-key bind endpoint (authenticated POST).
    pub bind_url: String,

    /// Push event stream endpoint.
    pub events_url: String,

    /// Reprovision claim endpoint (unauthenticated POST).
    pub reprovision_url: String,
}

/// Static description of the managed key.
///
/// A key without a name is unrepresentable: `name` is a required field and
/// validated non-empty at load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedKeySection {
    /// Key name, as known to the authority.
    pub name: String,

    /// Optional file mirror for workloads that read the key from disk.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Mode bits applied to the mirror file (octal, e.g. `0o600`).
    #[serde(default)]
    pub file_mode: Option<u32>,

    /// Ownership applied to the mirror file.
    #[serde(default)]
    pub file_owner: Option<FileOwner>,
}

/// Numeric ownership for the key mirror file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FileOwner {
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
}

/// Vault connection settings for secret resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Vault base address.
    pub addr: String,

    /// Environment variable holding the vault token.
    #[serde(default = "default_vault_token_env")]
    pub token_env: String,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/keywarden/state.json")
}

fn default_vault_token_env() -> String {
    "VAULT_TOKEN".to_string()
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field failed validation.
    #[error("invalid config: {0}")]
    Validation(String),
}

pub(crate) mod humantime_serde {
    //! Serde adapter for human-readable durations ("30s", "5m").

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
