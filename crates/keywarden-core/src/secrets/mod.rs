//! Workload secret resolution.
//!
//! Each supervised workload declares the secrets it needs as
//! [`ExecSecret`] entries. Resolution happens at every process start and
//! restart so the child always sees current values: literals pass through,
//! vault references are fetched through a [`VaultClient`], and the managed
//! key comes from the in-process credential cache.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::config::VaultConfig;
use crate::credential::CredentialCache;

/// Where a secret value comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecretSource {
    /// A value stored directly in the agent config.
    Literal {
        /// The value itself.
        value: String,
    },
    /// A value fetched from vault at resolution time.
    Vault {
        /// Secret path below the KV mount.
        path: String,
        /// Field inside the secret.
        key: String,
    },
    /// The managed key this agent keeps current.
    ManagedKey,
}

impl SecretSource {
    /// Cache identifier for per-cycle deduplication. Only vault reads are
    /// cached; the other sources are already in memory.
    fn cache_id(&self) -> Option<(String, String)> {
        match self {
            Self::Vault { path, key } => Some((path.clone(), key.clone())),
            Self::Literal { .. } | Self::ManagedKey => None,
        }
    }
}

/// One secret exported to the workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSecret {
    /// Environment variable name.
    pub env_var: String,

    /// Where the value comes from.
    pub source: SecretSource,

    /// When set, the value is written to a 0600 temp file and the child
    /// receives `<ENV_VAR>_FILE=<path>` instead of the value itself.
    #[serde(default)]
    pub file_mode: bool,
}

/// Secret resolution failures.
#[derive(Debug, Error)]
pub enum SecretError {
    /// A `vault` source is declared but no vault endpoint is configured.
    #[error("secret {0} uses a vault source but no vault is configured")]
    VaultNotConfigured(String),

    /// The vault token environment variable is unset.
    #[error("vault token environment variable {0} is not set")]
    MissingToken(String),

    /// The vault read failed.
    #[error("vault read failed for {path}: {message}")]
    Vault {
        /// Secret path that failed.
        path: String,
        /// Failure detail.
        message: String,
    },

    /// Writing a file-mode secret failed.
    #[error("failed to write secret file for {0}: {1}")]
    File(String, #[source] std::io::Error),
}

/// Reads secrets from vault.
#[async_trait]
pub trait VaultClient: Send + Sync {
    /// Reads field `key` of the secret at `path`.
    async fn read(&self, path: &str, key: &str) -> Result<SecretString, SecretError>;
}

/// KV v2 vault client over HTTP.
pub struct HttpVaultClient {
    client: reqwest::Client,
    addr: String,
    token: SecretString,
}

impl HttpVaultClient {
    /// Creates a client from config, reading the token from the configured
    /// environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::MissingToken`] when the variable is unset.
    pub fn from_config(client: reqwest::Client, config: &VaultConfig) -> Result<Self, SecretError> {
        let token = std::env::var(&config.token_env)
            .map_err(|_| SecretError::MissingToken(config.token_env.clone()))?;
        Ok(Self {
            client,
            addr: config.addr.trim_end_matches('/').to_string(),
            token: SecretString::from(token),
        })
    }
}

#[async_trait]
impl VaultClient for HttpVaultClient {
    async fn read(&self, path: &str, key: &str) -> Result<SecretString, SecretError> {
        let url = format!("{}/v1/{path}", self.addr);
        let vault_err = |message: String| SecretError::Vault {
            path: path.to_string(),
            message,
        };

        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", self.token.expose_secret())
            .send()
            .await
            .map_err(|err| vault_err(err.to_string()))?;
        if !response.status().is_success() {
            return Err(vault_err(format!("vault returned {}", response.status())));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| vault_err(err.to_string()))?;

        // KV v2 nests fields under data.data; v1 puts them under data.
        let fields = body
            .get("data")
            .map(|data| data.get("data").unwrap_or(data))
            .ok_or_else(|| vault_err("response has no data".to_string()))?;
        let value = fields
            .get(key)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| vault_err(format!("field {key} missing or not a string")))?;
        Ok(SecretString::from(value.to_string()))
    }
}

/// A file-mode secret on disk. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct SecretFile {
    /// Environment variable carrying the file path (`<VAR>_FILE`).
    pub env_var: String,
    file: NamedTempFile,
}

impl SecretFile {
    /// Path of the secret file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// The resolved environment for one process start.
///
/// Holds the file-mode temp files open; keep this alive for the lifetime of
/// the child process.
#[derive(Debug, Default)]
pub struct ResolvedSecrets {
    env: Vec<(String, SecretString)>,
    files: Vec<SecretFile>,
}

impl ResolvedSecrets {
    /// Environment entries to set on the child, values exposed.
    pub fn env_vars(&self) -> impl Iterator<Item = (&str, &str)> {
        let values = self
            .env
            .iter()
            .map(|(name, value)| (name.as_str(), value.expose_secret()));
        let files = self.files.iter().map(|file| {
            (
                file.env_var.as_str(),
                file.path().to_str().unwrap_or_default(),
            )
        });
        values.chain(files)
    }

    /// File-mode secrets currently on disk.
    #[must_use]
    pub fn files(&self) -> &[SecretFile] {
        &self.files
    }
}

/// Resolves [`ExecSecret`] lists into a child environment.
pub struct SecretResolver {
    vault: Option<Arc<dyn VaultClient>>,
    cache: Arc<CredentialCache>,
}

impl SecretResolver {
    /// Creates a resolver. `vault` may be absent when no workload secret
    /// uses a vault source.
    #[must_use]
    pub fn new(vault: Option<Arc<dyn VaultClient>>, cache: Arc<CredentialCache>) -> Self {
        Self { vault, cache }
    }

    /// Resolves every secret for one process start.
    ///
    /// Vault reads are deduplicated within the cycle by `(path, key)` so a
    /// secret referenced by several entries is fetched once.
    ///
    /// # Errors
    ///
    /// Returns the first resolution failure; nothing is exported partially.
    pub async fn resolve(&self, secrets: &[ExecSecret]) -> Result<ResolvedSecrets, SecretError> {
        let mut cycle_cache: HashMap<(String, String), SecretString> = HashMap::new();
        let mut resolved = ResolvedSecrets::default();

        for secret in secrets {
            let value = self.resolve_one(secret, &mut cycle_cache).await?;
            if secret.file_mode {
                resolved.files.push(write_secret_file(secret, &value)?);
            } else {
                resolved.env.push((secret.env_var.clone(), value));
            }
        }
        debug!(
            env = resolved.env.len(),
            files = resolved.files.len(),
            "workload secrets resolved"
        );
        Ok(resolved)
    }

    async fn resolve_one(
        &self,
        secret: &ExecSecret,
        cycle_cache: &mut HashMap<(String, String), SecretString>,
    ) -> Result<SecretString, SecretError> {
        if let Some(id) = secret.source.cache_id() {
            if let Some(cached) = cycle_cache.get(&id) {
                return Ok(SecretString::from(cached.expose_secret().to_owned()));
            }
        }
        let value = match &secret.source {
            SecretSource::Literal { value } => SecretString::from(value.clone()),
            SecretSource::ManagedKey => self.cache.current(),
            SecretSource::Vault { path, key } => {
                let vault = self
                    .vault
                    .as_ref()
                    .ok_or_else(|| SecretError::VaultNotConfigured(secret.env_var.clone()))?;
                let value = vault.read(path, key).await?;
                cycle_cache.insert(
                    (path.clone(), key.clone()),
                    SecretString::from(value.expose_secret().to_owned()),
                );
                value
            }
        };
        Ok(value)
    }
}

fn write_secret_file(secret: &ExecSecret, value: &SecretString) -> Result<SecretFile, SecretError> {
    let file_err = |err: std::io::Error| SecretError::File(secret.env_var.clone(), err);

    let mut file = NamedTempFile::new().map_err(file_err)?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))
        .map_err(file_err)?;
    file.write_all(value.expose_secret().as_bytes())
        .map_err(file_err)?;
    file.flush().map_err(file_err)?;
    Ok(SecretFile {
        env_var: format!("{}_FILE", secret.env_var),
        file,
    })
}
