//! Managed-key bind operation.
//!
//! A *bind* exchanges the managed-key name for its current value and rotation
//! metadata, authenticated with the currently held credential. The remote
//! call sits behind the [`BindClient`] trait so rotation logic can be tested
//! against mock authorities; [`HttpBindClient`] is the production
//! implementation.
//!
//! [`KeyBinder`] wraps the client with the persistence contract: when a
//! bind's returned value differs from the held value, the new value and
//! metadata are persisted, the live credential cache is updated, and
//! `KeyRotated` is published. Each bind captures its own old/new pair
//! locally before persisting, so two binds' results never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::store::{BindMetadata, ConfigStore, RotationMode, StoreError};
use crate::credential::CredentialCache;
use crate::events::{AgentEvent, EventBus};

/// Which detection path triggered a bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindSource {
    /// Primary rotation timer.
    Scheduled,
    /// Push-channel rotation event.
    WsEvent,
    /// Grace-period safety-rail poll.
    GracePoll,
    /// Post-reconnect catch-up poll.
    Reconnect,
    /// Heartbeat staleness safety rail.
    Heartbeat,
    /// Operator-triggered refresh.
    Manual,
}

impl BindSource {
    /// Stable label for logs and counters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::WsEvent => "ws_event",
            Self::GracePoll => "grace_poll",
            Self::Reconnect => "reconnect",
            Self::Heartbeat => "heartbeat",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for BindSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response from the bind RPC.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindResponse {
    /// The current key value.
    pub key: String,

    /// Non-secret key prefix, safe to log.
    #[serde(default)]
    pub prefix: String,

    /// When this value expires.
    pub expires_at: DateTime<Utc>,

    /// End of the grace window for the previous value.
    #[serde(default)]
    pub grace_expires_at: Option<DateTime<Utc>>,

    /// Next scheduled rotation.
    #[serde(default)]
    pub next_rotation_at: Option<DateTime<Utc>>,

    /// Rotation policy in force for this key.
    #[serde(default)]
    pub rotation_mode: RotationMode,
}

/// Bind failure taxonomy.
#[derive(Debug, Error)]
pub enum BindError {
    /// The authority rejected the presented credential.
    #[error("bind rejected: credential is not authorized")]
    Unauthorized,

    /// Transport-level failure; retryable.
    #[error("bind network error: {0}")]
    Network(String),

    /// The authority answered with a server error; retryable.
    #[error("bind server error: {0}")]
    Server(String),

    /// The response could not be interpreted. Not retried blindly.
    #[error("malformed bind response: {0}")]
    Malformed(String),

    /// Persisting the bound key failed; the previous good state is intact.
    #[error("failed to persist bound key: {0}")]
    Storage(#[from] StoreError),
}

impl BindError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server(_) | Self::Storage(_))
    }
}

/// Remote bind endpoint.
#[async_trait]
pub trait BindClient: Send + Sync {
    /// Exchanges `key_name` for its current value and rotation metadata.
    async fn bind(
        &self,
        key_name: &str,
        credential: &SecretString,
    ) -> Result<BindResponse, BindError>;
}

/// Production bind client over HTTPS.
pub struct HttpBindClient {
    client: reqwest::Client,
    bind_url: String,
}

impl HttpBindClient {
    /// Creates a client posting to `bind_url`.
    #[must_use]
    pub fn new(client: reqwest::Client, bind_url: impl Into<String>) -> Self {
        Self {
            client,
            bind_url: bind_url.into(),
        }
    }
}

#[async_trait]
impl BindClient for HttpBindClient {
    async fn bind(
        &self,
        key_name: &str,
        credential: &SecretString,
    ) -> Result<BindResponse, BindError> {
        let response = self
            .client
            .post(&self.bind_url)
            .bearer_auth(credential.expose_secret())
            .json(&serde_json::json!({ "name": key_name }))
            .send()
            .await
            .map_err(|e| BindError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BindError::Unauthorized);
        }
        if !status.is_success() {
            return Err(BindError::Server(format!("bind returned {status}")));
        }

        response
            .json::<BindResponse>()
            .await
            .map_err(|e| BindError::Malformed(e.to_string()))
    }
}

/// Outcome of a successful bind.
#[derive(Debug, Clone)]
pub struct BindOutcome {
    /// True when the returned value differed from the held value.
    pub rotated: bool,
    /// True when no credential was held before this bind. The first bind
    /// acquires the key rather than observing a rotation of it.
    pub initial: bool,
    /// The full bind response.
    pub response: BindResponse,
}

/// Performs binds and owns the persistence step.
pub struct KeyBinder {
    client: Arc<dyn BindClient>,
    store: Arc<ConfigStore>,
    cache: Arc<CredentialCache>,
    events: EventBus,
    key_name: String,
    rotation_counts: Mutex<HashMap<BindSource, u64>>,
}

impl KeyBinder {
    /// Creates a binder for `key_name`.
    #[must_use]
    pub fn new(
        client: Arc<dyn BindClient>,
        store: Arc<ConfigStore>,
        events: EventBus,
        key_name: impl Into<String>,
    ) -> Self {
        let cache = store.credential_cache();
        Self {
            client,
            store,
            cache,
            events,
            key_name: key_name.into(),
            rotation_counts: Mutex::new(HashMap::new()),
        }
    }

    /// The managed key name this binder serves.
    #[must_use]
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Performs one bind attributed to `source`.
    ///
    /// On success the key value and metadata are persisted and, if the value
    /// changed, `KeyRotated` is published. On `Unauthorized` the credential
    /// is marked stale and explicit recovery instructions are logged; this
    /// method never retries, the caller decides whether to escalate.
    ///
    /// # Errors
    ///
    /// Returns the bind failure; a failed bind never overwrites the
    /// previously persisted value.
    pub async fn bind(&self, source: BindSource) -> Result<BindOutcome, BindError> {
        let old = self.cache.current();
        let response = match self.client.bind(&self.key_name, &old).await {
            Ok(response) => response,
            Err(BindError::Unauthorized) => {
                this_credential_rejected(&self.key_name);
                self.cache.mark_stale();
                return Err(BindError::Unauthorized);
            }
            Err(err) => {
                debug!(key = %self.key_name, source = %source, %err, "bind failed");
                return Err(err);
            }
        };

        if response.key.is_empty() {
            error!(
                key = %self.key_name,
                "bind response contained an empty key; keeping previous value"
            );
            return Err(BindError::Malformed("empty key in response".into()));
        }

        let initial = old.expose_secret().is_empty();
        let rotated = response.key != old.expose_secret();
        let new_value = SecretString::from(response.key.clone());
        self.store.record_bind(
            &new_value,
            BindMetadata {
                next_rotation_at: response.next_rotation_at,
                grace_expires_at: response.grace_expires_at,
                rotation_mode: response.rotation_mode,
            },
        )?;

        if rotated {
            info!(
                key = %self.key_name,
                prefix = %response.prefix,
                source = %source,
                "managed key rotated"
            );
            self.rotation_counts
                .lock()
                .expect("counter lock poisoned")
                .entry(source)
                .and_modify(|c| *c += 1)
                .or_insert(1);
            self.events.publish(AgentEvent::KeyRotated {
                key_name: self.key_name.clone(),
                source,
            });
        } else {
            debug!(key = %self.key_name, source = %source, "bind confirmed current value");
        }

        Ok(BindOutcome {
            rotated,
            initial,
            response,
        })
    }

    /// Snapshot of rotation counts per source.
    #[must_use]
    pub fn rotation_counts(&self) -> HashMap<BindSource, u64> {
        self.rotation_counts
            .lock()
            .expect("counter lock poisoned")
            .clone()
    }
}

fn this_credential_rejected(key_name: &str) {
    error!(
        key = %key_name,
        "the authority rejected this agent's credential. The agent will try to \
         recover by rebinding and, if a reprovision token is issued, by claiming \
         it. To recover manually, drop an issued reprovision token into the \
         token file next to the state file, or set KEYWARDEN_API_KEY and \
         restart the agent."
    );
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::test_support::{MockBindClient, response_with_key};
    use super::*;

    fn make_binder(client: MockBindClient) -> (KeyBinder, Arc<ConfigStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ConfigStore::open(&dir.path().join("state.json"), "svc-key", None).unwrap(),
        );
        let binder = KeyBinder::new(
            Arc::new(client),
            Arc::clone(&store),
            EventBus::default(),
            "svc-key",
        );
        (binder, store, dir)
    }

    #[tokio::test]
    async fn first_bind_is_a_rotation() {
        let client = MockBindClient::new(vec![Ok(response_with_key("kw_1"))]);
        let (binder, store, _dir) = make_binder(client);

        let outcome = binder.bind(BindSource::Scheduled).await.unwrap();
        assert!(outcome.rotated);
        assert!(outcome.initial, "no credential was held before this bind");
        assert_eq!(
            store.credential_cache().current().expose_secret(),
            "kw_1"
        );
        assert_eq!(binder.rotation_counts()[&BindSource::Scheduled], 1);
    }

    #[tokio::test]
    async fn unchanged_value_is_not_a_rotation() {
        let client = MockBindClient::new(vec![
            Ok(response_with_key("kw_1")),
            Ok(response_with_key("kw_1")),
        ]);
        let (binder, _store, _dir) = make_binder(client);

        binder.bind(BindSource::Scheduled).await.unwrap();
        let outcome = binder.bind(BindSource::GracePoll).await.unwrap();
        assert!(!outcome.rotated);
        assert!(!outcome.initial);
        assert!(!binder.rotation_counts().contains_key(&BindSource::GracePoll));
    }

    #[tokio::test]
    async fn failed_bind_keeps_previous_value() {
        let client = MockBindClient::new(vec![
            Ok(response_with_key("kw_good")),
            Err(BindError::Network("boom".into())),
        ]);
        let (binder, store, _dir) = make_binder(client);

        binder.bind(BindSource::Scheduled).await.unwrap();
        let err = binder.bind(BindSource::Scheduled).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            store.credential_cache().current().expose_secret(),
            "kw_good",
            "a failed bind never overwrites a good value"
        );
    }

    #[tokio::test]
    async fn unauthorized_marks_credential_stale() {
        let client = MockBindClient::new(vec![Err(BindError::Unauthorized)]);
        let (binder, store, _dir) = make_binder(client);

        let err = binder.bind(BindSource::Heartbeat).await.unwrap_err();
        assert!(matches!(err, BindError::Unauthorized));
        assert!(store.credential_cache().is_stale());
    }

    #[tokio::test]
    async fn empty_key_is_malformed_and_aborts() {
        let mut bad = response_with_key("");
        bad.prefix = String::new();
        let client = MockBindClient::new(vec![Ok(response_with_key("kw_good")), Ok(bad)]);
        let (binder, store, _dir) = make_binder(client);

        binder.bind(BindSource::Scheduled).await.unwrap();
        let err = binder.bind(BindSource::Scheduled).await.unwrap_err();
        assert!(matches!(err, BindError::Malformed(_)));
        assert_eq!(
            store.credential_cache().current().expose_secret(),
            "kw_good"
        );
    }

    #[tokio::test]
    async fn rotation_publishes_event() {
        let client = MockBindClient::new(vec![Ok(response_with_key("kw_1"))]);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ConfigStore::open(&dir.path().join("state.json"), "svc-key", None).unwrap(),
        );
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let binder = KeyBinder::new(Arc::new(client), store, bus, "svc-key");

        binder.bind(BindSource::WsEvent).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            AgentEvent::KeyRotated {
                key_name: "svc-key".into(),
                source: BindSource::WsEvent,
            }
        );
    }
}
