//! Degraded-mode state and reprovision recovery.
//!
//! The agent enters degraded mode when the authority reports that its
//! credential was rejected. Authenticated polling is impossible with a dead
//! credential, so the handler waits passively for a `reprovision_available`
//! push and recovers through an unauthenticated, one-time-token claim.
//!
//! The common case (local value merely out of date) is recovered earlier, by
//! the same-key rebind the scheduler attempts on channel auth failure; this
//! handler covers the rarer case of a deliberately revoked credential.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::store::ConfigStore;
use crate::events::{AgentEvent, EventBus};

/// Why the authority rejected the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    /// The key passed its hard expiry.
    KeyExpired,
    /// The key was deliberately revoked.
    KeyRevoked,
    /// The key was administratively disabled.
    KeyDisabled,
    /// Authentication failed for an unspecified reason.
    AuthFailed,
}

impl std::fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::KeyExpired => "key_expired",
            Self::KeyRevoked => "key_revoked",
            Self::KeyDisabled => "key_disabled",
            Self::AuthFailed => "auth_failed",
        };
        f.write_str(s)
    }
}

/// Degraded notification payload from the push channel.
#[derive(Debug, Clone)]
pub struct DegradedInfo {
    /// Rejection reason.
    pub reason: DegradedReason,
    /// Agent identifier the authority associates with this agent.
    pub agent_id: Option<String>,
    /// Whether the authority may issue a reprovision token.
    pub can_receive_reprovision: bool,
}

/// Current degraded state. Process-lifetime; reconstructed fresh on start.
#[derive(Debug, Clone, Default)]
pub struct DegradedState {
    /// Whether the agent is degraded.
    pub is_degraded: bool,
    /// Rejection reason, when degraded.
    pub reason: Option<DegradedReason>,
    /// Agent identifier recorded from the notification.
    pub agent_id: Option<String>,
    /// Whether a reprovision token can be claimed.
    pub reprovision_available: bool,
    /// When the reprovision window closes.
    pub reprovision_expires_at: Option<DateTime<Utc>>,
}

/// Grant returned by a successful reprovision claim.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprovisionGrant {
    /// Whether the claim was accepted.
    pub success: bool,
    /// The brand-new credential.
    #[serde(default)]
    pub api_key: String,
    /// Identifier of the new key.
    #[serde(default)]
    pub key_id: String,
    /// Expiry of the new credential.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Claim failure taxonomy.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// The authority refused the token.
    #[error("reprovision claim rejected: {0}")]
    Rejected(String),

    /// Transport-level failure; the token may still be valid.
    #[error("reprovision network error: {0}")]
    Network(String),

    /// The response could not be interpreted.
    #[error("malformed reprovision response: {0}")]
    Malformed(String),

    /// Persisting the new credential failed.
    #[error("failed to persist reprovisioned key: {0}")]
    Storage(#[from] crate::config::store::StoreError),
}

/// Unauthenticated reprovision claim endpoint.
#[async_trait]
pub trait ReprovisionClient: Send + Sync {
    /// Claims a new credential with a one-time token.
    async fn claim(&self, agent_id: &str, token: &str) -> Result<ReprovisionGrant, ClaimError>;
}

/// Production claim client over HTTPS.
pub struct HttpReprovisionClient {
    client: reqwest::Client,
    claim_url: String,
}

impl HttpReprovisionClient {
    /// Creates a client posting to `claim_url`.
    #[must_use]
    pub fn new(client: reqwest::Client, claim_url: impl Into<String>) -> Self {
        Self {
            client,
            claim_url: claim_url.into(),
        }
    }
}

#[async_trait]
impl ReprovisionClient for HttpReprovisionClient {
    async fn claim(&self, agent_id: &str, token: &str) -> Result<ReprovisionGrant, ClaimError> {
        let response = self
            .client
            .post(&self.claim_url)
            .json(&serde_json::json!({ "agentId": agent_id, "token": token }))
            .send()
            .await
            .map_err(|e| ClaimError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClaimError::Rejected(format!("claim returned {status}")));
        }

        response
            .json::<ReprovisionGrant>()
            .await
            .map_err(|e| ClaimError::Malformed(e.to_string()))
    }
}

/// Reacts to credential-rejected notifications and performs the
/// reprovisioning handshake.
pub struct DegradedModeHandler {
    client: Arc<dyn ReprovisionClient>,
    store: Arc<ConfigStore>,
    events: EventBus,
    agent_id: String,
    state: Mutex<DegradedState>,
}

impl DegradedModeHandler {
    /// Creates a handler for the agent identified by `agent_id`.
    #[must_use]
    pub fn new(
        client: Arc<dyn ReprovisionClient>,
        store: Arc<ConfigStore>,
        events: EventBus,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            events,
            agent_id: agent_id.into(),
            state: Mutex::new(DegradedState::default()),
        }
    }

    /// Whether the agent is currently degraded.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.state.lock().expect("degraded lock poisoned").is_degraded
    }

    /// Snapshot of the degraded state.
    #[must_use]
    pub fn state(&self) -> DegradedState {
        self.state.lock().expect("degraded lock poisoned").clone()
    }

    /// Enters degraded state from a push notification.
    ///
    /// If the notification says reprovisioning is possible the handler starts
    /// waiting (passively) for a `reprovision_available` push; otherwise an
    /// operator must intervene.
    pub fn handle_degraded_connection(&self, info: &DegradedInfo) {
        let mut state = self.state.lock().expect("degraded lock poisoned");
        let was_degraded = state.is_degraded;
        state.is_degraded = true;
        state.reason = Some(info.reason);
        state.agent_id = info.agent_id.clone();
        drop(state);

        if info.can_receive_reprovision {
            warn!(
                reason = %info.reason,
                "credential rejected by authority; waiting for a reprovision offer"
            );
        } else {
            error!(
                reason = %info.reason,
                "credential rejected and reprovisioning is not offered; \
                 operator action required (issue a new key and set KEYWARDEN_API_KEY)"
            );
        }

        if !was_degraded {
            self.events
                .publish(AgentEvent::DegradedEntered { reason: info.reason });
        }
    }

    /// Enters degraded state after a rejected same-key rebind.
    pub fn record_auth_failure(&self) {
        self.handle_degraded_connection(&DegradedInfo {
            reason: DegradedReason::AuthFailed,
            agent_id: None,
            can_receive_reprovision: true,
        });
    }

    /// Records that a reprovision token may now be claimed.
    pub fn handle_reprovision_available(&self, expires_at: DateTime<Utc>) {
        let mut state = self.state.lock().expect("degraded lock poisoned");
        state.reprovision_available = true;
        state.reprovision_expires_at = Some(expires_at);
        drop(state);
        info!(%expires_at, "reprovision token available for claim");
    }

    /// Claims a one-time reprovision token.
    ///
    /// On success the returned credential is persisted (the same persistence
    /// step `KeyBinder` uses), `CredentialsUpdated` is published, and
    /// degraded state is cleared atomically. On failure the state is left
    /// untouched so the claim can be retried with a different token.
    ///
    /// # Errors
    ///
    /// Returns the claim failure as a structured error; this is a deliberate
    /// operator-triggered action, never silently swallowed.
    pub async fn claim_reprovision_token(&self, token: &str) -> Result<(), ClaimError> {
        let agent_id = {
            let state = self.state.lock().expect("degraded lock poisoned");
            state.agent_id.clone().unwrap_or_else(|| self.agent_id.clone())
        };

        let grant = self.client.claim(&agent_id, token).await?;
        if !grant.success || grant.api_key.is_empty() {
            return Err(ClaimError::Rejected(
                "authority did not issue a credential for this token".into(),
            ));
        }

        self.store
            .replace_api_key(&SecretString::from(grant.api_key))?;

        *self.state.lock().expect("degraded lock poisoned") = DegradedState::default();

        info!(key_id = %grant.key_id, "reprovision claim succeeded; degraded state cleared");
        self.events.publish(AgentEvent::CredentialsUpdated);
        self.events.publish(AgentEvent::DegradedCleared);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use secrecy::ExposeSecret;

    use super::test_support::MockReprovisionClient;
    use super::*;

    fn make_handler(
        client: MockReprovisionClient,
    ) -> (DegradedModeHandler, Arc<ConfigStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ConfigStore::open(&dir.path().join("state.json"), "svc-key", None).unwrap(),
        );
        let handler = DegradedModeHandler::new(
            Arc::new(client),
            Arc::clone(&store),
            EventBus::default(),
            "agent-1",
        );
        (handler, store, dir)
    }

    #[test]
    fn degraded_notification_records_reason() {
        let (handler, _store, _dir) = make_handler(MockReprovisionClient::new(vec![]));
        handler.handle_degraded_connection(&DegradedInfo {
            reason: DegradedReason::KeyRevoked,
            agent_id: Some("agent-remote".into()),
            can_receive_reprovision: true,
        });

        let state = handler.state();
        assert!(state.is_degraded);
        assert_eq!(state.reason, Some(DegradedReason::KeyRevoked));
        assert_eq!(state.agent_id.as_deref(), Some("agent-remote"));
        assert!(!state.reprovision_available);
    }

    #[tokio::test]
    async fn successful_claim_persists_key_and_clears_state() {
        let (handler, store, _dir) = make_handler(MockReprovisionClient::granting("kw_new"));
        handler.record_auth_failure();
        handler.handle_reprovision_available(Utc::now() + chrono::Duration::minutes(15));

        handler.claim_reprovision_token("one-time").await.unwrap();

        assert!(!handler.is_degraded());
        assert_eq!(
            store.credential_cache().current().expose_secret(),
            "kw_new"
        );
    }

    #[tokio::test]
    async fn failed_claim_leaves_state_untouched() {
        let (handler, store, _dir) = make_handler(MockReprovisionClient::new(vec![Err(
            ClaimError::Rejected("token spent".into()),
        )]));
        handler.record_auth_failure();

        let err = handler.claim_reprovision_token("stale").await.unwrap_err();
        assert!(matches!(err, ClaimError::Rejected(_)));
        assert!(handler.is_degraded(), "degraded until a claim succeeds");
        assert_eq!(store.credential_cache().current().expose_secret(), "");
    }

    #[tokio::test]
    async fn unsuccessful_grant_is_a_rejection() {
        let (handler, _store, _dir) =
            make_handler(MockReprovisionClient::new(vec![Ok(ReprovisionGrant {
                success: false,
                api_key: String::new(),
                key_id: String::new(),
                expires_at: None,
            })]));
        handler.record_auth_failure();

        let err = handler.claim_reprovision_token("t").await.unwrap_err();
        assert!(matches!(err, ClaimError::Rejected(_)));
        assert!(handler.is_degraded());
    }

    #[tokio::test]
    async fn claim_publishes_credentials_updated_then_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ConfigStore::open(&dir.path().join("state.json"), "svc-key", None).unwrap(),
        );
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let handler = DegradedModeHandler::new(
            Arc::new(MockReprovisionClient::granting("kw_new")),
            store,
            bus,
            "agent-1",
        );

        handler.claim_reprovision_token("one-time").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), AgentEvent::CredentialsUpdated);
        assert_eq!(rx.recv().await.unwrap(), AgentEvent::DegradedCleared);
    }
}
