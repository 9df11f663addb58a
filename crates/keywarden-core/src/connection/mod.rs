//! Push channel to the authority.
//!
//! The authority streams rotation and degraded-mode notifications as
//! newline-delimited JSON over a long-lived authenticated response. The
//! [`ConnectionManager`] owns the reconnect loop and demultiplexes inbound
//! messages to the rotation scheduler and the degraded handler. The channel
//! is an optimization, not a correctness requirement: the scheduler's safety
//! rails keep the key current while the channel is down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::humantime_serde;
use crate::credential::CredentialCache;
use crate::degraded::{DegradedInfo, DegradedModeHandler, DegradedReason};
use crate::events::{AgentEvent, EventBus};
use crate::rotation::RotationScheduler;

/// Push channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Pause after a reconnect before the catch-up poll, letting the server
    /// finish replaying anything queued for this agent.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,

    /// First reconnect delay; doubles per consecutive failure.
    #[serde(with = "humantime_serde")]
    pub reconnect_base_delay: Duration,

    /// Reconnect delay ceiling.
    #[serde(with = "humantime_serde")]
    pub reconnect_max_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
        }
    }
}

impl ConnectionConfig {
    /// Delay before reconnect attempt `attempt` (zero-based).
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        self.reconnect_base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.reconnect_max_delay)
    }
}

/// Messages pushed by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// A managed key rotated server-side.
    #[serde(rename_all = "camelCase")]
    RotationEvent {
        /// Name of the rotated key.
        api_key_name: String,
        /// Prefix of the new value, for log correlation only.
        #[serde(default)]
        new_prefix: Option<String>,
        /// When the previous value stops being accepted.
        #[serde(default)]
        grace_expires_at: Option<DateTime<Utc>>,
    },
    /// The authority rejected this connection's credential at the
    /// application level.
    #[serde(rename_all = "camelCase")]
    DegradedConnection {
        /// Why the credential was rejected.
        reason: DegradedReason,
        /// Agent identity as the authority knows it.
        #[serde(default)]
        agent_id: Option<String>,
        /// Whether an operator-issued reprovision token can recover this
        /// agent.
        #[serde(default)]
        can_receive_reprovision: bool,
    },
    /// A reprovision token has been issued for this agent.
    #[serde(rename_all = "camelCase")]
    ReprovisionAvailable {
        /// When the token stops being claimable.
        expires_at: DateTime<Utc>,
    },
}

/// Push channel failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The authority rejected the credential at connect time.
    #[error("push channel rejected the credential")]
    Unauthorized,

    /// Transport-level failure (connect, read, or server error).
    #[error("push channel transport error: {0}")]
    Transport(String),

    /// The server sent a line that does not parse as a known message.
    #[error("malformed push message: {0}")]
    Malformed(String),
}

/// Connects authenticated push streams.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Opens a stream with the given credential.
    async fn connect(&self, credential: &SecretString)
        -> Result<Box<dyn PushStream>, ChannelError>;
}

/// A live push stream.
#[async_trait]
pub trait PushStream: Send {
    /// Next message, or `None` when the server closed the stream.
    async fn next_message(&mut self) -> Option<Result<PushMessage, ChannelError>>;
}

/// Production transport: newline-delimited JSON over a long-lived HTTP
/// response.
pub struct HttpPushTransport {
    client: reqwest::Client,
    events_url: String,
}

impl HttpPushTransport {
    /// Creates a transport streaming from `events_url`.
    #[must_use]
    pub fn new(client: reqwest::Client, events_url: impl Into<String>) -> Self {
        Self {
            client,
            events_url: events_url.into(),
        }
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn connect(
        &self,
        credential: &SecretString,
    ) -> Result<Box<dyn PushStream>, ChannelError> {
        let response = self
            .client
            .get(&self.events_url)
            .bearer_auth(credential.expose_secret())
            .send()
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ChannelError::Unauthorized);
        }
        if !status.is_success() {
            return Err(ChannelError::Transport(format!(
                "event stream returned {status}"
            )));
        }

        Ok(Box::new(HttpPushStream {
            body: response.bytes_stream().boxed(),
            buffer: Vec::new(),
            done: false,
        }))
    }
}

// Upper bound for one buffered line; a server streaming bytes with no
// newline must not grow the buffer without limit.
const MAX_LINE_BYTES: usize = 64 * 1024;

struct HttpPushStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Vec<u8>,
    done: bool,
}

#[async_trait]
impl PushStream for HttpPushStream {
    async fn next_message(&mut self) -> Option<Result<PushMessage, ChannelError>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some(parse_message(line));
            }
            if self.buffer.len() > MAX_LINE_BYTES {
                // Discard the oversized line; the reader resyncs at the next
                // newline.
                self.buffer.clear();
                return Some(Err(ChannelError::Malformed(format!(
                    "line exceeds {MAX_LINE_BYTES} bytes"
                ))));
            }
            if self.done {
                // Trailing data without a newline is still one message.
                if self.buffer.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let line = std::mem::take(&mut self.buffer);
                return Some(parse_message(&line));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => return Some(Err(ChannelError::Transport(err.to_string()))),
                None => self.done = true,
            }
        }
    }
}

fn parse_message(line: &[u8]) -> Result<PushMessage, ChannelError> {
    serde_json::from_slice(line).map_err(|err| ChannelError::Malformed(err.to_string()))
}

/// Owns the push channel lifecycle.
///
/// Cheap to clone; clones share the connection state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    transport: Arc<dyn PushTransport>,
    cache: Arc<CredentialCache>,
    scheduler: RotationScheduler,
    degraded: Arc<DegradedModeHandler>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Creates a manager. Nothing connects until [`ConnectionManager::start`].
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn PushTransport>,
        cache: Arc<CredentialCache>,
        scheduler: RotationScheduler,
        degraded: Arc<DegradedModeHandler>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                cache,
                scheduler,
                degraded,
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Spawns the connect/read/reconnect loop.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Inner::run(&inner).await;
        });
    }

    /// Stops the channel. The read loop exits at its next await point.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    async fn run(inner: &Arc<Self>) {
        let mut attempt: u32 = 0;
        let mut connected_before = false;
        loop {
            if inner.shutdown.is_cancelled() {
                return;
            }
            let credential = inner.cache.current();
            let connect = tokio::select! {
                () = inner.shutdown.cancelled() => return,
                result = inner.transport.connect(&credential) => result,
            };
            match connect {
                Ok(stream) => {
                    attempt = 0;
                    info!(reconnect = connected_before, "push channel connected");
                    inner.events.publish(AgentEvent::ChannelConnected);
                    if connected_before {
                        tokio::select! {
                            () = inner.shutdown.cancelled() => return,
                            () = tokio::time::sleep(inner.config.settle_delay) => {}
                        }
                        inner.scheduler.on_ws_reconnect().await;
                    }
                    connected_before = true;
                    Self::read_loop(inner, stream).await;
                    if inner.shutdown.is_cancelled() {
                        return;
                    }
                    inner.events.publish(AgentEvent::ChannelDisconnected);
                }
                Err(ChannelError::Unauthorized) => {
                    // Subscribe before escalating so a claim that lands
                    // during the rebind is not missed.
                    let parked = inner.events.subscribe();
                    if !inner.scheduler.on_ws_auth_failure().await {
                        Self::park(inner, parked).await;
                        attempt = 0;
                        continue;
                    }
                }
                Err(err) => {
                    warn!(%err, "push channel connect failed");
                }
            }
            let delay = inner.config.reconnect_delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(delay_secs = delay.as_secs(), "push channel reconnect scheduled");
            tokio::select! {
                () = inner.shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn read_loop(inner: &Arc<Self>, mut stream: Box<dyn PushStream>) {
        loop {
            let message = tokio::select! {
                () = inner.shutdown.cancelled() => return,
                message = stream.next_message() => message,
            };
            match message {
                Some(Ok(message)) => inner.dispatch(message),
                Some(Err(ChannelError::Malformed(err))) => {
                    // One bad line does not cost the connection.
                    warn!(%err, "ignoring malformed push message");
                }
                Some(Err(err)) => {
                    warn!(%err, "push channel read failed");
                    return;
                }
                None => {
                    info!("push channel closed by the server");
                    return;
                }
            }
        }
    }

    fn dispatch(&self, message: PushMessage) {
        match message {
            PushMessage::RotationEvent {
                api_key_name,
                new_prefix,
                ..
            } => {
                debug!(
                    key = %api_key_name,
                    prefix = new_prefix.as_deref().unwrap_or("-"),
                    "rotation event received"
                );
                self.scheduler.on_ws_rotation_event(&api_key_name);
            }
            PushMessage::DegradedConnection {
                reason,
                agent_id,
                can_receive_reprovision,
            } => {
                self.degraded.handle_degraded_connection(&DegradedInfo {
                    reason,
                    agent_id,
                    can_receive_reprovision,
                });
            }
            PushMessage::ReprovisionAvailable { expires_at } => {
                self.degraded.handle_reprovision_available(expires_at);
            }
        }
    }

    /// Waits for the stored credential to change before reconnecting.
    /// Reconnecting with a credential the authority just rejected twice
    /// would only burn the backoff budget.
    async fn park(
        inner: &Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<AgentEvent>,
    ) {
        info!("push channel parked until credentials change");
        loop {
            let event = tokio::select! {
                () = inner.shutdown.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(AgentEvent::CredentialsUpdated | AgentEvent::KeyRotated { .. }) => {
                    info!("credentials changed; push channel resuming");
                    return;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // Missed events may include the one we waited for.
                    return;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::binder::test_support::{response_with_key, MockBindClient};
    use crate::binder::{BindClient, BindError, KeyBinder};
    use crate::config::store::ConfigStore;
    use crate::degraded::test_support::MockReprovisionClient;
    use crate::rotation::SchedulerConfig;

    /// One scripted session: a connect failure, or a sequence of stream
    /// items followed by server close.
    type Session = Result<Vec<Result<PushMessage, ChannelError>>, ChannelError>;

    struct MockTransport {
        sessions: Mutex<VecDeque<Session>>,
        connects: AtomicUsize,
    }

    impl MockTransport {
        fn new(sessions: Vec<Session>) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
                connects: AtomicUsize::new(0),
            }
        }

        fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PushTransport for MockTransport {
        async fn connect(
            &self,
            _credential: &SecretString,
        ) -> Result<Box<dyn PushStream>, ChannelError> {
            let session = self.sessions.lock().unwrap().pop_front();
            let Some(session) = session else {
                // Script exhausted: hold the loop here.
                futures::future::pending::<()>().await;
                unreachable!()
            };
            self.connects.fetch_add(1, Ordering::SeqCst);
            session.map(|items| {
                Box::new(MockStream {
                    items: items.into(),
                    hold_open: true,
                }) as Box<dyn PushStream>
            })
        }
    }

    struct MockStream {
        items: VecDeque<Result<PushMessage, ChannelError>>,
        hold_open: bool,
    }

    #[async_trait]
    impl PushStream for MockStream {
        async fn next_message(&mut self) -> Option<Result<PushMessage, ChannelError>> {
            match self.items.pop_front() {
                Some(item) => Some(item),
                None if self.hold_open => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                None => None,
            }
        }
    }

    struct Fixture {
        manager: ConnectionManager,
        transport: Arc<MockTransport>,
        scheduler: RotationScheduler,
        degraded: Arc<DegradedModeHandler>,
        bind_client: Arc<MockBindClient>,
        events: EventBus,
        _dir: tempfile::TempDir,
    }

    fn fixture(
        sessions: Vec<Session>,
        bind_results: Vec<Result<crate::binder::BindResponse, BindError>>,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ConfigStore::open(&dir.path().join("state.json"), "svc-key", None).unwrap(),
        );
        let bind_client = Arc::new(MockBindClient::new(bind_results));
        let events = EventBus::default();
        let binder = Arc::new(KeyBinder::new(
            bind_client.clone() as Arc<dyn BindClient>,
            Arc::clone(&store),
            events.clone(),
            "svc-key",
        ));
        let degraded = Arc::new(DegradedModeHandler::new(
            Arc::new(MockReprovisionClient::new(vec![])),
            Arc::clone(&store),
            events.clone(),
            "agent-1",
        ));
        let scheduler =
            RotationScheduler::new(SchedulerConfig::default(), binder, Arc::clone(&degraded));
        let transport = Arc::new(MockTransport::new(sessions));
        let manager = ConnectionManager::new(
            ConnectionConfig::default(),
            transport.clone() as Arc<dyn PushTransport>,
            store.credential_cache(),
            scheduler.clone(),
            Arc::clone(&degraded),
            events.clone(),
        );
        Fixture {
            manager,
            transport,
            scheduler,
            degraded,
            bind_client,
            events,
            _dir: dir,
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn rotation_event(key: &str) -> PushMessage {
        PushMessage::RotationEvent {
            api_key_name: key.to_string(),
            new_prefix: Some("kw_ab".to_string()),
            grace_expires_at: None,
        }
    }

    #[test]
    fn messages_decode_from_json_lines() {
        let line = br#"{"type":"rotation_event","apiKeyName":"svc-key","newPrefix":"kw_ab"}"#;
        assert_eq!(
            parse_message(line).unwrap(),
            PushMessage::RotationEvent {
                api_key_name: "svc-key".to_string(),
                new_prefix: Some("kw_ab".to_string()),
                grace_expires_at: None,
            }
        );

        let line = br#"{"type":"degraded_connection","reason":"key_revoked","agentId":"agent-1","canReceiveReprovision":true}"#;
        assert_eq!(
            parse_message(line).unwrap(),
            PushMessage::DegradedConnection {
                reason: DegradedReason::KeyRevoked,
                agent_id: Some("agent-1".to_string()),
                can_receive_reprovision: true,
            }
        );

        assert!(matches!(
            parse_message(b"not json"),
            Err(ChannelError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn oversized_line_is_rejected_not_buffered() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from(vec![b'x'; MAX_LINE_BYTES + 1])),
            Ok(Bytes::from_static(
                b"\n{\"type\":\"reprovision_available\",\"expiresAt\":\"2026-08-26T12:00:00Z\"}\n",
            )),
        ];
        let mut stream = HttpPushStream {
            body: futures::stream::iter(chunks).boxed(),
            buffer: Vec::new(),
            done: false,
        };

        assert!(matches!(
            stream.next_message().await,
            Some(Err(ChannelError::Malformed(_)))
        ));
        // The reader resyncs at the next newline.
        assert!(matches!(
            stream.next_message().await,
            Some(Ok(PushMessage::ReprovisionAvailable { .. }))
        ));
        assert!(stream.next_message().await.is_none());
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let config = ConnectionConfig::default();
        assert_eq!(config.reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(config.reconnect_delay(5), Duration::from_secs(32));
        assert_eq!(config.reconnect_delay(12), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_event_is_routed_to_the_scheduler() {
        let fx = fixture(
            vec![Ok(vec![Ok(rotation_event("svc-key"))])],
            vec![Ok(response_with_key("kw_1"))],
        );
        fx.scheduler
            .start(&crate::config::store::ManagedKeyState::new("svc-key"));
        fx.manager.start();
        settle().await;

        let tracking = fx.scheduler.tracking();
        assert!(tracking.last_ws_event_at.is_some());
        assert_eq!(tracking.missed_rotations, 0);
        assert_eq!(fx.bind_client.call_count(), 1, "event triggered one bind");
        fx.manager.stop();
        fx.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_notification_enters_degraded_state() {
        let fx = fixture(
            vec![Ok(vec![Ok(PushMessage::DegradedConnection {
                reason: DegradedReason::KeyRevoked,
                agent_id: Some("agent-1".to_string()),
                can_receive_reprovision: true,
            })])],
            vec![],
        );
        fx.manager.start();
        settle().await;

        assert!(fx.degraded.is_degraded());
        assert_eq!(fx.degraded.state().reason, Some(DegradedReason::KeyRevoked));
        fx.manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn reprovision_availability_is_recorded() {
        let expires = Utc::now() + chrono::Duration::minutes(10);
        let fx = fixture(
            vec![Ok(vec![Ok(PushMessage::ReprovisionAvailable {
                expires_at: expires,
            })])],
            vec![],
        );
        fx.manager.start();
        settle().await;

        let state = fx.degraded.state();
        assert!(state.reprovision_available);
        assert_eq!(state.reprovision_expires_at, Some(expires));
        fx.manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_runs_catch_up_poll_after_settle_delay() {
        let fx = fixture(
            // First session closes immediately; second holds open.
            vec![
                Ok(vec![Err(ChannelError::Transport("reset".to_string()))]),
                Ok(vec![]),
            ],
            vec![Ok(response_with_key("kw_1"))],
        );
        fx.scheduler
            .start(&crate::config::store::ManagedKeyState::new("svc-key"));
        let mut events = fx.events.subscribe();
        fx.manager.start();

        // Session 1 connects and drops immediately.
        settle().await;
        assert_eq!(fx.transport.connect_count(), 1);
        assert_eq!(fx.bind_client.call_count(), 0);

        // 1s backoff, then session 2 connects and waits out the settle
        // delay before the catch-up bind.
        tokio::time::advance(Duration::from_millis(1_100)).await;
        settle().await;
        assert_eq!(fx.transport.connect_count(), 2);
        assert_eq!(fx.bind_client.call_count(), 0, "still inside settle delay");

        tokio::time::advance(Duration::from_millis(2_100)).await;
        settle().await;
        assert_eq!(fx.bind_client.call_count(), 1, "one catch-up bind");
        assert_eq!(events.recv().await.unwrap(), AgentEvent::ChannelConnected);
        fx.manager.stop();
        fx.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_parks_until_credentials_change() {
        let fx = fixture(
            vec![Err(ChannelError::Unauthorized), Ok(vec![])],
            // The escalation rebind is rejected too.
            vec![Err(BindError::Unauthorized)],
        );
        fx.scheduler
            .start(&crate::config::store::ManagedKeyState::new("svc-key"));
        fx.manager.start();
        settle().await;

        assert!(fx.degraded.is_degraded());
        assert_eq!(fx.transport.connect_count(), 1);

        // Nothing reconnects while parked, no matter how long we wait.
        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(fx.transport.connect_count(), 1);

        fx.events.publish(AgentEvent::CredentialsUpdated);
        settle().await;
        assert_eq!(fx.transport.connect_count(), 2);
        fx.manager.stop();
        fx.scheduler.stop();
    }
}
