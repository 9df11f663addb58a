//! Rotation scheduling with redundant safety rails.
//!
//! The primary timer refreshes the managed key shortly before the authority's
//! published rotation time. Because the push channel can drop events, two
//! more detection mechanisms run alongside it:
//!
//! - **grace-period poll**: fires inside the grace window left by the last
//!   bind, but only if no push rotation event has been observed since it was
//!   scheduled;
//! - **heartbeat monitor**: fixed-interval check that the expected rotation
//!   time has not silently passed.
//!
//! A third rail, the post-reconnect poll, is driven by the connection
//! manager through [`RotationScheduler::on_ws_reconnect`].
//!
//! Every timer holds a `CancellationToken` and is cancelled before being
//! rescheduled, so there is never more than one pending timer per purpose.
//! An in-flight guard around the refresh path guarantees at most one
//! concurrent bind no matter which rail fires.

mod tracking;

pub use tracking::RotationTracking;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binder::{BindError, BindSource, KeyBinder};
use crate::config::store::ManagedKeyState;
use crate::degraded::DegradedModeHandler;

/// Rotation scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How far ahead of the published rotation time to refresh.
    #[serde(default = "default_refresh_lead_time")]
    #[serde(with = "crate::config::humantime_serde")]
    pub refresh_lead_time: Duration,

    /// Never refresh more often than this.
    #[serde(default = "default_min_interval")]
    #[serde(with = "crate::config::humantime_serde")]
    pub min_interval: Duration,

    /// Primary interval when the authority publishes no schedule at all.
    #[serde(default = "default_fallback_interval")]
    #[serde(with = "crate::config::humantime_serde")]
    pub fallback_interval: Duration,

    /// Primary-timer delay after a failed bind.
    #[serde(default = "default_retry_delay")]
    #[serde(with = "crate::config::humantime_serde")]
    pub retry_delay: Duration,

    /// Floor for the grace-poll delay, also its retry delay on failure.
    #[serde(default = "default_min_grace_poll_delay")]
    #[serde(with = "crate::config::humantime_serde")]
    pub min_grace_poll_delay: Duration,

    /// Heartbeat monitor interval.
    #[serde(default = "default_heartbeat_interval")]
    #[serde(with = "crate::config::humantime_serde")]
    pub heartbeat_interval: Duration,

    /// How far past the expected rotation time counts as stale.
    #[serde(default = "default_staleness_threshold")]
    #[serde(with = "crate::config::humantime_serde")]
    pub staleness_threshold: Duration,

    /// Base delay for push-event refresh retries.
    #[serde(default = "default_ws_retry_base")]
    #[serde(with = "crate::config::humantime_serde")]
    pub ws_retry_base: Duration,

    /// Cap for push-event refresh retries.
    #[serde(default = "default_ws_retry_cap")]
    #[serde(with = "crate::config::humantime_serde")]
    pub ws_retry_cap: Duration,

    /// Maximum push-event refresh attempts.
    #[serde(default = "default_ws_retry_attempts")]
    pub ws_retry_attempts: u32,
}

const fn default_refresh_lead_time() -> Duration {
    Duration::from_secs(30)
}
const fn default_min_interval() -> Duration {
    Duration::from_secs(60)
}
const fn default_fallback_interval() -> Duration {
    Duration::from_secs(300)
}
const fn default_retry_delay() -> Duration {
    Duration::from_secs(30)
}
const fn default_min_grace_poll_delay() -> Duration {
    Duration::from_secs(30)
}
const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(60)
}
const fn default_staleness_threshold() -> Duration {
    Duration::from_secs(60)
}
const fn default_ws_retry_base() -> Duration {
    Duration::from_secs(1)
}
const fn default_ws_retry_cap() -> Duration {
    Duration::from_secs(60)
}
const fn default_ws_retry_attempts() -> u32 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_lead_time: default_refresh_lead_time(),
            min_interval: default_min_interval(),
            fallback_interval: default_fallback_interval(),
            retry_delay: default_retry_delay(),
            min_grace_poll_delay: default_min_grace_poll_delay(),
            heartbeat_interval: default_heartbeat_interval(),
            staleness_threshold: default_staleness_threshold(),
            ws_retry_base: default_ws_retry_base(),
            ws_retry_cap: default_ws_retry_cap(),
            ws_retry_attempts: default_ws_retry_attempts(),
        }
    }
}

impl SchedulerConfig {
    /// Exponential retry delay for push-event refresh attempt `attempt`
    /// (1-based), capped.
    #[must_use]
    pub fn ws_retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.ws_retry_base
            .saturating_mul(factor)
            .min(self.ws_retry_cap)
    }
}

/// Result of one refresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A bind completed; true when the key value changed.
    Completed {
        /// Whether this bind was a rotation event.
        rotated: bool,
    },
    /// Another bind was already in flight; nothing was done.
    Skipped,
}

/// Drives binds from timers and push events.
#[derive(Clone)]
pub struct RotationScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    binder: Arc<KeyBinder>,
    degraded: Arc<DegradedModeHandler>,
    tracking: Mutex<RotationTracking>,
    primary_timer: Mutex<Option<CancellationToken>>,
    grace_timer: Mutex<Option<CancellationToken>>,
    refresh_guard: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl RotationScheduler {
    /// Creates a scheduler. Timers are armed by [`RotationScheduler::start`].
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        binder: Arc<KeyBinder>,
        degraded: Arc<DegradedModeHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                binder,
                degraded,
                tracking: Mutex::new(RotationTracking::default()),
                primary_timer: Mutex::new(None),
                grace_timer: Mutex::new(None),
                refresh_guard: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Arms the primary timer from persisted metadata and starts the
    /// heartbeat monitor.
    pub fn start(&self, persisted: &ManagedKeyState) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("rotation scheduler started");
        self.schedule_from(persisted);
        Inner::spawn_heartbeat(&self.inner);
    }

    /// Re-seeds tracking and timers from metadata outside the bind path,
    /// for example after a reprovision cleared the schedule.
    pub fn schedule_from(&self, meta: &ManagedKeyState) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut tracking = self.inner.tracking.lock().expect("tracking lock poisoned");
            tracking.expected_rotation_at = meta.next_rotation_at;
            tracking.grace_expires_at = meta.grace_expires_at;
        }

        let delay = self
            .inner
            .primary_delay(meta.next_rotation_at, meta.grace_expires_at);
        debug!(delay_secs = delay.as_secs(), "primary refresh scheduled");
        Inner::arm_primary(&self.inner, delay);
        if let Some(grace) = meta.grace_expires_at {
            if let Some(delay) = self.inner.grace_delay(grace) {
                Inner::arm_grace(&self.inner, delay);
            }
        }
    }

    /// Cancels all timers and stops accepting refreshes. In-flight binds may
    /// complete; their results are discarded.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        Inner::cancel_timer(&self.inner.primary_timer);
        Inner::cancel_timer(&self.inner.grace_timer);
    }

    /// Performs one refresh attributed to `source`.
    ///
    /// # Errors
    ///
    /// Returns the bind failure. The primary timer is rescheduled with a
    /// short retry delay on failure.
    pub async fn refresh(&self, source: BindSource) -> Result<RefreshOutcome, BindError> {
        Inner::refresh(&self.inner, source).await
    }

    /// Handles a push rotation event for `key_name`.
    ///
    /// Records the event, then refreshes with retries so a transient network
    /// blip around a rotation does not silently lose the event.
    pub fn on_ws_rotation_event(&self, key_name: &str) {
        if key_name != self.inner.binder.key_name() {
            debug!(key = %key_name, "rotation event for a key this agent does not manage");
            return;
        }
        self.inner
            .tracking
            .lock()
            .expect("tracking lock poisoned")
            .record_ws_event(Utc::now());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Inner::refresh_with_retry(&inner, BindSource::WsEvent).await;
        });
    }

    /// Post-reconnect catch-up poll: rotations may have happened while the
    /// channel was down.
    pub async fn on_ws_reconnect(&self) {
        if let Err(err) = Inner::refresh(&self.inner, BindSource::Reconnect).await {
            warn!(%err, "post-reconnect refresh failed; primary timer will retry");
        }
    }

    /// Escalation path for a push-channel authentication failure.
    ///
    /// Attempts a same-key rebind; this recovers the common case where the
    /// locally cached credential is merely out of date. Returns true when the
    /// channel may reconnect with the (possibly refreshed) credential. Only
    /// an authority rejection returns false: the degraded handler takes over
    /// and the channel parks until the credential changes. Transient rebind
    /// failures return true so the channel keeps its normal backoff.
    pub async fn on_ws_auth_failure(&self) -> bool {
        warn!("push channel authentication failed; attempting same-key rebind");
        match Inner::refresh(&self.inner, BindSource::Reconnect).await {
            Ok(_) => true,
            Err(BindError::Unauthorized) => {
                self.inner.degraded.record_auth_failure();
                false
            }
            Err(err) => {
                // Transient failure, not a verdict on the credential. Let the
                // channel keep its normal backoff cycle.
                warn!(%err, "rebind after channel auth failure did not complete");
                true
            }
        }
    }

    /// Snapshot of the tracking state.
    #[must_use]
    pub fn tracking(&self) -> RotationTracking {
        self.inner
            .tracking
            .lock()
            .expect("tracking lock poisoned")
            .clone()
    }
}

impl Inner {
    /// Single refresh path shared by every rail; the guard admits one bind
    /// at a time.
    async fn refresh(inner: &Arc<Self>, source: BindSource) -> Result<RefreshOutcome, BindError> {
        if !inner.running.load(Ordering::SeqCst) && source != BindSource::Manual {
            return Ok(RefreshOutcome::Skipped);
        }
        // A push event must not be lost to whichever rail happens to hold
        // the guard; it queues behind the in-flight bind. Every other rail
        // yields: the bind in flight serves it.
        let _guard = if source == BindSource::WsEvent {
            inner.refresh_guard.lock().await
        } else {
            match inner.refresh_guard.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(source = %source, "refresh already in flight; skipping");
                    return Ok(RefreshOutcome::Skipped);
                }
            }
        };

        match inner.binder.bind(source).await {
            Ok(outcome) => {
                if inner.shutdown.is_cancelled() {
                    return Ok(RefreshOutcome::Completed {
                        rotated: outcome.rotated,
                    });
                }
                {
                    let mut tracking = inner.tracking.lock().expect("tracking lock poisoned");
                    tracking.last_poll_at = Some(Utc::now());
                    if outcome.rotated
                        && !outcome.initial
                        && source != BindSource::WsEvent
                        && !tracking.ws_event_received
                    {
                        tracking.missed_rotations += 1;
                        warn!(
                            source = %source,
                            missed = tracking.missed_rotations,
                            "rotation detected by a safety rail before any push event; \
                             the push channel may be unreliable"
                        );
                    }
                    if outcome.rotated || source == BindSource::WsEvent {
                        tracking.ws_event_received = false;
                    }
                    tracking.expected_rotation_at = outcome.response.next_rotation_at;
                    tracking.grace_expires_at = outcome.response.grace_expires_at;
                }

                let delay = inner.primary_delay(
                    outcome.response.next_rotation_at,
                    outcome.response.grace_expires_at,
                );
                Self::arm_primary(inner, delay);
                if let Some(grace) = outcome.response.grace_expires_at {
                    if let Some(delay) = inner.grace_delay(grace) {
                        Self::arm_grace(inner, delay);
                    }
                }
                Ok(RefreshOutcome::Completed {
                    rotated: outcome.rotated,
                })
            }
            Err(err) => {
                if !inner.shutdown.is_cancelled() {
                    Self::arm_primary(inner, inner.config.retry_delay);
                }
                Err(err)
            }
        }
    }

    /// Push-event refresh with exponential backoff on transient failures.
    async fn refresh_with_retry(inner: &Arc<Self>, source: BindSource) {
        for attempt in 1..=inner.config.ws_retry_attempts {
            match Self::refresh(inner, source).await {
                Ok(_) => return,
                Err(err) if err.is_transient() && attempt < inner.config.ws_retry_attempts => {
                    let delay = inner.config.ws_retry_delay(attempt);
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        %err,
                        "push-event refresh failed; retrying"
                    );
                    tokio::select! {
                        () = inner.shutdown.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    warn!(%err, "push-event refresh abandoned");
                    return;
                }
            }
        }
    }

    /// Delay until the primary refresh, per the published schedule.
    fn primary_delay(
        &self,
        next_rotation_at: Option<chrono::DateTime<Utc>>,
        grace_expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Duration {
        let now = Utc::now();
        if let Some(next) = next_rotation_at {
            let until = (next - now).to_std().unwrap_or(Duration::ZERO);
            return until
                .saturating_sub(self.config.refresh_lead_time)
                .max(self.config.min_interval);
        }
        if let Some(grace) = grace_expires_at {
            let remaining = (grace - now).to_std().unwrap_or(Duration::ZERO);
            if remaining > Duration::ZERO {
                return (remaining / 2).max(self.config.min_interval);
            }
        }
        self.config.fallback_interval
    }

    /// Delay until the grace-period poll, or None when no window remains.
    fn grace_delay(&self, grace_expires_at: chrono::DateTime<Utc>) -> Option<Duration> {
        let remaining = (grace_expires_at - Utc::now()).to_std().ok()?;
        if remaining.is_zero() {
            return None;
        }
        Some((remaining / 2).max(self.config.min_grace_poll_delay))
    }

    fn arm_primary(inner: &Arc<Self>, delay: Duration) {
        if inner.shutdown.is_cancelled() {
            return;
        }
        let token = Self::replace_timer(&inner.primary_timer, &inner.shutdown);
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Err(err) = Self::refresh(&inner, BindSource::Scheduled).await {
                        warn!(%err, "scheduled refresh failed");
                    }
                }
            }
        });
    }

    fn arm_grace(inner: &Arc<Self>, delay: Duration) {
        if inner.shutdown.is_cancelled() {
            return;
        }
        let token = Self::replace_timer(&inner.grace_timer, &inner.shutdown);
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    Self::grace_poll(&inner).await;
                }
            }
        });
    }

    /// Grace-period poll body. Idempotent: a push event observed since
    /// scheduling suppresses the poll entirely.
    async fn grace_poll(inner: &Arc<Self>) {
        {
            let tracking = inner.tracking.lock().expect("tracking lock poisoned");
            if tracking.ws_event_received {
                debug!("grace poll suppressed: push event already observed this cycle");
                return;
            }
        }
        if let Err(err) = Self::refresh(inner, BindSource::GracePoll).await {
            warn!(%err, "grace poll failed; retrying after the minimum delay");
            Self::arm_grace(inner, inner.config.min_grace_poll_delay);
        }
    }

    fn spawn_heartbeat(inner: &Arc<Self>) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = inner.shutdown.cancelled() => return,
                    () = tokio::time::sleep(inner.config.heartbeat_interval) => {}
                }
                let stale = {
                    let tracking = inner.tracking.lock().expect("tracking lock poisoned");
                    match tracking.expected_rotation_at {
                        Some(expected) if !tracking.ws_event_received => {
                            let overdue = Utc::now() - expected;
                            overdue
                                .to_std()
                                .is_ok_and(|d| d > inner.config.staleness_threshold)
                        }
                        _ => false,
                    }
                };
                if stale {
                    warn!("expected rotation time passed with no push event; heartbeat rebinding");
                    if let Err(err) = Self::refresh(&inner, BindSource::Heartbeat).await {
                        warn!(%err, "heartbeat refresh failed");
                    }
                }
            }
        });
    }

    /// Cancels the current token in `slot` and installs a fresh child token.
    fn replace_timer(
        slot: &Mutex<Option<CancellationToken>>,
        shutdown: &CancellationToken,
    ) -> CancellationToken {
        let token = shutdown.child_token();
        let previous = slot
            .lock()
            .expect("timer lock poisoned")
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }

    fn cancel_timer(slot: &Mutex<Option<CancellationToken>>) {
        if let Some(token) = slot.lock().expect("timer lock poisoned").take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::binder::test_support::{MockBindClient, response_with_key};
    use crate::config::store::ConfigStore;
    use crate::degraded::test_support::MockReprovisionClient;
    use crate::events::EventBus;

    struct Fixture {
        scheduler: RotationScheduler,
        client: Arc<MockBindClient>,
        degraded: Arc<DegradedModeHandler>,
        binder: Arc<KeyBinder>,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: SchedulerConfig, results: Vec<Result<crate::binder::BindResponse, BindError>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ConfigStore::open(&dir.path().join("state.json"), "svc-key", None).unwrap(),
        );
        let client = Arc::new(MockBindClient::new(results));
        let events = EventBus::default();
        let binder = Arc::new(KeyBinder::new(
            client.clone() as Arc<dyn crate::binder::BindClient>,
            Arc::clone(&store),
            events.clone(),
            "svc-key",
        ));
        let degraded = Arc::new(DegradedModeHandler::new(
            Arc::new(MockReprovisionClient::new(vec![])),
            store,
            events,
            "agent-1",
        ));
        let scheduler = RotationScheduler::new(config, Arc::clone(&binder), Arc::clone(&degraded));
        Fixture {
            scheduler,
            client,
            degraded,
            binder,
            _dir: dir,
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_bind_fires_at_lead_time_exactly_once() {
        let fx = fixture(
            SchedulerConfig::default(),
            vec![Ok(response_with_key("kw_1"))],
        );
        let mut persisted = ManagedKeyState::new("svc-key");
        persisted.next_rotation_at = Some(Utc::now() + chrono::Duration::hours(1));
        fx.scheduler.start(&persisted);
        // Let the timer task register its sleep before the clock moves.
        settle().await;

        // 1h out, 30s lead: due at 3570s. Just before, nothing fires.
        tokio::time::advance(Duration::from_millis(3_569_900)).await;
        settle().await;
        assert_eq!(fx.client.call_count(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(fx.client.call_count(), 1);
        assert_eq!(
            fx.binder.rotation_counts()[&BindSource::Scheduled],
            1,
            "the one bind is attributed to the primary schedule"
        );
        fx.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_bind_reschedules_at_retry_delay() {
        let fx = fixture(
            SchedulerConfig::default(),
            vec![
                Err(BindError::Network("blip".into())),
                Ok(response_with_key("kw_1")),
            ],
        );
        fx.scheduler.start(&ManagedKeyState::new("svc-key"));

        let err = fx.scheduler.refresh(BindSource::Manual).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(fx.client.call_count(), 1);
        // Let the retry timer register its sleep before the clock moves.
        settle().await;

        // Retry delay is 30s, not the 5 min fallback.
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(fx.client.call_count(), 2);
        fx.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn grace_poll_suppressed_after_ws_event() {
        let mut grace_response = response_with_key("kw_1");
        grace_response.next_rotation_at = None;
        grace_response.grace_expires_at = Some(Utc::now() + chrono::Duration::seconds(60));
        let fx = fixture(
            SchedulerConfig::default(),
            vec![
                Ok(grace_response),
                // The ws-triggered refresh fails hard so the cycle's flag
                // stays set; the failure arms the 30s primary retry.
                Err(BindError::Malformed("scripted".into())),
                // The primary retry at 30s confirms the current value.
                Ok(response_with_key("kw_1")),
            ],
        );
        fx.scheduler.start(&ManagedKeyState::new("svc-key"));

        fx.scheduler.refresh(BindSource::Manual).await.unwrap();
        assert_eq!(fx.client.call_count(), 1);

        fx.scheduler.on_ws_rotation_event("svc-key");
        settle().await;
        assert_eq!(fx.client.call_count(), 2);
        assert!(fx.scheduler.tracking().ws_event_received);

        // Both the grace poll (armed at 30s by the first bind) and the
        // primary retry fire here. The grace poll is suppressed by the push
        // event recorded since it was scheduled, so only the primary retry
        // binds: three calls total, not four.
        tokio::time::advance(Duration::from_secs(35)).await;
        settle().await;
        assert_eq!(fx.client.call_count(), 3);
        assert!(
            !fx.binder.rotation_counts().contains_key(&BindSource::GracePoll),
            "no bind was attributed to the grace rail"
        );
        fx.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn safety_rail_rotation_increments_missed_counter_once() {
        let fx = fixture(
            SchedulerConfig::default(),
            vec![
                Ok(response_with_key("kw_1")),
                Ok(response_with_key("kw_2")),
                Ok(response_with_key("kw_2")),
            ],
        );
        fx.scheduler.start(&ManagedKeyState::new("svc-key"));

        fx.scheduler.refresh(BindSource::Manual).await.unwrap();
        assert_eq!(fx.scheduler.tracking().missed_rotations, 0);

        // Rotation detected by the grace rail with no push event this cycle.
        fx.scheduler.refresh(BindSource::GracePoll).await.unwrap();
        assert_eq!(fx.scheduler.tracking().missed_rotations, 1);

        // Same value again: no rotation, no double count.
        fx.scheduler.refresh(BindSource::GracePoll).await.unwrap();
        assert_eq!(fx.scheduler.tracking().missed_rotations, 1);
        fx.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn ws_detected_rotation_does_not_count_as_missed() {
        let fx = fixture(
            SchedulerConfig::default(),
            vec![Ok(response_with_key("kw_1"))],
        );
        fx.scheduler.start(&ManagedKeyState::new("svc-key"));

        fx.scheduler.on_ws_rotation_event("svc-key");
        settle().await;
        assert_eq!(fx.client.call_count(), 1);
        let tracking = fx.scheduler.tracking();
        assert_eq!(tracking.missed_rotations, 0);
        assert!(
            !tracking.ws_event_received,
            "flag resets after the refresh attributed to the cycle"
        );
        fx.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn push_event_queues_behind_an_in_flight_bind() {
        let fx = fixture(
            SchedulerConfig::default(),
            vec![Ok(response_with_key("kw_rotated"))],
        );
        fx.scheduler.start(&ManagedKeyState::new("svc-key"));
        settle().await;

        // Hold the bind guard as another rail would mid-bind.
        let guard = fx.scheduler.inner.refresh_guard.lock().await;
        fx.scheduler.on_ws_rotation_event("svc-key");
        settle().await;
        assert_eq!(fx.client.call_count(), 0);
        assert!(fx.scheduler.tracking().ws_event_received);

        drop(guard);
        settle().await;
        assert_eq!(
            fx.client.call_count(),
            1,
            "the push refresh binds once the guard frees"
        );
        assert!(
            !fx.scheduler.tracking().ws_event_received,
            "the cycle's flag resets, so the safety rails are not suppressed"
        );
        fx.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn ws_refresh_retries_with_backoff() {
        let fx = fixture(
            SchedulerConfig::default(),
            vec![
                Err(BindError::Network("blip 1".into())),
                Err(BindError::Network("blip 2".into())),
                Ok(response_with_key("kw_1")),
            ],
        );
        fx.scheduler.start(&ManagedKeyState::new("svc-key"));

        fx.scheduler.on_ws_rotation_event("svc-key");
        settle().await;
        assert_eq!(fx.client.call_count(), 1);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        settle().await;
        assert_eq!(fx.client.call_count(), 2);

        tokio::time::advance(Duration::from_millis(2_100)).await;
        settle().await;
        assert_eq!(fx.client.call_count(), 3);
        assert_eq!(fx.binder.rotation_counts()[&BindSource::WsEvent], 1);
        fx.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_rebinds_when_rotation_is_overdue() {
        let mut config = SchedulerConfig::default();
        config.min_interval = Duration::from_secs(600);
        let mut first = response_with_key("kw_1");
        first.next_rotation_at = Some(Utc::now() - chrono::Duration::minutes(5));
        first.grace_expires_at = None;
        let fx = fixture(config, vec![Ok(first), Ok(response_with_key("kw_2"))]);
        fx.scheduler.start(&ManagedKeyState::new("svc-key"));
        // Let the heartbeat task register its sleep before the clock moves.
        settle().await;

        fx.scheduler.refresh(BindSource::Manual).await.unwrap();
        assert_eq!(fx.client.call_count(), 1);
        settle().await;

        // First heartbeat tick: rotation overdue by 5 min with no push event.
        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(fx.client.call_count(), 2);
        assert_eq!(fx.binder.rotation_counts()[&BindSource::Heartbeat], 1);
        fx.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_with_valid_rebind_reports_success() {
        let fx = fixture(
            SchedulerConfig::default(),
            vec![Ok(response_with_key("kw_fresh"))],
        );
        fx.scheduler.start(&ManagedKeyState::new("svc-key"));

        assert!(fx.scheduler.on_ws_auth_failure().await);
        assert!(!fx.degraded.is_degraded());
        fx.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_with_rejected_rebind_enters_degraded() {
        let fx = fixture(SchedulerConfig::default(), vec![Err(BindError::Unauthorized)]);
        fx.scheduler.start(&ManagedKeyState::new("svc-key"));

        assert!(!fx.scheduler.on_ws_auth_failure().await);
        assert!(fx.degraded.is_degraded());
        fx.scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_event_for_other_key_is_ignored() {
        let fx = fixture(SchedulerConfig::default(), vec![]);
        fx.scheduler.start(&ManagedKeyState::new("svc-key"));

        fx.scheduler.on_ws_rotation_event("some-other-key");
        settle().await;
        assert_eq!(fx.client.call_count(), 0);
        assert!(!fx.scheduler.tracking().ws_event_received);
        fx.scheduler.stop();
    }
}
