//! keywardend - managed API key agent daemon.
//!
//! Wires the keywarden-core subsystems together: loads the agent config,
//! opens the persisted state, starts the rotation scheduler and the push
//! channel, and (when configured) supervises the workload. The daemon owns
//! the event loop that maps subsystem events to actions: key rotations
//! update the key file mirror and restart the workload, and degraded mode
//! watches for an operator-dropped reprovision token.
//!
//! Signals: SIGTERM and SIGINT shut the agent down after forwarding to the
//! child; SIGHUP forwards to the child and forces a manual refresh.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use keywarden_core::binder::{BindSource, HttpBindClient, KeyBinder};
use keywarden_core::config::AgentConfig;
use keywarden_core::config::store::ConfigStore;
use keywarden_core::connection::{ConnectionManager, HttpPushTransport};
use keywarden_core::degraded::{DegradedModeHandler, HttpReprovisionClient};
use keywarden_core::events::{AgentEvent, EventBus};
use keywarden_core::keyfile::KeyFileMirror;
use keywarden_core::rotation::RotationScheduler;
use keywarden_core::secrets::{HttpVaultClient, SecretResolver, VaultClient};
use keywarden_core::supervisor::ProcessSupervisor;
use nix::sys::signal::Signal;
use secrecy::SecretString;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the stored key at startup.
const KEY_ENV_VAR: &str = "KEYWARDEN_API_KEY";

/// How often degraded mode checks for an operator-dropped token file.
const TOKEN_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "keywardend", about = "managed API key agent")]
struct Args {
    /// Path to the agent configuration file
    #[arg(short, long, default_value = "/etc/keywarden/agent.toml")]
    config: PathBuf,

    /// Log filter (tracing `EnvFilter` syntax)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path watched for an operator-dropped reprovision token while
    /// degraded. Defaults to `reprovision.token` next to the state file.
    #[arg(long)]
    reprovision_token_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    info!(
        agent_id = %config.agent_id,
        key = %config.managed_key.name,
        "keywarden agent starting"
    );

    let env_key = std::env::var(KEY_ENV_VAR).ok().map(SecretString::from);
    let store = Arc::new(
        ConfigStore::open(&config.state_file, &config.managed_key.name, env_key)
            .context("failed to open state file")?,
    );
    let cache = store.credential_cache();

    // The API client bounds every request; the stream client must not, its
    // response stays open for the connection's lifetime.
    let api_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build http client")?;
    let stream_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build stream client")?;

    let events = EventBus::default();
    let binder = Arc::new(KeyBinder::new(
        Arc::new(HttpBindClient::new(
            api_client.clone(),
            &config.authority.bind_url,
        )),
        Arc::clone(&store),
        events.clone(),
        &config.managed_key.name,
    ));
    let degraded = Arc::new(DegradedModeHandler::new(
        Arc::new(HttpReprovisionClient::new(
            api_client.clone(),
            &config.authority.reprovision_url,
        )),
        Arc::clone(&store),
        events.clone(),
        &config.agent_id,
    ));
    let scheduler = RotationScheduler::new(
        config.scheduler.clone(),
        Arc::clone(&binder),
        Arc::clone(&degraded),
    );
    let connection = ConnectionManager::new(
        config.connection.clone(),
        Arc::new(HttpPushTransport::new(
            stream_client,
            &config.authority.events_url,
        )),
        Arc::clone(&cache),
        scheduler.clone(),
        Arc::clone(&degraded),
        events.clone(),
    );

    let mirror = KeyFileMirror::from_config(&config.managed_key).map(Arc::new);
    if let Some(mirror) = &mirror {
        if let Err(err) = mirror.recover(&cache.current()) {
            warn!(%err, "key file recovery failed at startup");
        }
    }

    let supervisor = match &config.workload {
        Some(workload) => {
            let vault = match &config.vault {
                Some(vault_config) => Some(Arc::new(
                    HttpVaultClient::from_config(api_client.clone(), vault_config)
                        .context("failed to build vault client")?,
                ) as Arc<dyn VaultClient>),
                None => None,
            };
            let resolver = SecretResolver::new(vault, Arc::clone(&cache));
            Some(ProcessSupervisor::new(
                workload.clone(),
                resolver,
                events.clone(),
            ))
        }
        None => None,
    };

    let token_file = args.reprovision_token_file.unwrap_or_else(|| {
        config
            .state_file
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join("reprovision.token")
    });
    spawn_event_loop(
        events.clone(),
        mirror,
        cache.clone(),
        supervisor.clone(),
        Arc::clone(&degraded),
        scheduler.clone(),
        token_file,
    );

    scheduler.start(&store.managed_key());
    if let Err(err) = scheduler.refresh(BindSource::Manual).await {
        // The safety rails retry; startup proceeds on the stored key.
        warn!(%err, "initial bind failed");
    }
    connection.start();
    if let Some(supervisor) = &supervisor {
        supervisor
            .start()
            .await
            .context("failed to start workload")?;
    }

    wait_for_signals(&scheduler, supervisor.as_ref()).await?;

    info!("shutting down");
    connection.stop();
    scheduler.stop();
    if let Some(supervisor) = &supervisor {
        supervisor.shutdown().await;
    }
    Ok(())
}

/// Maps subsystem events to daemon actions.
fn spawn_event_loop(
    events: EventBus,
    mirror: Option<Arc<KeyFileMirror>>,
    cache: Arc<keywarden_core::credential::CredentialCache>,
    supervisor: Option<ProcessSupervisor>,
    degraded: Arc<DegradedModeHandler>,
    scheduler: RotationScheduler,
    token_file: PathBuf,
) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event loop lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            match event {
                AgentEvent::KeyRotated { key_name, source } => {
                    info!(key = %key_name, source = %source, "key rotated");
                    apply_new_key(mirror.as_deref(), &cache, supervisor.as_ref(), "key rotated")
                        .await;
                }
                AgentEvent::CredentialsUpdated => {
                    apply_new_key(
                        mirror.as_deref(),
                        &cache,
                        supervisor.as_ref(),
                        "credentials updated",
                    )
                    .await;
                    // A reprovision cleared the rotation schedule; a fresh
                    // bind re-seeds it.
                    if let Err(err) = scheduler.refresh(BindSource::Manual).await {
                        warn!(%err, "rebind after credential update failed");
                    }
                }
                AgentEvent::DegradedEntered { reason } => {
                    error!(%reason, "agent degraded");
                    spawn_token_watch(Arc::clone(&degraded), token_file.clone());
                }
                AgentEvent::DegradedCleared => info!("degraded mode cleared"),
                AgentEvent::ChildStateChanged { status } => {
                    info!(%status, "workload state changed");
                }
                AgentEvent::ChannelConnected | AgentEvent::ChannelDisconnected => {}
            }
        }
    });
}

async fn apply_new_key(
    mirror: Option<&KeyFileMirror>,
    cache: &keywarden_core::credential::CredentialCache,
    supervisor: Option<&ProcessSupervisor>,
    reason: &str,
) {
    if let Some(mirror) = mirror {
        if let Err(err) = mirror.write(&cache.current()) {
            error!(%err, "failed to update key file");
        }
    }
    if let Some(supervisor) = supervisor {
        if let Err(err) = supervisor.restart(reason).await {
            error!(%err, "failed to restart workload");
        }
    }
}

/// Polls for an operator-dropped token file while degraded. The file is
/// consumed on claim.
fn spawn_token_watch(degraded: Arc<DegradedModeHandler>, token_file: PathBuf) {
    tokio::spawn(async move {
        info!(path = %token_file.display(), "watching for reprovision token");
        while degraded.is_degraded() {
            if let Ok(token) = tokio::fs::read_to_string(&token_file).await {
                let token = token.trim().to_string();
                if token.is_empty() {
                    warn!(path = %token_file.display(), "token file is empty; ignoring");
                    let _ = tokio::fs::remove_file(&token_file).await;
                } else {
                    match degraded.claim_reprovision_token(&token).await {
                        Ok(()) => {
                            let _ = tokio::fs::remove_file(&token_file).await;
                            return;
                        }
                        Err(err) => {
                            error!(%err, "reprovision claim failed");
                            let _ = tokio::fs::remove_file(&token_file).await;
                        }
                    }
                }
            }
            tokio::time::sleep(TOKEN_POLL_INTERVAL).await;
        }
    });
}

/// Blocks until a termination signal arrives. SIGHUP is forwarded to the
/// child and triggers a manual refresh without terminating.
async fn wait_for_signals(
    scheduler: &RotationScheduler,
    supervisor: Option<&ProcessSupervisor>,
) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("SIGINT received");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("SIGHUP received; forwarding and refreshing");
                if let Some(supervisor) = supervisor {
                    supervisor.forward_signal(Signal::SIGHUP);
                }
                if let Err(err) = scheduler.refresh(BindSource::Manual).await {
                    warn!(%err, "manual refresh failed");
                }
            }
        }
    }
}
