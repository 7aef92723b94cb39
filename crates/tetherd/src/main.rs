//! tetherd: Tether session daemon over the local link.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};

use tether_core::config::TetherConfig;
use tether_session::{Session, SessionEvent, SessionEvents};

mod lan;

use lan::LanDiscovery;

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TetherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });

    let identity = config.peer_identity().context("no usable identity")?;
    let service = config
        .discovery
        .service_params()
        .context("invalid service configuration")?;
    config
        .discovery
        .validate()
        .context("invalid discovery configuration")?;
    config
        .session
        .validate()
        .context("invalid session configuration")?;

    let interface = if config.discovery.interface.is_empty() {
        std::env::args()
            .nth(1)
            .context("no interface configured; pass one as the first argument")?
    } else {
        config.discovery.interface.clone()
    };
    let interface_index = lan::if_index(&interface)?;
    tracing::info!(
        %identity,
        service = service.name(),
        interface,
        interface_index,
        "tetherd starting"
    );

    let discovery = LanDiscovery::new(interface_index, &config.discovery);
    tracing::info!(instance = hex::encode(discovery.instance()), "instance id");

    let (session, events) = Session::new(
        identity,
        config.session.clone(),
        service,
        Arc::new(discovery),
    );
    let session = Arc::new(session);
    session.start().await.context("failed to start session")?;

    let event_task = tokio::spawn(log_events(events));
    let status_task = tokio::spawn(log_status(session.clone()));

    // ── Lifecycle hooks ──────────────────────────────────────────────────────

    let mut backgrounded = signal(SignalKind::user_defined1()).context("SIGUSR1 handler")?;
    let mut foregrounded = signal(SignalKind::user_defined2()).context("SIGUSR2 handler")?;

    loop {
        tokio::select! {
            _ = backgrounded.recv() => {
                tracing::info!("SIGUSR1: stopping session");
                session.stop().await;
            }
            _ = foregrounded.recv() => {
                tracing::info!("SIGUSR2: starting session");
                if let Err(e) = session.start().await {
                    tracing::error!(error = %e, "session failed to start");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    session.stop().await;
    event_task.abort();
    status_task.abort();
    Ok(())
}

async fn log_events(mut events: SessionEvents) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::PeersChanged(peers) => {
                let peers: Vec<&str> = peers.iter().map(|p| p.as_str()).collect();
                tracing::info!(count = peers.len(), ?peers, "reachable peers changed");
            }
            SessionEvent::Message(message) => {
                tracing::info!(
                    from = %message.from,
                    message_type = message.message_type,
                    bytes = message.payload.len(),
                    "message received"
                );
            }
            SessionEvent::IdentityCollision(identity) => {
                tracing::error!(%identity, "another device advertises our identity");
            }
        }
    }
}

async fn log_status(session: Arc<Session>) {
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        ticker.tick().await;
        if !session.is_running().await {
            continue;
        }
        let links = session.links().await;
        tracing::info!(links = links.len(), "── link snapshot ──");
        for link in links {
            tracing::info!(
                link = %link.id,
                endpoint = %link.endpoint,
                peer = %link.peer,
                direction = %link.direction,
                state = %link.state,
                age_ms = link.age_ms,
                idle_ms = ?link.idle_ms,
                waiting = link.waiting,
                "link"
            );
        }
    }
}
