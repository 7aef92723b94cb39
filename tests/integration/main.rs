//! Tether integration test harness.
//!
//! Every scenario runs complete sessions in-process over a `MemoryMedium`.
//! Timings are shortened so that eviction and re-dial happen well within a
//! second; waits are bounded by `PATIENCE` so a regression fails instead of
//! hanging.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use tether_core::auth::ServiceParams;
use tether_core::config::SessionSettings;
use tether_core::PeerIdentity;
use tether_session::{
    DiscoverySource, InboundMessage, MemoryMedium, Session, SessionEvent, SessionEvents,
};

mod arbitration;
mod collision;
mod health;
mod lifecycle;
mod messaging;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound on any single wait.
pub const PATIENCE: Duration = Duration::from_secs(5);

pub const SERVICE: &str = "tether-it";
pub const SECRET: &str = "correct horse";

pub fn settings() -> SessionSettings {
    SessionSettings {
        connect_timeout_ms: 300,
        liveness_timeout_ms: 400,
        health_check_interval_ms: 50,
        waiting_grace_ms: 0,
        ..SessionSettings::default()
    }
}

pub fn service() -> ServiceParams {
    ServiceParams::new(SERVICE, SECRET).unwrap()
}

pub fn id(name: &str) -> PeerIdentity {
    PeerIdentity::new(name).unwrap()
}

pub fn peers(names: &[&str]) -> BTreeSet<PeerIdentity> {
    names.iter().map(|n| id(n)).collect()
}

/// One session and its event stream.
pub struct Node {
    pub session: Session,
    pub events: SessionEvents,
}

impl Node {
    pub fn new(discovery: Arc<dyn DiscoverySource>, name: &str, settings: SessionSettings) -> Self {
        let (session, events) = Session::new(id(name), settings, service(), discovery);
        Self { session, events }
    }

    /// A started node on its own device of `medium`.
    pub async fn on(medium: &MemoryMedium, name: &str) -> Self {
        Self::with_settings(medium, name, settings()).await
    }

    pub async fn with_settings(medium: &MemoryMedium, name: &str, settings: SessionSettings) -> Self {
        let node = Self::new(Arc::new(medium.device()), name, settings);
        node.session.start().await.unwrap();
        node
    }

    /// Wait until the reachable set satisfies `pred`.
    ///
    /// Works off the event stream so that a state held only briefly is
    /// still observed. Events already queued are discarded first, and so
    /// are messages that arrive while waiting.
    pub async fn wait_for_peers(
        &mut self,
        what: &str,
        mut pred: impl FnMut(&BTreeSet<PeerIdentity>) -> bool,
    ) -> Result<BTreeSet<PeerIdentity>> {
        while self.events.try_recv().is_some() {}
        let current = self.session.reachable_peers();
        if pred(&current) {
            return Ok(current);
        }

        let name = self.session.identity().clone();
        let events = &mut self.events;
        let found = tokio::time::timeout(PATIENCE, async {
            while let Some(event) = events.recv().await {
                if let SessionEvent::PeersChanged(peers) = event {
                    if pred(&peers) {
                        return Some(peers);
                    }
                }
            }
            None
        })
        .await
        .with_context(|| format!("{name}: timed out waiting for {what}"))?;
        found.with_context(|| format!("{name}: event stream ended"))
    }

    /// Wait until `names` are exactly the reachable peers.
    pub async fn wait_reachable(&mut self, names: &[&str]) -> Result<()> {
        let want = peers(names);
        self.wait_for_peers(&format!("peers {names:?}"), |p| *p == want)
            .await
            .map(drop)
    }

    /// Next application message, skipping peer-set changes.
    pub async fn next_message(&mut self) -> Result<InboundMessage> {
        let events = &mut self.events;
        let found = tokio::time::timeout(PATIENCE, async {
            while let Some(event) = events.recv().await {
                if let SessionEvent::Message(message) = event {
                    return Some(message);
                }
            }
            None
        })
        .await
        .context("timed out waiting for a message")?;
        found.context("event stream ended")
    }
}

/// Bring up `a` and `b` and wait for them to see each other.
pub async fn pair(medium: &MemoryMedium, a: &str, b: &str) -> Result<(Node, Node)> {
    let mut first = Node::on(medium, a).await;
    let mut second = Node::on(medium, b).await;
    first.wait_reachable(&[b]).await?;
    second.wait_reachable(&[a]).await?;
    Ok((first, second))
}

/// Poll `check` every few milliseconds until it returns true.
pub async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + PATIENCE;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
