//! One link to one peer endpoint, as the registry tracks it.

use std::fmt;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use tether_core::{EndpointId, PeerIdentity};

use crate::framer::LinkWriter;

/// Monotonic per-session link number. Distinguishes a replaced link from
/// its predecessor on the same endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Addresses one specific link. Events carry it so that events from a link
/// that has since been replaced can be recognised and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub endpoint: EndpointId,
    pub id: LinkId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Ready,
    Terminated,
}

impl LinkState {
    /// `connecting → ready → terminated`, or `connecting → terminated`.
    pub fn can_advance_to(self, next: LinkState) -> bool {
        matches!(
            (self, next),
            (LinkState::Connecting, LinkState::Ready)
                | (LinkState::Connecting, LinkState::Terminated)
                | (LinkState::Ready, LinkState::Terminated)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connecting => f.write_str("connecting"),
            LinkState::Ready => f.write_str("ready"),
            LinkState::Terminated => f.write_str("terminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Cancel signal and task handle of a link's driver.
#[derive(Debug, Default)]
pub struct LinkHandle {
    cancel: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
}

impl LinkHandle {
    pub fn new(cancel: oneshot::Sender<()>, driver: JoinHandle<()>) -> Self {
        Self {
            cancel: Some(cancel),
            driver: Some(driver),
        }
    }

    /// No driver attached yet.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Signal the driver to stop. Returns its task so the caller can wait.
    pub fn cancel(&mut self) -> Option<JoinHandle<()>> {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        self.driver.take()
    }
}

#[derive(Debug)]
pub struct Link {
    pub id: LinkId,
    pub endpoint: EndpointId,
    pub peer: PeerIdentity,
    pub direction: Direction,
    pub state: LinkState,
    pub created_at: Instant,
    /// Last time the peer proved it was alive: handshake completion or any
    /// frame received.
    pub last_healthy_at: Option<Instant>,
    /// Set while the transport reports it is waiting for connectivity.
    pub waiting_since: Option<Instant>,
    pub writer: Option<LinkWriter>,
    pub handle: LinkHandle,
}

impl Link {
    pub fn new(
        id: LinkId,
        endpoint: EndpointId,
        peer: PeerIdentity,
        direction: Direction,
        now: Instant,
    ) -> Self {
        Self {
            id,
            endpoint,
            peer,
            direction,
            state: LinkState::Connecting,
            created_at: now,
            last_healthy_at: None,
            waiting_since: None,
            writer: None,
            handle: LinkHandle::detached(),
        }
    }

    pub fn key(&self) -> LinkKey {
        LinkKey {
            endpoint: self.endpoint.clone(),
            id: self.id,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn advance(&mut self, next: LinkState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn summary(&self, now: Instant) -> LinkSummary {
        LinkSummary {
            id: self.id,
            endpoint: self.endpoint.clone(),
            peer: self.peer.clone(),
            direction: self.direction,
            state: self.state,
            age_ms: now.saturating_duration_since(self.created_at).as_millis() as u64,
            idle_ms: self
                .last_healthy_at
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            waiting: self.waiting_since.is_some(),
        }
    }
}

/// Point-in-time view of a link for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSummary {
    pub id: LinkId,
    pub endpoint: EndpointId,
    pub peer: PeerIdentity,
    pub direction: Direction,
    pub state: LinkState,
    pub age_ms: u64,
    /// Time since the peer was last heard from. `None` before ready.
    pub idle_ms: Option<u64>,
    pub waiting: bool,
}
