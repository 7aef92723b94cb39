//! Public session facade.
//!
//! A `Session` turns a discovery source into "the set of peers I can talk
//! to right now" plus typed messaging. `start` and `stop` map onto the
//! application's foreground and background hooks and may be called any
//! number of times in any order.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use tether_core::auth::ServiceParams;
use tether_core::config::{ConfigError, SessionSettings};
use tether_core::{Frame, PeerIdentity, PING};

use crate::coordinator::{Command, Coordinator, Inputs};
use crate::driver::DriverSettings;
use crate::health::HealthPolicy;
use crate::link::LinkSummary;
use crate::registry::NoRoute;
use crate::transport::{
    Candidate, DiscoveryError, DiscoverySource, InboundLink, Subscription,
};

const COMMAND_BUFFER: usize = 64;

// ── Events ────────────────────────────────────────────────────────────────────

/// An application message from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: PeerIdentity,
    pub message_type: u32,
    pub payload: Bytes,
}

impl InboundMessage {
    /// Decode a payload sent with `Session::send_json`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The reachable set changed. Carries the complete new set.
    PeersChanged(BTreeSet<PeerIdentity>),
    Message(InboundMessage),
    /// A discovered device advertises our own identity. Reported once per
    /// endpoint; the pair will never connect.
    IdentityCollision(PeerIdentity),
}

/// Event stream of one session, across every start/stop cycle.
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    /// Next event. `None` once the session is dropped.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for SessionEvents {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("identity {0} is already advertised on this medium")]
    IdentityInUse(PeerIdentity),

    #[error("discovery failed: {0}")]
    Discovery(DiscoveryError),
}

impl SessionError {
    /// Errors that retrying `start` cannot fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SessionError::Configuration(_) | SessionError::IdentityInUse(_)
        )
    }
}

impl From<DiscoveryError> for SessionError {
    fn from(e: DiscoveryError) -> Self {
        match e {
            DiscoveryError::IdentityInUse(id) => SessionError::IdentityInUse(id),
            other => SessionError::Discovery(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no link to {0}")]
    NoSuchPeer(PeerIdentity),

    #[error("link to {0} is still connecting")]
    NotReady(PeerIdentity),

    #[error("message type 0 is reserved for health pings")]
    ReservedType,

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: u32 },

    #[error("session is not running")]
    NotRunning,

    #[error("link closed during send: {0}")]
    LinkClosed(String),

    #[error("payload encoding failed: {0}")]
    Encode(String),
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Live discovery handles for one run.
struct Discovery {
    inbound: mpsc::Receiver<InboundLink>,
    scan: watch::Receiver<Vec<Candidate>>,
    subscriptions: Vec<Subscription>,
}

struct Running {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

pub struct Session {
    identity: PeerIdentity,
    settings: SessionSettings,
    service: ServiceParams,
    discovery: Arc<dyn DiscoverySource>,
    events: mpsc::UnboundedSender<SessionEvent>,
    peers: Arc<watch::Sender<BTreeSet<PeerIdentity>>>,
    running: Mutex<Option<Running>>,
}

impl Session {
    pub fn new(
        identity: PeerIdentity,
        settings: SessionSettings,
        service: ServiceParams,
        discovery: Arc<dyn DiscoverySource>,
    ) -> (Self, SessionEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let (peers, _) = watch::channel(BTreeSet::new());
        let session = Self {
            identity,
            settings,
            service,
            discovery,
            events,
            peers: Arc::new(peers),
            running: Mutex::new(None),
        };
        (session, SessionEvents { rx })
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Begin accepting, advertising, scanning and health checking.
    /// A no-op while already running.
    pub async fn start(&self) -> Result<(), SessionError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!(identity = %self.identity, "session already running");
            return Ok(());
        }

        if let Err(e) = self.settings.validate() {
            tracing::error!(error = %e, "refusing to start session");
            return Err(e.into());
        }

        let discovery = match self.subscribe() {
            Ok(discovery) => discovery,
            Err(e) => {
                tracing::error!(identity = %self.identity, error = %e, "failed to start discovery");
                return Err(e);
            }
        };

        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (coordinator, link_rx) = Coordinator::new(
            self.identity.clone(),
            self.service.clone(),
            self.discovery.clone(),
            HealthPolicy::from(&self.settings),
            DriverSettings {
                max_payload: self.settings.max_payload_bytes,
                write_timeout: self.settings.liveness_timeout(),
            },
            self.events.clone(),
            self.peers.clone(),
        );
        let inputs = Inputs {
            commands,
            inbound: discovery.inbound,
            scan: discovery.scan,
            subscriptions: discovery.subscriptions,
            interval: self.settings.health_check_interval(),
        };
        let task = tokio::spawn(coordinator.run(link_rx, inputs));

        *running = Some(Running {
            commands: commands_tx,
            task,
        });
        tracing::info!(identity = %self.identity, service = self.service.name(), "session started");
        Ok(())
    }

    /// Accept first so that peers who see the advertisement can connect.
    fn subscribe(&self) -> Result<Discovery, SessionError> {
        let (inbound, accept_sub) = self.discovery.accept(&self.service)?;
        let advert_sub = self.discovery.advertise(&self.identity, &self.service)?;
        let (scan, scan_sub) = self.discovery.start_scanning(&self.service)?;
        Ok(Discovery {
            inbound,
            scan,
            subscriptions: vec![advert_sub, scan_sub, accept_sub],
        })
    }

    /// Tear down every link and stop discovery. Returns once every link
    /// driver has exited. Safe to call when not running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running { commands, task }) = running.take() else {
            return;
        };
        let _ = commands.send(Command::Stop).await;
        if let Err(e) = task.await {
            tracing::error!(error = %e, "session coordinator failed");
        }
        tracing::info!(identity = %self.identity, "session stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Send one message to a reachable peer.
    pub async fn send(
        &self,
        peer: &PeerIdentity,
        message_type: u32,
        payload: impl Into<Bytes>,
    ) -> Result<(), SendError> {
        if message_type == PING {
            return Err(SendError::ReservedType);
        }
        let payload = payload.into();
        let max = self.settings.max_payload_bytes;
        if payload.len() as u64 > u64::from(max) {
            return Err(SendError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        let commands = self.commands().await.ok_or(SendError::NotRunning)?;
        let (reply, route) = oneshot::channel();
        commands
            .send(Command::Route {
                peer: peer.clone(),
                reply,
            })
            .await
            .map_err(|_| SendError::NotRunning)?;
        let (key, writer) = route
            .await
            .map_err(|_| SendError::NotRunning)?
            .map_err(|no_route| match no_route {
                NoRoute::Unknown => SendError::NoSuchPeer(peer.clone()),
                NoRoute::NotReady => SendError::NotReady(peer.clone()),
            })?;

        if let Err(e) = writer.send(&Frame::new(message_type, payload)).await {
            tracing::warn!(peer = %peer, error = %e, "send failed, dropping link");
            let reason = e.to_string();
            let _ = commands.send(Command::Failed { key, reason: reason.clone() }).await;
            return Err(SendError::LinkClosed(reason));
        }
        Ok(())
    }

    /// Send a serde-serializable payload as JSON.
    pub async fn send_json<T: Serialize>(
        &self,
        peer: &PeerIdentity,
        message_type: u32,
        value: &T,
    ) -> Result<(), SendError> {
        let payload = serde_json::to_vec(value).map_err(|e| SendError::Encode(e.to_string()))?;
        self.send(peer, message_type, payload).await
    }

    /// Peers with a ready link right now.
    pub fn reachable_peers(&self) -> BTreeSet<PeerIdentity> {
        self.peers.borrow().clone()
    }

    pub fn watch_peers(&self) -> watch::Receiver<BTreeSet<PeerIdentity>> {
        self.peers.subscribe()
    }

    /// Registry snapshot for diagnostics. Empty when not running.
    pub async fn links(&self) -> Vec<LinkSummary> {
        let Some(commands) = self.commands().await else {
            return Vec::new();
        };
        let (reply, rx) = oneshot::channel();
        if commands.send(Command::Snapshot { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn commands(&self) -> Option<mpsc::Sender<Command>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.commands.clone())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}
