//! The seam between the session layer and whatever carries bytes.
//!
//! A `DiscoverySource` advertises this device, reports which peers are
//! currently visible, dials them, and hands over inbound connections. The
//! session layer never touches sockets; it only sees `Connected` stream
//! halves and an optional path-status channel.

use std::fmt;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use tether_core::auth::ServiceParams;
use tether_core::{EndpointId, PeerIdentity};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Future resolving once a link's handshake has completed.
pub type PendingLink = BoxFuture<'static, Result<Connected, TransportError>>;

/// Whether the path under an established link can currently carry traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Viable,
    /// The transport is waiting for connectivity to come back.
    Waiting,
}

/// A link whose handshake completed: ordered, reliable, bidirectional.
pub struct Connected {
    pub reader: BoxReader,
    pub writer: BoxWriter,
    pub status: Option<watch::Receiver<PathStatus>>,
}

impl Connected {
    /// Split a duplex stream into boxed halves.
    pub fn from_stream<S>(stream: S, status: Option<watch::Receiver<PathStatus>>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            status,
        }
    }
}

impl fmt::Debug for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connected")
            .field("status", &self.status.as_ref().map(|s| *s.borrow()))
            .finish_non_exhaustive()
    }
}

/// An inbound connection offered by the transport.
///
/// Dropping it without polling `connect` refuses the connection.
pub struct InboundLink {
    /// The dialer's endpoint, as this device's scanner would name it.
    pub endpoint: EndpointId,
    pub peer: PeerIdentity,
    pub connect: PendingLink,
}

impl fmt::Debug for InboundLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundLink")
            .field("endpoint", &self.endpoint)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// One discovery result.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Candidate {
    pub endpoint: EndpointId,
    pub identity: PeerIdentity,
}

/// Advertiser, scanner, dialer and acceptor for one medium.
pub trait DiscoverySource: Send + Sync + 'static {
    /// Make this device discoverable until the subscription is closed.
    fn advertise(
        &self,
        identity: &PeerIdentity,
        service: &ServiceParams,
    ) -> Result<Subscription, DiscoveryError>;

    /// Observe the set of peers advertising `service`. This device's own
    /// advertisements are never included.
    fn start_scanning(
        &self,
        service: &ServiceParams,
    ) -> Result<(watch::Receiver<Vec<Candidate>>, Subscription), DiscoveryError>;

    /// Open a link to a discovered endpoint.
    fn dial(&self, endpoint: &EndpointId, service: &ServiceParams) -> PendingLink;

    /// Receive inbound links until the subscription is closed.
    fn accept(
        &self,
        service: &ServiceParams,
    ) -> Result<(mpsc::Receiver<InboundLink>, Subscription), DiscoveryError>;
}

// ── Subscription ──────────────────────────────────────────────────────────────

/// Owns the background work behind an advertisement, scan, or accept loop.
///
/// `close` aborts the tasks and waits for them; dropping aborts without waiting.
#[derive(Default)]
pub struct Subscription {
    tasks: Vec<JoinHandle<()>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Run `f` once when the subscription is closed or dropped.
    pub fn on_close(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            tasks: Vec::new(),
            on_close: Some(Box::new(f)),
        }
    }

    pub fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub async fn close(mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("identity {0} is already advertised on this service")]
    IdentityInUse(PeerIdentity),

    #[error("service unreachable: {0}")]
    Unreachable(String),

    #[error("discovery i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint {0} is not reachable")]
    Unreachable(EndpointId),

    #[error("link refused by peer")]
    Rejected,

    #[error("this device is not advertising")]
    NotAdvertising,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}
