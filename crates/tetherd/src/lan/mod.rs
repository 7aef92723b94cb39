//! LAN discovery source: link-local IPv6 multicast announcements plus TCP
//! links authenticated with the pre-shared service secret.
//!
//! One `LanDiscovery` per process. It mints endpoint ids of the form
//! `identity@instance`, so a restarted peer (fresh instance id) shows up
//! as a new endpoint even under the same identity.

use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use tether_core::auth::{instance_id, nonce, ServiceParams};
use tether_core::config::DiscoveryConfig;
use tether_core::wire::{Announcement, Hello, InstanceId};
use tether_core::{EndpointId, PeerIdentity};
use tether_session::{
    Candidate, Connected, DiscoveryError, DiscoverySource, InboundLink, PendingLink,
    Subscription, TransportError,
};

pub mod announce;
pub mod handshake;

use handshake::HandshakeError;

/// How long an inbound connection may take to send its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

// ── Peer table ────────────────────────────────────────────────────────────────

/// A peer endpoint, as last seen in an announcement.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub identity: PeerIdentity,
    /// Source address of the announcement datagram.
    pub addr: Ipv6Addr,
    /// TCP port accepting links.
    pub session_port: u16,
    pub last_seen: Instant,
}

/// Shared between the listener, the expiry loop and `dial`.
pub type PeerTable = Arc<DashMap<EndpointId, PeerEntry>>;

pub fn endpoint_id(identity: &PeerIdentity, instance: &InstanceId) -> EndpointId {
    EndpointId::new(format!("{identity}@{}", hex::encode(instance)))
}

/// OS interface index for a named interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}

// ── Discovery source ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LanDiscovery {
    inner: Arc<Inner>,
}

struct Inner {
    interface_index: u32,
    instance: InstanceId,
    /// Configured listen port; 0 lets the OS pick.
    session_port: u16,
    announce_interval: Duration,
    peer_ttl: Duration,
    table: PeerTable,
    local: Mutex<LocalState>,
}

#[derive(Debug, Default)]
struct LocalState {
    /// Set while advertising.
    identity: Option<PeerIdentity>,
    /// Set while accepting.
    listen_port: Option<u16>,
}

impl Inner {
    fn local(&self) -> MutexGuard<'_, LocalState> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hello(&self, identity: PeerIdentity, service: &ServiceParams) -> Hello {
        Hello {
            identity,
            service_hash: *service.hash(),
            instance: self.instance,
            nonce: nonce(),
        }
    }
}

impl LanDiscovery {
    pub fn new(interface_index: u32, config: &DiscoveryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                interface_index,
                instance: instance_id(),
                session_port: config.session_port,
                announce_interval: config.announce_interval(),
                peer_ttl: config.peer_ttl(),
                table: Arc::new(DashMap::new()),
                local: Mutex::new(LocalState::default()),
            }),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.inner.instance
    }
}

impl DiscoverySource for LanDiscovery {
    fn advertise(
        &self,
        identity: &PeerIdentity,
        service: &ServiceParams,
    ) -> Result<Subscription, DiscoveryError> {
        let port = self
            .inner
            .local()
            .listen_port
            .ok_or_else(|| DiscoveryError::Unreachable("not accepting links".into()))?;

        let socket = announce::make_broadcast_socket(self.inner.interface_index)?;
        let datagram = announce::announcement_bytes(
            Announcement {
                identity: identity.clone(),
                session_port: port,
                service_hash: *service.hash(),
                instance: self.inner.instance,
                tag: [0u8; 32],
            },
            service,
        );

        self.inner.local().identity = Some(identity.clone());
        let task = tokio::spawn(announce::broadcast_loop(
            socket,
            datagram,
            self.inner.interface_index,
            self.inner.announce_interval,
        ));

        let inner = self.inner.clone();
        let mut sub = Subscription::on_close(move || inner.local().identity = None);
        sub.push(task);
        Ok(sub)
    }

    fn start_scanning(
        &self,
        service: &ServiceParams,
    ) -> Result<(watch::Receiver<Vec<Candidate>>, Subscription), DiscoveryError> {
        let socket = announce::make_listener_socket(self.inner.interface_index)?;
        let (tx, rx) = watch::channel(Vec::new());
        let tx = Arc::new(tx);
        let table = self.inner.table.clone();
        table.clear();

        let listener = tokio::spawn(announce::listener_loop(
            socket,
            table.clone(),
            self.inner.instance,
            service.clone(),
            tx.clone(),
        ));
        let expiry = tokio::spawn(announce::expiry_loop(table.clone(), self.inner.peer_ttl, tx));

        let mut sub = Subscription::on_close(move || table.clear());
        sub.push(listener);
        sub.push(expiry);
        Ok((rx, sub))
    }

    fn dial(&self, endpoint: &EndpointId, service: &ServiceParams) -> PendingLink {
        let inner = self.inner.clone();
        let endpoint = endpoint.clone();
        let service = service.clone();
        Box::pin(async move {
            let identity = inner
                .local()
                .identity
                .clone()
                .ok_or(TransportError::NotAdvertising)?;
            let (expected, addr, port) = inner
                .table
                .get(&endpoint)
                .map(|entry| (entry.identity.clone(), entry.addr, entry.session_port))
                .ok_or_else(|| TransportError::Unreachable(endpoint.clone()))?;

            let dest = SocketAddrV6::new(addr, port, 0, inner.interface_index);
            tracing::debug!(endpoint = %endpoint, addr = %dest, "dialing");
            let mut stream = TcpStream::connect(dest).await?;
            stream.set_nodelay(true)?;

            let ours = inner.hello(identity, &service);
            handshake::dial(&mut stream, &ours, &expected, service.auth())
                .await
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
            Ok(Connected::from_stream(stream, None))
        })
    }

    fn accept(
        &self,
        service: &ServiceParams,
    ) -> Result<(mpsc::Receiver<InboundLink>, Subscription), DiscoveryError> {
        let bind = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, self.inner.session_port, 0, 0);
        let listener = std::net::TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let port = listener.local_addr()?.port();
        self.inner.local().listen_port = Some(port);
        tracing::info!(port, "accepting links");

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(accept_loop(
            listener,
            tx,
            self.inner.clone(),
            service.clone(),
        ));

        let inner = self.inner.clone();
        let mut sub = Subscription::on_close(move || inner.local().listen_port = None);
        sub.push(task);
        Ok((rx, sub))
    }
}

/// Accept connections until aborted. Connections still sending their hello
/// live in `offers`, so aborting the loop drops them too.
async fn accept_loop(
    listener: TcpListener,
    links: mpsc::Sender<InboundLink>,
    inner: Arc<Inner>,
    service: ServiceParams,
) {
    let mut offers = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            Some(_) = offers.join_next() => continue,
        };
        let (stream, from) = match accepted {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let links = links.clone();
        let inner = inner.clone();
        let service = service.clone();
        offers.spawn(async move {
            if let Err(e) = offer(stream, links, inner, service).await {
                tracing::debug!(addr = %from, error = %e, "inbound connection dropped");
            }
        });
    }
}

/// Read the dialer's hello and hand the connection to the session layer.
/// The rest of the handshake runs when the session polls `connect`.
async fn offer(
    mut stream: TcpStream,
    links: mpsc::Sender<InboundLink>,
    inner: Arc<Inner>,
    service: ServiceParams,
) -> Result<(), HandshakeError> {
    stream.set_nodelay(true)?;
    let theirs = tokio::time::timeout(HELLO_TIMEOUT, handshake::read_hello(&mut stream))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
    if theirs.service_hash != *service.hash() {
        return Err(HandshakeError::WrongService);
    }

    let endpoint = endpoint_id(&theirs.identity, &theirs.instance);
    let peer = theirs.identity.clone();
    let connect: PendingLink = Box::pin(async move {
        let identity = inner
            .local()
            .identity
            .clone()
            .ok_or(TransportError::NotAdvertising)?;
        let ours = inner.hello(identity, &service);
        handshake::respond(&mut stream, &theirs, &ours, service.auth())
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Connected::from_stream(stream, None))
    });

    if links
        .send(InboundLink {
            endpoint,
            peer,
            connect,
        })
        .await
        .is_err()
    {
        tracing::debug!("session no longer accepting, dropping connection");
    }
    Ok(())
}
