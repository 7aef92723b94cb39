//! Announcement broadcast and listener.
//!
//! Every `announce_interval` the advertiser sends one announcement datagram
//! to ff02::1. The listener joins the same group, keeps a table of valid
//! announcements from other instances, and republishes the candidate list
//! whenever an endpoint appears or expires.

use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use tether_core::auth::ServiceParams;
use tether_core::wire::{Announcement, InstanceId, ANNOUNCE_PORT, MULTICAST_ADDR};
use tether_session::Candidate;

use super::{endpoint_id, PeerEntry, PeerTable};

const MULTICAST: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Announcement datagram for this device, tag included.
pub fn announcement_bytes(mut announcement: Announcement, service: &ServiceParams) -> Vec<u8> {
    announcement.tag = service.auth().tag(&[&announcement.tagged_bytes()[..]]);
    announcement.to_bytes()
}

/// Send `datagram` on every tick. Runs until the task is aborted.
pub async fn broadcast_loop(
    socket: Socket,
    datagram: Vec<u8>,
    interface_index: u32,
    interval: Duration,
) {
    let dest = SocketAddrV6::new(MULTICAST, ANNOUNCE_PORT, 0, interface_index);
    let mut ticker = tokio::time::interval(interval);

    tracing::info!(
        interface_index,
        group = MULTICAST_ADDR,
        bytes = datagram.len(),
        interval_ms = interval.as_millis() as u64,
        "announcement broadcast starting"
    );

    loop {
        ticker.tick().await;
        match socket.send_to(&datagram, &dest.into()) {
            Ok(n) => tracing::trace!(bytes = n, "announcement sent"),
            Err(e) => tracing::warn!(error = %e, "announcement send failed"),
        }
    }
}

/// Receive announcements into `table`. Runs until the task is aborted.
pub async fn listener_loop(
    socket: UdpSocket,
    table: PeerTable,
    own_instance: InstanceId,
    service: ServiceParams,
    candidates: Arc<watch::Sender<Vec<Candidate>>>,
) {
    let mut buf = vec![0u8; 1024];
    tracing::info!(port = ANNOUNCE_PORT, service = service.name(), "announcement listener starting");

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                continue;
            }
        };
        let sender = match from {
            std::net::SocketAddr::V6(v6) => *v6.ip(),
            std::net::SocketAddr::V4(_) => {
                tracing::warn!("received IPv4 datagram on IPv6 socket, ignoring");
                continue;
            }
        };

        let announcement = match Announcement::parse(&buf[..len]) {
            Ok(a) => a,
            Err(e) => {
                tracing::trace!(error = %e, addr = %from, "unparseable announcement");
                continue;
            }
        };
        if announcement.instance == own_instance {
            tracing::trace!("ignoring own announcement");
            continue;
        }
        if announcement.service_hash != *service.hash() {
            continue;
        }
        if !service
            .auth()
            .verify(&announcement.tag, &[&announcement.tagged_bytes()[..]])
        {
            tracing::warn!(addr = %from, identity = %announcement.identity, "announcement tag did not verify");
            continue;
        }

        let endpoint = endpoint_id(&announcement.identity, &announcement.instance);
        let fresh = table
            .insert(
                endpoint.clone(),
                PeerEntry {
                    identity: announcement.identity.clone(),
                    addr: sender,
                    session_port: announcement.session_port,
                    last_seen: Instant::now(),
                },
            )
            .is_none();
        if fresh {
            tracing::debug!(
                endpoint = %endpoint,
                addr = %from,
                port = announcement.session_port,
                "peer discovered"
            );
            publish(&table, &candidates);
        }
    }
}

/// Drop entries not refreshed within `ttl`. Runs until the task is aborted.
pub async fn expiry_loop(
    table: PeerTable,
    ttl: Duration,
    candidates: Arc<watch::Sender<Vec<Candidate>>>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1).min(ttl));
    loop {
        ticker.tick().await;

        let before = table.len();
        table.retain(|_, entry| entry.last_seen.elapsed() < ttl);
        let after = table.len();

        if before != after {
            tracing::debug!(removed = before - after, "expired peer table entries");
            publish(&table, &candidates);
        }
    }
}

/// Push the table's current contents to scanners, if they changed.
pub fn publish(table: &PeerTable, candidates: &watch::Sender<Vec<Candidate>>) {
    let mut next: Vec<Candidate> = table
        .iter()
        .map(|entry| Candidate {
            endpoint: entry.key().clone(),
            identity: entry.value().identity.clone(),
        })
        .collect();
    next.sort();
    candidates.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// A UDP socket for sending link-local multicast.
pub fn make_broadcast_socket(interface_index: u32) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_if_v6(interface_index)?;
    // Hop limit 1: never leave the link.
    socket.set_multicast_hops_v6(1)?;
    Ok(socket)
}

/// A UDP socket joined to ff02::1 on the announcement port.
pub fn make_listener_socket(interface_index: u32) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, ANNOUNCE_PORT, 0, 0);
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v6(&MULTICAST, interface_index)?;

    UdpSocket::from_std(socket.into())
}
