//! Link registry: exactly one link per endpoint.
//!
//! Owned by the session coordinator and never shared. Every mutation is
//! addressed by `LinkKey`, so an event from a link that has already been
//! removed (and possibly replaced) finds no match and changes nothing.

use std::collections::{BTreeMap, BTreeSet};

use tokio::time::Instant;

use tether_core::{EndpointId, PeerIdentity};

use crate::framer::LinkWriter;
use crate::link::{Direction, Link, LinkHandle, LinkId, LinkKey, LinkState, LinkSummary};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("endpoint {endpoint} already has link {existing}")]
pub struct DuplicateLink {
    pub endpoint: EndpointId,
    pub existing: LinkId,
}

/// Why a send could not find a usable link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoRoute {
    /// No link to the peer at all.
    Unknown,
    /// A link exists but is still connecting.
    NotReady,
}

#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: BTreeMap<EndpointId, Link>,
    next_id: u64,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Creation ──────────────────────────────────────────────────────────────

    /// Register a link offered by the transport. The caller must refuse the
    /// offered connection when this fails.
    pub fn upsert_inbound(
        &mut self,
        endpoint: EndpointId,
        peer: PeerIdentity,
        now: Instant,
    ) -> Result<LinkId, DuplicateLink> {
        self.insert(endpoint, peer, Direction::Inbound, now)
    }

    /// Register a link this side is about to dial.
    pub fn upsert_outbound(
        &mut self,
        endpoint: EndpointId,
        peer: PeerIdentity,
        now: Instant,
    ) -> Result<LinkId, DuplicateLink> {
        self.insert(endpoint, peer, Direction::Outbound, now)
    }

    fn insert(
        &mut self,
        endpoint: EndpointId,
        peer: PeerIdentity,
        direction: Direction,
        now: Instant,
    ) -> Result<LinkId, DuplicateLink> {
        if let Some(existing) = self.links.get(&endpoint) {
            return Err(DuplicateLink {
                endpoint,
                existing: existing.id,
            });
        }
        self.next_id += 1;
        let id = LinkId(self.next_id);
        self.links
            .insert(endpoint.clone(), Link::new(id, endpoint, peer, direction, now));
        Ok(id)
    }

    // ── Updates ───────────────────────────────────────────────────────────────

    /// Store the driver handle. Hands it back if the link is gone, so the
    /// caller can cancel the orphaned driver.
    pub fn attach(&mut self, key: &LinkKey, handle: LinkHandle) -> Result<(), LinkHandle> {
        match self.current_mut(key) {
            Some(link) => {
                link.handle = handle;
                Ok(())
            }
            None => Err(handle),
        }
    }

    /// `connecting → ready`. Returns false for stale keys and for links
    /// that are not connecting.
    pub fn mark_ready(&mut self, key: &LinkKey, writer: LinkWriter, now: Instant) -> bool {
        let Some(link) = self.current_mut(key) else {
            return false;
        };
        if !link.advance(LinkState::Ready) {
            return false;
        }
        link.writer = Some(writer);
        link.last_healthy_at = Some(now);
        true
    }

    /// Record proof of life from the peer.
    pub fn touch(&mut self, key: &LinkKey, now: Instant) -> bool {
        match self.current_mut(key) {
            Some(link) if link.is_ready() => {
                link.last_healthy_at = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Start the waiting clock unless it is already running.
    pub fn mark_waiting(&mut self, key: &LinkKey, now: Instant) -> bool {
        match self.current_mut(key) {
            Some(link) => {
                link.waiting_since.get_or_insert(now);
                true
            }
            None => false,
        }
    }

    pub fn clear_waiting(&mut self, key: &LinkKey) -> bool {
        match self.current_mut(key) {
            Some(link) => link.waiting_since.take().is_some(),
            None => false,
        }
    }

    // ── Removal ───────────────────────────────────────────────────────────────

    /// Remove the link `key` names, if it is still the current one.
    pub fn terminate(&mut self, key: &LinkKey) -> Option<Link> {
        self.current_mut(key)?;
        self.remove(&key.endpoint)
    }

    /// Remove whatever link the endpoint has.
    pub fn remove(&mut self, endpoint: &EndpointId) -> Option<Link> {
        let mut link = self.links.remove(endpoint)?;
        link.advance(LinkState::Terminated);
        Some(link)
    }

    /// Remove every link.
    pub fn drain(&mut self) -> Vec<Link> {
        let endpoints: Vec<EndpointId> = self.links.keys().cloned().collect();
        endpoints
            .iter()
            .filter_map(|endpoint| self.remove(endpoint))
            .collect()
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn get(&self, endpoint: &EndpointId) -> Option<&Link> {
        self.links.get(endpoint)
    }

    pub fn contains(&self, endpoint: &EndpointId) -> bool {
        self.links.contains_key(endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Identities of every ready link.
    pub fn ready_peers(&self) -> BTreeSet<PeerIdentity> {
        self.links
            .values()
            .filter(|link| link.is_ready())
            .map(|link| link.peer.clone())
            .collect()
    }

    /// Writer of the newest ready link to `peer`.
    pub fn route_to(&self, peer: &PeerIdentity) -> Result<(LinkKey, LinkWriter), NoRoute> {
        let mut known = false;
        let mut best: Option<&Link> = None;
        for link in self.links.values().filter(|link| &link.peer == peer) {
            known = true;
            if link.is_ready() && best.map_or(true, |b| link.id > b.id) {
                best = Some(link);
            }
        }
        match best.and_then(|link| link.writer.clone().map(|w| (link.key(), w))) {
            Some(route) => Ok(route),
            None if known => Err(NoRoute::NotReady),
            None => Err(NoRoute::Unknown),
        }
    }

    /// Diagnostics view, ordered by endpoint.
    pub fn snapshot(&self, now: Instant) -> Vec<LinkSummary> {
        self.links.values().map(|link| link.summary(now)).collect()
    }

    fn current_mut(&mut self, key: &LinkKey) -> Option<&mut Link> {
        self.links
            .get_mut(&key.endpoint)
            .filter(|link| link.id == key.id)
    }
}

// ── Reachable set ─────────────────────────────────────────────────────────────

/// Last published reachable-peer set.
#[derive(Debug, Default)]
pub struct ReachablePeers {
    current: BTreeSet<PeerIdentity>,
}

impl ReachablePeers {
    /// Recompute from scratch. Returns the new set only if it changed.
    pub fn reconcile(&mut self, registry: &LinkRegistry) -> Option<BTreeSet<PeerIdentity>> {
        let next = registry.ready_peers();
        if next == self.current {
            return None;
        }
        self.current = next.clone();
        Some(next)
    }

    /// Forget everything. Returns the empty set if it was non-empty.
    pub fn clear(&mut self) -> Option<BTreeSet<PeerIdentity>> {
        if self.current.is_empty() {
            return None;
        }
        self.current.clear();
        Some(BTreeSet::new())
    }
}
