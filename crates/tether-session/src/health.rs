//! Health tick planning.
//!
//! `plan_tick` decides, from the registry and the latest discovery results,
//! which links to ping, which to evict and which candidates to dial. It does
//! no I/O; the coordinator executes the plan in that order and then
//! recomputes the reachable set.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use tether_core::config::SessionSettings;
use tether_core::{EndpointId, PeerIdentity};

use crate::arbitration::{should_initiate, IdentityCollision};
use crate::framer::LinkWriter;
use crate::link::{Link, LinkKey, LinkState};
use crate::registry::LinkRegistry;
use crate::transport::Candidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub connect_timeout: Duration,
    pub liveness_timeout: Duration,
    pub waiting_grace: Duration,
}

impl From<&SessionSettings> for HealthPolicy {
    fn from(s: &SessionSettings) -> Self {
        Self {
            connect_timeout: s.connect_timeout(),
            liveness_timeout: s.liveness_timeout(),
            waiting_grace: s.waiting_grace(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Still connecting after `connect_timeout`.
    ConnectTimeout,
    /// Ready but nothing heard for longer than `liveness_timeout`.
    Silent,
    /// Transport waiting for connectivity for longer than `waiting_grace`.
    Waiting,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictReason::ConnectTimeout => f.write_str("connect timeout"),
            EvictReason::Silent => f.write_str("liveness timeout"),
            EvictReason::Waiting => f.write_str("waiting for connectivity"),
        }
    }
}

#[derive(Debug, Default)]
pub struct TickPlan {
    pub ping: Vec<(LinkKey, LinkWriter)>,
    pub evict: Vec<(LinkKey, EvictReason)>,
    pub dial: Vec<Candidate>,
    /// Candidates advertising our own identity, not reported before.
    pub collisions: Vec<(Candidate, IdentityCollision)>,
}

pub fn plan_tick(
    registry: &LinkRegistry,
    candidates: &[Candidate],
    me: &PeerIdentity,
    policy: &HealthPolicy,
    quarantined: &HashSet<EndpointId>,
    now: Instant,
) -> TickPlan {
    let mut plan = TickPlan::default();

    for link in registry.iter() {
        if let (LinkState::Ready, Some(writer)) = (link.state, &link.writer) {
            plan.ping.push((link.key(), writer.clone()));
        }
        if let Some(reason) = eviction(link, policy, now) {
            plan.evict.push((link.key(), reason));
        }
    }

    // Links evicted this tick no longer count as present.
    let evicted: HashSet<&EndpointId> = plan.evict.iter().map(|(key, _)| &key.endpoint).collect();
    let mut linked_peers: BTreeSet<&PeerIdentity> = registry
        .iter()
        .filter(|link| !evicted.contains(&link.endpoint))
        .map(|link| &link.peer)
        .collect();

    for candidate in candidates {
        if quarantined.contains(&candidate.endpoint) {
            continue;
        }
        let has_link =
            registry.contains(&candidate.endpoint) && !evicted.contains(&candidate.endpoint);
        match should_initiate(me, has_link, &candidate.identity) {
            Ok(true) => {
                // One dial per peer, even when it shows up under two endpoints.
                if linked_peers.insert(&candidate.identity) {
                    plan.dial.push(candidate.clone());
                }
            }
            Ok(false) => {}
            Err(collision) => {
                if !plan.collisions.iter().any(|(c, _)| c.endpoint == candidate.endpoint) {
                    plan.collisions.push((candidate.clone(), collision));
                }
            }
        }
    }

    plan
}

fn eviction(link: &Link, policy: &HealthPolicy, now: Instant) -> Option<EvictReason> {
    if let Some(since) = link.waiting_since {
        if now.saturating_duration_since(since) > policy.waiting_grace {
            return Some(EvictReason::Waiting);
        }
    }
    match link.state {
        LinkState::Connecting
            if now.saturating_duration_since(link.created_at) > policy.connect_timeout =>
        {
            Some(EvictReason::ConnectTimeout)
        }
        LinkState::Ready => {
            let heard = link.last_healthy_at.unwrap_or(link.created_at);
            (now.saturating_duration_since(heard) > policy.liveness_timeout)
                .then_some(EvictReason::Silent)
        }
        _ => None,
    }
}
