//! The session's single owner of link state.
//!
//! One task per running session. Commands from the facade, link driver
//! events, inbound links, discovery updates and health ticks all arrive on
//! one `select!` loop, so the registry is never shared or locked.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use tether_core::auth::ServiceParams;
use tether_core::{EndpointId, Frame, PeerIdentity};

use crate::driver::{spawn_link, CloseReason, DriverSettings, LinkEvent};
use crate::framer::LinkWriter;
use crate::health::{plan_tick, HealthPolicy};
use crate::link::{Link, LinkKey, LinkSummary};
use crate::registry::{LinkRegistry, NoRoute, ReachablePeers};
use crate::session::{InboundMessage, SessionEvent};
use crate::transport::{
    Candidate, DiscoverySource, InboundLink, PathStatus, PendingLink, Subscription,
};

/// Driver events buffered before drivers wait on the coordinator.
const LINK_EVENT_BUFFER: usize = 256;

pub(crate) enum Command {
    Route {
        peer: PeerIdentity,
        reply: oneshot::Sender<Result<(LinkKey, LinkWriter), NoRoute>>,
    },
    /// A send through `key` failed; the link is unusable.
    Failed { key: LinkKey, reason: String },
    Snapshot {
        reply: oneshot::Sender<Vec<LinkSummary>>,
    },
    Stop,
}

/// Channels and subscriptions a coordinator runs on.
pub(crate) struct Inputs {
    pub commands: mpsc::Receiver<Command>,
    pub inbound: mpsc::Receiver<InboundLink>,
    pub scan: watch::Receiver<Vec<Candidate>>,
    /// Advertisement, scan and accept, closed in that order on shutdown.
    pub subscriptions: Vec<Subscription>,
    pub interval: Duration,
}

pub(crate) struct Coordinator {
    identity: PeerIdentity,
    service: ServiceParams,
    discovery: Arc<dyn DiscoverySource>,
    policy: HealthPolicy,
    driver: DriverSettings,

    registry: LinkRegistry,
    reachable: ReachablePeers,
    candidates: Vec<Candidate>,
    quarantined: HashSet<EndpointId>,
    /// Drivers of removed links that may still be winding down.
    draining: Vec<JoinHandle<()>>,
    pings: JoinSet<()>,

    link_tx: mpsc::Sender<LinkEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
    peers: Arc<watch::Sender<BTreeSet<PeerIdentity>>>,
}

impl Coordinator {
    pub fn new(
        identity: PeerIdentity,
        service: ServiceParams,
        discovery: Arc<dyn DiscoverySource>,
        policy: HealthPolicy,
        driver: DriverSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
        peers: Arc<watch::Sender<BTreeSet<PeerIdentity>>>,
    ) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (link_tx, link_rx) = mpsc::channel(LINK_EVENT_BUFFER);
        let coordinator = Self {
            identity,
            service,
            discovery,
            policy,
            driver,
            registry: LinkRegistry::new(),
            reachable: ReachablePeers::default(),
            candidates: Vec::new(),
            quarantined: HashSet::new(),
            draining: Vec::new(),
            pings: JoinSet::new(),
            link_tx,
            events,
            peers,
        };
        (coordinator, link_rx)
    }

    pub async fn run(mut self, mut link_rx: mpsc::Receiver<LinkEvent>, inputs: Inputs) {
        let Inputs {
            mut commands,
            mut inbound,
            mut scan,
            subscriptions,
            interval,
        } = inputs;

        self.candidates = scan.borrow_and_update().clone();
        let mut accepting = true;
        let mut scanning = true;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(identity = %self.identity, service = self.service.name(), "session coordinator started");

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Stop) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },

                Some(event) = link_rx.recv() => self.on_link_event(event),

                link = inbound.recv(), if accepting => match link {
                    Some(link) => self.on_inbound(link),
                    None => {
                        tracing::warn!("discovery stopped delivering inbound links");
                        accepting = false;
                    }
                },

                changed = scan.changed(), if scanning => match changed {
                    Ok(()) => {
                        self.candidates = scan.borrow_and_update().clone();
                        tracing::debug!(candidates = self.candidates.len(), "discovery results updated");
                    }
                    Err(_) => {
                        tracing::warn!("discovery scanner stopped");
                        scanning = false;
                    }
                },

                Some(_) = self.pings.join_next(), if !self.pings.is_empty() => {}

                _ = ticker.tick() => self.tick(),
            }
        }

        self.shutdown(link_rx, subscriptions).await;
    }

    // ── Inputs ────────────────────────────────────────────────────────────────

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Route { peer, reply } => {
                let _ = reply.send(self.registry.route_to(&peer));
            }
            Command::Failed { key, reason } => {
                self.close_link(&key, CloseReason::Io(reason));
                self.publish();
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot(Instant::now()));
            }
            Command::Stop => {}
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        let now = Instant::now();
        match event {
            LinkEvent::Ready { key, writer } => {
                if self.registry.mark_ready(&key, writer, now) {
                    if let Some(link) = self.registry.get(&key.endpoint) {
                        tracing::info!(
                            peer = %link.peer,
                            endpoint = %key.endpoint,
                            link = %key.id,
                            direction = %link.direction,
                            "link ready"
                        );
                    }
                }
            }
            LinkEvent::Frame { key, frame } => {
                if !self.registry.touch(&key, now) || frame.is_ping() {
                    return;
                }
                if let Some(link) = self.registry.get(&key.endpoint) {
                    let message = InboundMessage {
                        from: link.peer.clone(),
                        message_type: frame.message_type,
                        payload: frame.payload,
                    };
                    let _ = self.events.send(SessionEvent::Message(message));
                }
            }
            LinkEvent::Path { key, status } => match status {
                PathStatus::Waiting if self.policy.waiting_grace.is_zero() => {
                    if let Some(link) = self.registry.terminate(&key) {
                        tracing::warn!(peer = %link.peer, endpoint = %key.endpoint, "link waiting for connectivity, dropping");
                        self.retire(link);
                    }
                }
                PathStatus::Waiting => {
                    if self.registry.mark_waiting(&key, now) {
                        tracing::debug!(endpoint = %key.endpoint, "link waiting for connectivity");
                    }
                }
                PathStatus::Viable => {
                    if self.registry.clear_waiting(&key) {
                        tracing::debug!(endpoint = %key.endpoint, "link viable again");
                    }
                }
            },
            LinkEvent::Closed { key, reason } => self.close_link(&key, reason),
        }
        self.publish();
    }

    fn on_inbound(&mut self, link: InboundLink) {
        let InboundLink {
            endpoint,
            peer,
            connect,
        } = link;
        if peer == self.identity {
            tracing::error!(endpoint = %endpoint, identity = %peer, "inbound link claims our own identity, refusing");
            return;
        }
        match self
            .registry
            .upsert_inbound(endpoint.clone(), peer.clone(), Instant::now())
        {
            Ok(id) => {
                tracing::debug!(peer = %peer, endpoint = %endpoint, link = %id, "accepting inbound link");
                self.spawn_driver(LinkKey { endpoint, id }, connect);
            }
            Err(dup) => {
                // Dropping `connect` refuses the connection.
                tracing::debug!(peer = %peer, error = %dup, "refusing duplicate inbound link");
            }
        }
    }

    // ── Health tick ───────────────────────────────────────────────────────────

    fn tick(&mut self) {
        self.draining.retain(|task| !task.is_finished());

        let now = Instant::now();
        let plan = plan_tick(
            &self.registry,
            &self.candidates,
            &self.identity,
            &self.policy,
            &self.quarantined,
            now,
        );

        for (key, writer) in plan.ping {
            let events = self.link_tx.clone();
            self.pings.spawn(async move {
                if let Err(e) = writer.send(&Frame::ping()).await {
                    let reason = CloseReason::PingFailed(e.to_string());
                    let _ = events.send(LinkEvent::Closed { key, reason }).await;
                }
            });
        }

        for (key, reason) in plan.evict {
            if let Some(link) = self.registry.terminate(&key) {
                tracing::warn!(peer = %link.peer, endpoint = %key.endpoint, link = %key.id, reason = %reason, "evicting link");
                self.retire(link);
            }
        }

        for (candidate, collision) in plan.collisions {
            tracing::error!(endpoint = %candidate.endpoint, error = %collision, "identity collision, ignoring candidate");
            self.quarantined.insert(candidate.endpoint);
            let _ = self
                .events
                .send(SessionEvent::IdentityCollision(candidate.identity));
        }

        for candidate in plan.dial {
            self.dial(candidate, now);
        }

        self.publish();
    }

    fn dial(&mut self, candidate: Candidate, now: Instant) {
        let Candidate { endpoint, identity } = candidate;
        match self
            .registry
            .upsert_outbound(endpoint.clone(), identity.clone(), now)
        {
            Ok(id) => {
                tracing::debug!(peer = %identity, endpoint = %endpoint, link = %id, "we order higher, dialing");
                let pending = self.discovery.dial(&endpoint, &self.service);
                self.spawn_driver(LinkKey { endpoint, id }, pending);
            }
            Err(dup) => tracing::debug!(error = %dup, "dial skipped"),
        }
    }

    // ── Link plumbing ─────────────────────────────────────────────────────────

    fn spawn_driver(&mut self, key: LinkKey, pending: PendingLink) {
        let handle = spawn_link(key.clone(), pending, self.link_tx.clone(), self.driver);
        if let Err(mut orphan) = self.registry.attach(&key, handle) {
            if let Some(task) = orphan.cancel() {
                self.draining.push(task);
            }
        }
    }

    fn close_link(&mut self, key: &LinkKey, reason: CloseReason) {
        let Some(link) = self.registry.terminate(key) else {
            return;
        };
        match reason {
            CloseReason::PeerClosed => {
                tracing::info!(peer = %link.peer, endpoint = %key.endpoint, link = %key.id, "link closed by peer")
            }
            reason => {
                tracing::warn!(peer = %link.peer, endpoint = %key.endpoint, link = %key.id, reason = %reason, "link lost")
            }
        }
        self.retire(link);
    }

    /// Cancel a removed link's driver without waiting for it.
    fn retire(&mut self, mut link: Link) {
        if let Some(task) = link.handle.cancel() {
            self.draining.push(task);
        }
    }

    fn publish(&mut self) {
        if let Some(peers) = self.reachable.reconcile(&self.registry) {
            self.announce(peers);
        }
    }

    fn announce(&self, peers: BTreeSet<PeerIdentity>) {
        tracing::info!(
            peers = ?peers.iter().map(PeerIdentity::as_str).collect::<Vec<_>>(),
            "reachable peers changed"
        );
        self.peers.send_replace(peers.clone());
        let _ = self.events.send(SessionEvent::PeersChanged(peers));
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    async fn shutdown(mut self, mut link_rx: mpsc::Receiver<LinkEvent>, subscriptions: Vec<Subscription>) {
        link_rx.close();
        self.pings.shutdown().await;

        let mut tasks = std::mem::take(&mut self.draining);
        for mut link in self.registry.drain() {
            if let Some(task) = link.handle.cancel() {
                tasks.push(task);
            }
        }
        let count = tasks.len();
        futures::future::join_all(tasks).await;

        for subscription in subscriptions {
            subscription.close().await;
        }

        if let Some(peers) = self.reachable.clear() {
            self.announce(peers);
        }
        tracing::info!(identity = %self.identity, drivers = count, "session coordinator stopped");
    }
}
