use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};

use tether_core::EndpointId;
use tether_session::{
    Candidate, DiscoveryError, InboundLink, PendingLink, Subscription, TransportError,
};

use crate::*;

/// A discovery source with a fixed candidate list whose dials all fail.
struct Scripted {
    candidates: watch::Sender<Vec<Candidate>>,
    dialed: Mutex<Vec<EndpointId>>,
}

impl Scripted {
    fn new(candidates: &[(&str, &str)]) -> Arc<Self> {
        let candidates = candidates
            .iter()
            .map(|(endpoint, identity)| Candidate {
                endpoint: EndpointId::new(*endpoint),
                identity: id(identity),
            })
            .collect();
        let (tx, _) = watch::channel(candidates);
        Arc::new(Self {
            candidates: tx,
            dialed: Mutex::new(Vec::new()),
        })
    }

    fn dialed(&self) -> Vec<EndpointId> {
        self.dialed.lock().unwrap().clone()
    }
}

impl DiscoverySource for Scripted {
    fn advertise(
        &self,
        _identity: &PeerIdentity,
        _service: &ServiceParams,
    ) -> Result<Subscription, DiscoveryError> {
        Ok(Subscription::default())
    }

    fn start_scanning(
        &self,
        _service: &ServiceParams,
    ) -> Result<(watch::Receiver<Vec<Candidate>>, Subscription), DiscoveryError> {
        Ok((self.candidates.subscribe(), Subscription::default()))
    }

    fn dial(&self, endpoint: &EndpointId, _service: &ServiceParams) -> PendingLink {
        self.dialed.lock().unwrap().push(endpoint.clone());
        let endpoint = endpoint.clone();
        async move { Err(TransportError::Unreachable(endpoint)) }.boxed()
    }

    fn accept(
        &self,
        _service: &ServiceParams,
    ) -> Result<(mpsc::Receiver<InboundLink>, Subscription), DiscoveryError> {
        let (tx, rx) = mpsc::channel(1);
        Ok((rx, Subscription::on_close(move || drop(tx))))
    }
}

fn collisions(node: &mut Node) -> Vec<PeerIdentity> {
    let mut seen = Vec::new();
    while let Some(event) = node.events.try_recv() {
        if let SessionEvent::IdentityCollision(who) = event {
            seen.push(who);
        }
    }
    seen
}

/// A device advertising our own identity is reported once and never dialed.
#[tokio::test]
async fn own_identity_is_reported_once_and_ignored() -> Result<()> {
    let source = Scripted::new(&[("lan:Tim@impostor", "Tim"), ("lan:Jony@1", "Jony")]);
    let mut tim = Node::new(source.clone(), "Tim", settings());
    tim.session.start().await?;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(collisions(&mut tim), vec![id("Tim")]);

    let dialed = source.dialed();
    assert!(!dialed.is_empty(), "jony should have been dialed");
    assert!(dialed.iter().all(|e| e.as_str() == "lan:Jony@1"), "{dialed:?}");
    tim.session.stop().await;
    Ok(())
}

#[tokio::test]
async fn lower_identity_waits_to_be_dialed() -> Result<()> {
    let source = Scripted::new(&[("lan:Zed@1", "Zed")]);
    let ada = Node::new(source.clone(), "Ada", settings());
    ada.session.start().await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(source.dialed().is_empty());
    assert!(ada.session.links().await.is_empty());
    Ok(())
}

/// Failed dials leave no trace and are retried on later ticks.
#[tokio::test]
async fn failed_dials_are_retried() -> Result<()> {
    let source = Scripted::new(&[("lan:Ada@1", "Ada")]);
    let zed = Node::new(source.clone(), "Zed", settings());
    zed.session.start().await?;

    let source_ref = &source;
    eventually("three dial attempts", || async move {
        source_ref.dialed().len() >= 3
    })
    .await?;
    assert!(zed.session.reachable_peers().is_empty());

    zed.session.stop().await;
    assert!(zed.session.links().await.is_empty());
    Ok(())
}
