use std::time::{Duration, Instant};

use tether_session::link::LinkId;
use tether_session::{LinkState, MemoryMedium};

use crate::*;

/// Id of the first link found in `state`, polling until one shows up.
async fn link_in_state(session: &Session, state: LinkState) -> Result<LinkId> {
    tokio::time::timeout(PATIENCE, async {
        loop {
            if let Some(link) = session.links().await.iter().find(|l| l.state == state) {
                return link.id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("no {state} link appeared"))
}

/// A dial that never completes is discarded after `connect_timeout` and a
/// fresh attempt takes its place.
#[tokio::test]
async fn stuck_connect_is_evicted_and_retried() -> Result<()> {
    let medium = MemoryMedium::new();
    medium.stall_handshakes(true);
    let mut tim = Node::on(&medium, "Tim").await;
    let mut jony = Node::on(&medium, "Jony").await;

    let first = link_in_state(&tim.session, LinkState::Connecting).await?;
    let started = Instant::now();
    let session = &tim.session;
    eventually("a replacement attempt", || async move {
        session.links().await.iter().any(|l| l.id != first)
    })
    .await?;
    assert!(
        started.elapsed() >= Duration::from_millis(200),
        "replaced after {:?}",
        started.elapsed()
    );
    assert!(tim.session.reachable_peers().is_empty());
    assert!(jony.session.links().await.is_empty());

    medium.stall_handshakes(false);
    tim.wait_reachable(&["Jony"]).await?;
    jony.wait_reachable(&["Tim"]).await?;
    Ok(())
}

/// A peer that stops transmitting drops out after `liveness_timeout` and
/// comes back once it talks again.
#[tokio::test]
async fn silent_peer_is_evicted_then_recovers() -> Result<()> {
    let medium = MemoryMedium::new();
    let (mut tim, mut jony) = pair(&medium, "Tim", "Jony").await?;

    let muted_at = Instant::now();
    medium.mute("Jony");
    tim.wait_for_peers("jony to go silent", |p| p.is_empty()).await?;
    let took = muted_at.elapsed();
    assert!(took >= Duration::from_millis(300), "evicted after {took:?}");
    assert!(took < Duration::from_secs(2), "evicted after {took:?}");

    medium.unmute("Jony");
    tim.wait_reachable(&["Jony"]).await?;
    jony.wait_reachable(&["Tim"]).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    tim.session.send(&id("Jony"), 3, &b"welcome back"[..]).await?;
    assert_eq!(&jony.next_message().await?.payload[..], b"welcome back");
    Ok(())
}

/// With no grace, a link whose path is waiting for connectivity is dropped
/// at once; the pair reconnects when the path is viable again.
#[tokio::test]
async fn waiting_path_terminates_without_grace() -> Result<()> {
    let medium = MemoryMedium::new();
    let (mut tim, mut jony) = pair(&medium, "Tim", "Jony").await?;

    medium.set_waiting("Jony", true);
    jony.wait_for_peers("waiting link to drop", |p| p.is_empty()).await?;

    medium.set_waiting("Jony", false);
    jony.wait_reachable(&["Tim"]).await?;
    tim.wait_reachable(&["Jony"]).await?;
    Ok(())
}

/// Within the grace period a waiting link is kept; past it, evicted.
#[tokio::test]
async fn waiting_grace_keeps_link_briefly() -> Result<()> {
    let medium = MemoryMedium::new();
    let patient = SessionSettings {
        waiting_grace_ms: 400,
        ..settings()
    };
    let mut tim = Node::with_settings(&medium, "Tim", patient.clone()).await;
    let mut jony = Node::with_settings(&medium, "Jony", patient).await;
    tim.wait_reachable(&["Jony"]).await?;
    jony.wait_reachable(&["Tim"]).await?;
    let link = link_in_state(&jony.session, LinkState::Ready).await?;

    let session = &jony.session;
    medium.set_waiting("Jony", true);
    eventually("link marked waiting", || async move {
        session.links().await.iter().any(|l| l.waiting)
    })
    .await?;
    medium.set_waiting("Jony", false);
    eventually("link viable again", || async move {
        session.links().await.iter().all(|l| !l.waiting)
    })
    .await?;

    let links = jony.session.links().await;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].id, link, "link should have survived a brief wait");

    let waiting_at = Instant::now();
    medium.set_waiting("Jony", true);
    jony.wait_for_peers("waiting link to be evicted", |p| p.is_empty()).await?;
    assert!(waiting_at.elapsed() >= Duration::from_millis(300));
    Ok(())
}

/// Once a peer withdraws its advertisement, a lost link to it is not
/// replaced.
#[tokio::test]
async fn vanished_peer_is_not_redialed() -> Result<()> {
    let medium = MemoryMedium::new();
    let (mut tim, _jony) = pair(&medium, "Tim", "Jony").await?;

    medium.vanish("Jony");
    assert!(medium.advertised().iter().all(|c| c.identity != id("Jony")));

    // The established link outlives the advertisement until it goes silent.
    medium.mute("Jony");
    tim.wait_for_peers("jony to go silent", |p| p.is_empty()).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(tim.session.links().await.is_empty());
    assert!(tim.session.reachable_peers().is_empty());
    Ok(())
}

async fn ready_link_to(session: &Session, peer: &str) -> Result<LinkId> {
    session
        .links()
        .await
        .iter()
        .find(|l| l.peer.as_str() == peer && l.state == LinkState::Ready)
        .map(|l| l.id)
        .with_context(|| format!("no ready link to {peer}"))
}

/// A malformed frame closes the link it arrived on; the receiver's other
/// links carry on.
#[tokio::test]
async fn malformed_frame_closes_only_its_own_link() -> Result<()> {
    let medium = MemoryMedium::new();
    let mut ada = Node::on(&medium, "Ada").await;
    let mut bob = Node::on(&medium, "Bob").await;
    let mut cyd = Node::on(&medium, "Cyd").await;
    ada.wait_reachable(&["Bob", "Cyd"]).await?;
    bob.wait_reachable(&["Ada", "Cyd"]).await?;
    cyd.wait_reachable(&["Ada", "Bob"]).await?;

    let to_bob = ready_link_to(&ada.session, "Bob").await?;
    let to_cyd = ready_link_to(&ada.session, "Cyd").await?;

    medium.garble("Bob");
    ada.wait_reachable(&["Cyd"]).await?;
    assert_eq!(ready_link_to(&ada.session, "Cyd").await?, to_cyd);
    ada.session.send(&id("Cyd"), 5, &b"still here"[..]).await?;
    assert_eq!(&cyd.next_message().await?.payload[..], b"still here");

    ada.wait_reachable(&["Bob", "Cyd"]).await?;
    assert_ne!(ready_link_to(&ada.session, "Bob").await?, to_bob);
    assert_eq!(ready_link_to(&ada.session, "Cyd").await?, to_cyd);
    Ok(())
}
