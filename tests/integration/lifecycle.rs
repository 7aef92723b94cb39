use std::time::Duration;

use tether_session::{MemoryMedium, SessionError};

use crate::*;

#[tokio::test]
async fn stop_is_idempotent() -> Result<()> {
    let medium = MemoryMedium::new();
    let idle = Node::new(Arc::new(medium.device()), "Idle", settings());
    idle.session.stop().await;
    idle.session.stop().await;
    assert!(!idle.session.is_running().await);

    let (tim, mut jony) = pair(&medium, "Tim", "Jony").await?;
    tim.session.stop().await;
    tim.session.stop().await;
    assert!(tim.session.links().await.is_empty());
    assert!(tim.session.reachable_peers().is_empty());
    jony.wait_reachable(&[]).await?;
    Ok(())
}

#[tokio::test]
async fn stop_publishes_the_empty_set_once() -> Result<()> {
    let medium = MemoryMedium::new();
    let (mut tim, _jony) = pair(&medium, "Tim", "Jony").await?;
    while tim.events.try_recv().is_some() {}

    tim.session.stop().await;
    tim.session.stop().await;

    let mut changes = Vec::new();
    while let Some(event) = tim.events.try_recv() {
        if let SessionEvent::PeersChanged(peers) = event {
            changes.push(peers);
        }
    }
    assert_eq!(changes, vec![BTreeSet::new()]);
    Ok(())
}

#[tokio::test]
async fn start_is_a_no_op_while_running() -> Result<()> {
    let medium = MemoryMedium::new();
    let (tim, _jony) = pair(&medium, "Tim", "Jony").await?;
    tim.session.start().await?;
    tim.session.start().await?;
    assert_eq!(tim.session.links().await.len(), 1);
    // A second advertisement would have shown up as a second endpoint.
    assert_eq!(
        medium
            .advertised()
            .iter()
            .filter(|c| c.identity == id("Tim"))
            .count(),
        1
    );
    Ok(())
}

/// Background/foreground cycles re-establish the pair without piling up
/// links or advertisements.
#[tokio::test]
async fn stop_start_cycles_do_not_leak() -> Result<()> {
    let medium = MemoryMedium::new();
    let (mut tim, mut jony) = pair(&medium, "Tim", "Jony").await?;

    for round in 0..3 {
        jony.session.stop().await;
        assert!(jony.session.links().await.is_empty(), "round {round}");
        tim.wait_reachable(&[]).await?;

        jony.session.start().await?;
        tim.wait_reachable(&["Jony"]).await?;
        jony.wait_reachable(&["Tim"]).await?;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(tim.session.links().await.len(), 1);
    assert_eq!(jony.session.links().await.len(), 1);
    assert_eq!(medium.advertised().len(), 2);
    Ok(())
}

#[tokio::test]
async fn identity_in_use_fails_start() -> Result<()> {
    let medium = MemoryMedium::new();
    let first = Node::on(&medium, "Tim").await;
    let second = Node::new(Arc::new(medium.device()), "Tim", settings());

    let err = second.session.start().await.unwrap_err();
    assert!(matches!(err, SessionError::IdentityInUse(ref who) if *who == id("Tim")));
    assert!(err.is_configuration());
    assert!(!second.session.is_running().await);

    // The name frees up once the first device stops advertising.
    first.session.stop().await;
    second.session.start().await?;
    assert!(second.session.is_running().await);
    Ok(())
}

#[tokio::test]
async fn invalid_settings_fail_start() {
    let medium = MemoryMedium::new();
    let broken = SessionSettings {
        liveness_timeout_ms: 50,
        health_check_interval_ms: 50,
        ..settings()
    };
    let node = Node::new(Arc::new(medium.device()), "Tim", broken);
    let err = node.session.start().await.unwrap_err();
    assert!(matches!(err, SessionError::Configuration(_)));
    assert!(medium.advertised().is_empty());
}

/// Peers on the same service with a different secret never see each other.
#[tokio::test]
async fn different_secrets_stay_apart() -> Result<()> {
    let medium = MemoryMedium::new();
    let tim = Node::on(&medium, "Tim").await;
    let (stranger, _events) = Session::new(
        id("Jony"),
        settings(),
        ServiceParams::new(SERVICE, "some other secret")?,
        Arc::new(medium.device()),
    );
    stranger.start().await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(tim.session.links().await.is_empty());
    assert!(stranger.links().await.is_empty());
    assert!(tim.session.reachable_peers().is_empty());
    Ok(())
}
