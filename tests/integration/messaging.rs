use serde::{Deserialize, Serialize};

use tether_session::link::Direction;
use tether_session::{LinkState, MemoryMedium, SendError};

use crate::*;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Note {
    text: String,
    seq: u32,
}

/// Tim orders above Jony, so Tim dials. Both see each other and a message
/// sent one way arrives intact on the other.
#[tokio::test]
async fn tim_and_jony_exchange_messages() -> Result<()> {
    let medium = MemoryMedium::new();
    let (tim, mut jony) = pair(&medium, "Tim", "Jony").await?;

    let links = tim.session.links().await;
    assert_eq!(links.len(), 1, "tim links: {links:?}");
    assert_eq!(links[0].direction, Direction::Outbound);
    assert_eq!(links[0].state, LinkState::Ready);
    let links = jony.session.links().await;
    assert_eq!(links.len(), 1, "jony links: {links:?}");
    assert_eq!(links[0].direction, Direction::Inbound);

    tim.session.send(&id("Jony"), 42, &b"hi"[..]).await?;
    let message = jony.next_message().await?;
    assert_eq!(message.from, id("Tim"));
    assert_eq!(message.message_type, 42);
    assert_eq!(&message.payload[..], b"hi");

    tim.session.stop().await;
    jony.session.stop().await;
    Ok(())
}

#[tokio::test]
async fn json_round_trip_both_directions() -> Result<()> {
    let medium = MemoryMedium::new();
    let (mut tim, mut jony) = pair(&medium, "Tim", "Jony").await?;

    let note = Note {
        text: "ship it".into(),
        seq: 7,
    };
    jony.session.send_json(&id("Tim"), 9, &note).await?;
    let got = tim.next_message().await?;
    assert_eq!(got.from, id("Jony"));
    assert_eq!(got.json::<Note>()?, note);

    tim.session.send_json(&id("Jony"), 9, &Note { text: "ack".into(), seq: 8 }).await?;
    assert_eq!(jony.next_message().await?.json::<Note>()?.seq, 8);
    Ok(())
}

/// Messages on one link arrive in the order they were sent.
#[tokio::test]
async fn ordering_is_preserved() -> Result<()> {
    let medium = MemoryMedium::new();
    let (tim, mut jony) = pair(&medium, "Tim", "Jony").await?;

    for seq in 0..50u32 {
        tim.session.send(&id("Jony"), 1, seq.to_be_bytes().to_vec()).await?;
    }
    for seq in 0..50u32 {
        let message = jony.next_message().await?;
        assert_eq!(&message.payload[..], &seq.to_be_bytes()[..]);
    }
    Ok(())
}

#[tokio::test]
async fn empty_and_large_payloads_arrive() -> Result<()> {
    let medium = MemoryMedium::new();
    let (tim, mut jony) = pair(&medium, "Tim", "Jony").await?;

    tim.session.send(&id("Jony"), 5, Vec::new()).await?;
    let message = jony.next_message().await?;
    assert_eq!(message.message_type, 5);
    assert!(message.payload.is_empty());

    let big: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    tim.session.send(&id("Jony"), 6, big.clone()).await?;
    assert_eq!(&jony.next_message().await?.payload[..], &big[..]);
    Ok(())
}

#[tokio::test]
async fn send_errors_are_typed() -> Result<()> {
    let medium = MemoryMedium::new();
    let (tim, _jony) = pair(&medium, "Tim", "Jony").await?;

    assert_eq!(
        tim.session.send(&id("Nobody"), 1, &b"x"[..]).await,
        Err(SendError::NoSuchPeer(id("Nobody")))
    );
    assert_eq!(
        tim.session.send(&id("Jony"), 0, &b"x"[..]).await,
        Err(SendError::ReservedType)
    );

    tim.session.stop().await;
    assert_eq!(
        tim.session.send(&id("Jony"), 1, &b"x"[..]).await,
        Err(SendError::NotRunning)
    );
    Ok(())
}

#[tokio::test]
async fn oversized_payload_is_refused_before_sending() -> Result<()> {
    let medium = MemoryMedium::new();
    let small = SessionSettings {
        max_payload_bytes: 16,
        ..settings()
    };
    let mut tim = Node::with_settings(&medium, "Tim", small.clone()).await;
    let mut jony = Node::with_settings(&medium, "Jony", small).await;
    tim.wait_reachable(&["Jony"]).await?;

    assert_eq!(
        tim.session.send(&id("Jony"), 1, vec![0u8; 17]).await,
        Err(SendError::PayloadTooLarge { len: 17, max: 16 })
    );
    // The link survives the refusal.
    tim.session.send(&id("Jony"), 1, vec![1u8; 16]).await?;
    assert_eq!(jony.next_message().await?.payload.len(), 16);
    Ok(())
}
