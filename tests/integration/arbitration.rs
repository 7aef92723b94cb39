use std::time::Duration;

use tether_session::link::Direction;
use tether_session::MemoryMedium;

use crate::*;

/// Exactly one link per pair, dialed by the higher identity, whichever
/// side comes up first.
#[tokio::test]
async fn one_link_per_pair_regardless_of_start_order() -> Result<()> {
    for (first, second) in [("Tim", "Jony"), ("Jony", "Tim")] {
        let medium = MemoryMedium::new();
        let (a, b) = pair(&medium, first, second).await?;

        // Let a few more ticks pass; nothing may be added.
        tokio::time::sleep(Duration::from_millis(300)).await;

        for node in [&a, &b] {
            let links = node.session.links().await;
            assert_eq!(links.len(), 1, "{}: {links:?}", node.session.identity());
            let expected = if node.session.identity().as_str() == "Tim" {
                Direction::Outbound
            } else {
                Direction::Inbound
            };
            assert_eq!(links[0].direction, expected);
        }
        a.session.stop().await;
        b.session.stop().await;
    }
    Ok(())
}

#[tokio::test]
async fn full_mesh_of_four() -> Result<()> {
    let medium = MemoryMedium::new();
    let names = ["Ada", "bob", "Cyd", "Dee"];
    let mut nodes = Vec::new();
    for name in names {
        nodes.push(Node::on(&medium, name).await);
    }

    for node in &mut nodes {
        let me = node.session.identity().as_str().to_string();
        let others: Vec<&str> = names.iter().copied().filter(|n| *n != me).collect();
        node.wait_reachable(&others).await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    for node in &nodes {
        let me = node.session.identity().clone();
        let links = node.session.links().await;
        assert_eq!(links.len(), 3, "{me}: {links:?}");
        for link in links {
            let expected = if me > link.peer {
                Direction::Outbound
            } else {
                Direction::Inbound
            };
            assert_eq!(link.direction, expected, "{me} -> {}", link.peer);
        }
    }

    for node in &nodes {
        node.session.stop().await;
    }
    Ok(())
}

/// Two sessions that start simultaneously still settle on one link.
#[tokio::test]
async fn simultaneous_start_settles_on_one_link() -> Result<()> {
    for _ in 0..5 {
        let medium = MemoryMedium::new();
        let mut tim = Node::new(Arc::new(medium.device()), "Tim", settings());
        let mut jony = Node::new(Arc::new(medium.device()), "Jony", settings());
        let (a, b) = tokio::join!(tim.session.start(), jony.session.start());
        a?;
        b?;

        tim.wait_reachable(&["Jony"]).await?;
        jony.wait_reachable(&["Tim"]).await?;
        assert_eq!(tim.session.links().await.len(), 1);
        assert_eq!(jony.session.links().await.len(), 1);
    }
    Ok(())
}
