//! Who dials whom.
//!
//! Both sides of a pair run the same rule over the same two identities, so
//! exactly one of them initiates and the other waits for the inbound link.

use tether_core::PeerIdentity;

/// Two devices advertise the same identity. Neither side can ever win
/// arbitration, so the pair is never connected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("peer advertises our own identity {0}")]
pub struct IdentityCollision(pub PeerIdentity);

/// Initiate iff there is no link yet and our identity orders above the
/// candidate's.
pub fn should_initiate(
    me: &PeerIdentity,
    has_link: bool,
    candidate: &PeerIdentity,
) -> Result<bool, IdentityCollision> {
    if me == candidate {
        return Err(IdentityCollision(candidate.clone()));
    }
    Ok(!has_link && me > candidate)
}
