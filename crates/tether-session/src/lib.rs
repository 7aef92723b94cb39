//! tether-session: peer session manager.
//!
//! Turns a `DiscoverySource` into one authenticated link per peer pair,
//! keeps those links healthy, and exposes the set of reachable peers plus
//! typed messaging through `Session`.

pub mod arbitration;
mod coordinator;
pub mod driver;
pub mod framer;
pub mod health;
pub mod link;
pub mod memory;
pub mod registry;
pub mod session;
pub mod transport;

pub use link::{LinkState, LinkSummary};
pub use memory::{MemoryDevice, MemoryMedium};
pub use session::{InboundMessage, SendError, Session, SessionError, SessionEvent, SessionEvents};
pub use transport::{
    Candidate, Connected, DiscoveryError, DiscoverySource, InboundLink, PathStatus, PendingLink,
    Subscription, TransportError,
};
