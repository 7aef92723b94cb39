//! tether-core: shared types, wire format, and authentication primitives.
//! All other Tether crates depend on this one.

pub mod auth;
pub mod config;
pub mod identity;
pub mod wire;

pub use identity::{EndpointId, PeerIdentity};
pub use wire::{Frame, PING};
