//! Peer and endpoint identities.
//!
//! A `PeerIdentity` names a device across re-discoveries and is the input to
//! connection arbitration, so it must be totally ordered and stable for the
//! life of a session. An `EndpointId` names one advertisement instance and is
//! minted by whichever discovery source produced it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Longest identity accepted, in bytes. Fits the one-byte length field of
/// announcements and handshake hellos.
pub const MAX_IDENTITY_LEN: usize = 255;

/// Stable, totally ordered device identity.
///
/// Ordering is lexicographic over the UTF-8 bytes, so `"Tim" > "Jony"`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerIdentity(Arc<str>);

impl PeerIdentity {
    /// Validate and wrap an identity string.
    pub fn new(name: impl AsRef<str>) -> Result<Self, IdentityError> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(IdentityError::Empty);
        }
        if name.len() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong(name.len()));
        }
        if name.chars().any(char::is_control) {
            return Err(IdentityError::ControlCharacter);
        }
        Ok(Self(Arc::from(name)))
    }

    /// Decode an identity received from the wire.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, IdentityError> {
        let name = std::str::from_utf8(bytes).map_err(|_| IdentityError::InvalidUtf8)?;
        Self::new(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({:?})", &*self.0)
    }
}

impl FromStr for PeerIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PeerIdentity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerIdentity> for String {
    fn from(id: PeerIdentity) -> String {
        id.0.to_string()
    }
}

/// Opaque handle for one advertised service instance.
///
/// Equality is by the token the discovery source minted, never by the
/// peer it points at: a re-advertising peer may show up under a new id.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(Arc<str>);

impl EndpointId {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointId({})", &*self.0)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("peer identity is empty")]
    Empty,
    #[error("peer identity is {0} bytes (max {MAX_IDENTITY_LEN})")]
    TooLong(usize),
    #[error("peer identity contains a control character")]
    ControlCharacter,
    #[error("peer identity is not valid UTF-8")]
    InvalidUtf8,
}
