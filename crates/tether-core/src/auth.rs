//! Pre-shared-secret authentication for Tether.
//!
//! Provides two things:
//!   1. `AuthParams`: a key derived from the configured secret, used to tag
//!      announcements and to prove possession during the link handshake
//!   2. `ServiceParams`: the service name, its hash, and the auth key,
//!      passed as one opaque bundle to discovery sources
//!
//! Everything is keyed BLAKE3. Tags are compared in constant time through
//! `blake3::Hash` equality. Key material is wiped on drop.

use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::wire::{service_hash, InstanceId, ServiceHash, PROOF_LEN};

/// Domain-separation context for the key derivation.
const KEY_CONTEXT: &str = "tether 2026-01 pre-shared link key";

/// Longest service name accepted. Matches a DNS-SD instance label.
pub const MAX_SERVICE_NAME_LEN: usize = 63;

/// Key derived from the pre-shared secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AuthParams {
    key: [u8; 32],
}

impl AuthParams {
    /// Derive the link key from a secret. An empty secret is allowed and
    /// yields a well-known key, which only separates services, never peers.
    pub fn from_secret(secret: &str) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
        }
    }

    /// Keyed hash over the concatenation of `parts`.
    pub fn tag(&self, parts: &[&[u8]]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        for part in parts {
            hasher.update(&(part.len() as u32).to_be_bytes());
            hasher.update(part);
        }
        *hasher.finalize().as_bytes()
    }

    /// Constant-time check of a tag produced by `tag`.
    pub fn verify(&self, tag: &[u8; 32], parts: &[&[u8]]) -> bool {
        blake3::Hash::from(self.tag(parts)) == blake3::Hash::from(*tag)
    }

    /// Handshake proof for one side of a link.
    ///
    ///   proof = BLAKE3_keyed(role || dialer_nonce || acceptor_nonce || dialer || acceptor)
    pub fn proof(&self, role: Role, transcript: &Transcript<'_>) -> [u8; PROOF_LEN] {
        self.tag(&[
            role.label(),
            transcript.dialer_nonce,
            transcript.acceptor_nonce,
            transcript.dialer,
            transcript.acceptor,
        ])
    }

    pub fn check_proof(
        &self,
        role: Role,
        transcript: &Transcript<'_>,
        proof: &[u8; PROOF_LEN],
    ) -> Result<(), AuthError> {
        let expected = blake3::Hash::from(self.proof(role, transcript));
        if expected == blake3::Hash::from(*proof) {
            Ok(())
        } else {
            Err(AuthError::BadProof(role))
        }
    }
}

impl fmt::Debug for AuthParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthParams(..)")
    }
}

/// Which side of a link a proof speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Acceptor,
}

impl Role {
    fn label(self) -> &'static [u8] {
        match self {
            Role::Dialer => b"dialer",
            Role::Acceptor => b"acceptor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Dialer => f.write_str("dialer"),
            Role::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// Everything both sides of a handshake have seen.
#[derive(Debug, Clone, Copy)]
pub struct Transcript<'a> {
    pub dialer_nonce: &'a [u8],
    pub acceptor_nonce: &'a [u8],
    pub dialer: &'a [u8],
    pub acceptor: &'a [u8],
}

/// Fresh random handshake nonce.
pub fn nonce() -> [u8; 16] {
    let mut n = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut n);
    n
}

/// Fresh random instance id for this process.
pub fn instance_id() -> InstanceId {
    let mut id = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

// ── Service parameters ────────────────────────────────────────────────────────

/// The service name plus its auth key, handed to discovery sources as-is.
#[derive(Clone)]
pub struct ServiceParams {
    name: Arc<str>,
    hash: ServiceHash,
    auth: AuthParams,
}

impl ServiceParams {
    pub fn new(name: &str, secret: &str) -> Result<Self, AuthError> {
        if name.is_empty() || name.len() > MAX_SERVICE_NAME_LEN {
            return Err(AuthError::InvalidServiceName(name.to_string()));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(AuthError::InvalidServiceName(name.to_string()));
        }
        Ok(Self {
            name: Arc::from(name),
            hash: service_hash(name),
            auth: AuthParams::from_secret(secret),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> &ServiceHash {
        &self.hash
    }

    pub fn auth(&self) -> &AuthParams {
        &self.auth
    }
}

impl fmt::Debug for ServiceParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceParams")
            .field("name", &self.name)
            .field("hash", &hex::encode(&self.hash[..4]))
            .finish_non_exhaustive()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid service name {0:?}")]
    InvalidServiceName(String),
    #[error("{0} proof did not verify")]
    BadProof(Role),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> ([u8; 16], [u8; 16]) {
        ([1u8; 16], [2u8; 16])
    }

    #[test]
    fn same_secret_same_key() {
        let a = AuthParams::from_secret("hunter2");
        let b = AuthParams::from_secret("hunter2");
        let tag = a.tag(&[&b"hello"[..]]);
        assert!(b.verify(&tag, &[&b"hello"[..]]));
    }

    #[test]
    fn different_secret_fails_verification() {
        let a = AuthParams::from_secret("hunter2");
        let b = AuthParams::from_secret("hunter3");
        let tag = a.tag(&[&b"hello"[..]]);
        assert!(!b.verify(&tag, &[&b"hello"[..]]));
    }

    #[test]
    fn parts_are_length_delimited() {
        let a = AuthParams::from_secret("s");
        assert_ne!(
            a.tag(&[&b"ab"[..], &b"c"[..]]),
            a.tag(&[&b"a"[..], &b"bc"[..]])
        );
    }

    #[test]
    fn proofs_are_role_bound() {
        let auth = AuthParams::from_secret("s");
        let (dn, an) = transcript();
        let t = Transcript {
            dialer_nonce: &dn,
            acceptor_nonce: &an,
            dialer: b"Tim",
            acceptor: b"Jony",
        };
        let dialer_proof = auth.proof(Role::Dialer, &t);
        assert!(auth.check_proof(Role::Dialer, &t, &dialer_proof).is_ok());
        assert_eq!(
            auth.check_proof(Role::Acceptor, &t, &dialer_proof),
            Err(AuthError::BadProof(Role::Acceptor))
        );
    }

    #[test]
    fn service_name_validation() {
        assert!(ServiceParams::new("flight-log", "").is_ok());
        assert!(ServiceParams::new("", "").is_err());
        assert!(ServiceParams::new("has space", "").is_err());
        assert!(ServiceParams::new(&"a".repeat(64), "").is_err());
    }

    #[test]
    fn debug_never_prints_key() {
        let params = ServiceParams::new("svc", "top-secret").unwrap();
        let shown = format!("{params:?} {:?}", params.auth());
        assert!(!shown.contains("top-secret"));
        assert!(shown.contains("AuthParams(..)") || shown.contains("svc"));
    }
}
