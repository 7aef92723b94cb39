//! Link handshake over a fresh TCP stream.
//!
//! Three messages, dialer first:
//!   1. dialer   → Hello(dialer)
//!   2. acceptor → Hello(acceptor) || proof(acceptor)
//!   3. dialer   → proof(dialer)
//!
//! Each proof is keyed BLAKE3 over both nonces and both identities, so a
//! peer without the pre-shared secret cannot complete either side, and a
//! recorded handshake cannot be replayed against a fresh nonce.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tether_core::auth::{AuthError, AuthParams, Role, Transcript};
use tether_core::wire::{Hello, HelloHeader, WireError, HELLO_HEADER_LEN, PROOF_LEN};
use tether_core::PeerIdentity;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("peer offers a different service")]
    WrongService,

    #[error("expected {expected}, peer introduced itself as {got}")]
    UnexpectedPeer {
        expected: PeerIdentity,
        got: PeerIdentity,
    },

    #[error("handshake i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one hello from the stream.
pub async fn read_hello<S>(stream: &mut S) -> Result<Hello, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HELLO_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let header = HelloHeader::parse(&header)?;
    let mut identity = vec![0u8; header.identity_len as usize];
    stream.read_exact(&mut identity).await?;
    Ok(Hello::from_parts(&header, &identity)?)
}

/// Dialer side. Returns the acceptor's hello once both proofs checked out.
pub async fn dial<S>(
    stream: &mut S,
    ours: &Hello,
    expected: &PeerIdentity,
    auth: &AuthParams,
) -> Result<Hello, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&ours.to_bytes()).await?;
    stream.flush().await?;

    let theirs = read_hello(stream).await?;
    if theirs.service_hash != ours.service_hash {
        return Err(HandshakeError::WrongService);
    }
    if &theirs.identity != expected {
        return Err(HandshakeError::UnexpectedPeer {
            expected: expected.clone(),
            got: theirs.identity,
        });
    }

    let transcript = transcript(ours, &theirs);
    let mut proof = [0u8; PROOF_LEN];
    stream.read_exact(&mut proof).await?;
    auth.check_proof(Role::Acceptor, &transcript, &proof)?;

    stream.write_all(&auth.proof(Role::Dialer, &transcript)).await?;
    stream.flush().await?;
    Ok(theirs)
}

/// Acceptor side, after the dialer's hello has been read.
pub async fn respond<S>(
    stream: &mut S,
    theirs: &Hello,
    ours: &Hello,
    auth: &AuthParams,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if theirs.service_hash != ours.service_hash {
        return Err(HandshakeError::WrongService);
    }
    let transcript = transcript(theirs, ours);

    let mut reply = ours.to_bytes();
    reply.extend_from_slice(&auth.proof(Role::Acceptor, &transcript));
    stream.write_all(&reply).await?;
    stream.flush().await?;

    let mut proof = [0u8; PROOF_LEN];
    stream.read_exact(&mut proof).await?;
    auth.check_proof(Role::Dialer, &transcript, &proof)?;
    Ok(())
}

fn transcript<'a>(dialer: &'a Hello, acceptor: &'a Hello) -> Transcript<'a> {
    Transcript {
        dialer_nonce: &dialer.nonce,
        acceptor_nonce: &acceptor.nonce,
        dialer: dialer.identity.as_bytes(),
        acceptor: acceptor.identity.as_bytes(),
    }
}
