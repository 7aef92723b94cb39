//! Tether wire format: on-wire types for all Tether communication.
//!
//! Three things cross the network:
//!   1. Frames: `[type:u32][length:u32][payload]`, network byte order, the
//!      only unit exchanged on an established link.
//!   2. Announcements: one UDP datagram per interval advertising a device.
//!   3. Handshake hellos and proofs: exchanged once per TCP link before it
//!      is handed to the session layer.
//!
//! Fixed-size headers are #[repr(C, packed)] with zerocopy derives and only
//! byte-array fields, so there is no alignment hazard and no unsafe code.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::identity::{IdentityError, PeerIdentity};

// ── Frames ────────────────────────────────────────────────────────────────────

/// Message type reserved for zero-payload health pings.
/// Never delivered to the application.
pub const PING: u32 = 0;

/// Bytes preceding every payload: message type + payload length.
pub const FRAME_HEADER_LEN: usize = 8;

/// Default cap on a single frame's payload.
pub const DEFAULT_MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// One typed message in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }

    pub fn ping() -> Self {
        Self::new(PING, Bytes::new())
    }

    pub fn is_ping(&self) -> bool {
        self.message_type == PING
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// Encode into one contiguous buffer so it can be written in one call.
    pub fn encode(&self, max_payload: u32) -> Result<Bytes, WireError> {
        check_payload(self.message_type, self.payload.len(), max_payload)?;
        let mut out = BytesMut::with_capacity(self.encoded_len());
        out.put_u32(self.message_type);
        out.put_u32(self.payload.len() as u32);
        out.extend_from_slice(&self.payload);
        Ok(out.freeze())
    }
}

/// The 8-byte prefix of a frame, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: u32,
    pub length: u32,
}

impl FrameHeader {
    /// Decode and validate a header against the payload cap.
    pub fn parse(bytes: [u8; FRAME_HEADER_LEN], max_payload: u32) -> Result<Self, WireError> {
        let mut buf = &bytes[..];
        let header = Self {
            message_type: buf.get_u32(),
            length: buf.get_u32(),
        };
        check_payload(header.message_type, header.length as usize, max_payload)?;
        Ok(header)
    }
}

fn check_payload(message_type: u32, len: usize, max_payload: u32) -> Result<(), WireError> {
    if len > max_payload as usize {
        return Err(WireError::PayloadTooLarge {
            len,
            max: max_payload as usize,
        });
    }
    if message_type == PING && len != 0 {
        return Err(WireError::MalformedPing(len));
    }
    Ok(())
}

// ── Shared constants ──────────────────────────────────────────────────────────

/// Leading bytes of every announcement and hello.
pub const MAGIC: [u8; 4] = *b"TTHR";

/// Announcement and handshake version. Currently 0x01.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// IPv6 link-local multicast address for announcements.
pub const MULTICAST_ADDR: &str = "ff02::1";

/// UDP port on which announcements are sent and received.
pub const ANNOUNCE_PORT: u16 = 9470;

/// Length of a handshake proof (keyed BLAKE3 output).
pub const PROOF_LEN: usize = 32;

/// Service identifier: BLAKE3 hash of the service name.
pub type ServiceHash = [u8; 32];

/// Random per-process token; separates two processes sharing an identity.
pub type InstanceId = [u8; 8];

/// Compute a ServiceHash from a service name.
pub fn service_hash(name: &str) -> ServiceHash {
    *blake3::hash(name.as_bytes()).as_bytes()
}

// ── Announcement ──────────────────────────────────────────────────────────────

/// Fixed prefix of an announcement datagram. The identity bytes follow.
///
/// Wire size: 80 bytes + identity.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AnnouncementHeader {
    pub magic: [u8; 4],
    pub version: u8,
    /// Length of the identity that follows the header.
    pub identity_len: u8,
    /// TCP port accepting links, big-endian.
    pub session_port: [u8; 2],
    pub service_hash: ServiceHash,
    pub instance: InstanceId,
    /// Keyed BLAKE3 over the header (tag zeroed) and the identity.
    pub tag: [u8; 32],
}

assert_eq_size!(AnnouncementHeader, [u8; 80]);

/// A decoded announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub identity: PeerIdentity,
    pub session_port: u16,
    pub service_hash: ServiceHash,
    pub instance: InstanceId,
    pub tag: [u8; 32],
}

impl Announcement {
    fn header(&self, tag: [u8; 32]) -> AnnouncementHeader {
        AnnouncementHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            identity_len: self.identity.as_bytes().len() as u8,
            session_port: self.session_port.to_be_bytes(),
            service_hash: self.service_hash,
            instance: self.instance,
            tag,
        }
    }

    /// Bytes covered by the tag: the encoding with the tag zeroed.
    pub fn tagged_bytes(&self) -> Vec<u8> {
        let mut out = self.header([0u8; 32]).as_bytes().to_vec();
        out.extend_from_slice(self.identity.as_bytes());
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header(self.tag).as_bytes().to_vec();
        out.extend_from_slice(self.identity.as_bytes());
        out
    }

    pub fn parse(datagram: &[u8]) -> Result<Self, WireError> {
        let header = AnnouncementHeader::read_from_prefix(datagram).ok_or(WireError::Truncated {
            expected: std::mem::size_of::<AnnouncementHeader>(),
            got: datagram.len(),
        })?;
        check_preamble(header.magic, header.version)?;
        let rest = &datagram[std::mem::size_of::<AnnouncementHeader>()..];
        let identity_len = header.identity_len as usize;
        if rest.len() != identity_len {
            return Err(WireError::Truncated {
                expected: identity_len,
                got: rest.len(),
            });
        }
        Ok(Self {
            identity: PeerIdentity::from_wire(rest)?,
            session_port: u16::from_be_bytes(header.session_port),
            service_hash: header.service_hash,
            instance: header.instance,
            tag: header.tag,
        })
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Fixed prefix of a handshake hello. The identity bytes follow.
///
/// Wire size: 64 bytes + identity.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HelloHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub identity_len: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 2],
    pub service_hash: ServiceHash,
    pub instance: InstanceId,
    /// Fresh per handshake; both nonces feed the proofs.
    pub nonce: [u8; 16],
}

assert_eq_size!(HelloHeader, [u8; 64]);

pub const HELLO_HEADER_LEN: usize = std::mem::size_of::<HelloHeader>();

impl HelloHeader {
    /// Decode and check the fixed prefix of a hello.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Self::read_from(bytes).ok_or(WireError::Truncated {
            expected: HELLO_HEADER_LEN,
            got: bytes.len(),
        })?;
        check_preamble(header.magic, header.version)?;
        Ok(header)
    }
}

/// A complete handshake hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub identity: PeerIdentity,
    pub service_hash: ServiceHash,
    pub instance: InstanceId,
    pub nonce: [u8; 16],
}

impl Hello {
    pub fn from_parts(header: &HelloHeader, identity: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            identity: PeerIdentity::from_wire(identity)?,
            service_hash: header.service_hash,
            instance: header.instance,
            nonce: header.nonce,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = HelloHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            identity_len: self.identity.as_bytes().len() as u8,
            reserved: [0u8; 2],
            service_hash: self.service_hash,
            instance: self.instance,
            nonce: self.nonce,
        };
        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(self.identity.as_bytes());
        out
    }
}

fn check_preamble(magic: [u8; 4], version: u8) -> Result<(), WireError> {
    if magic != MAGIC {
        return Err(WireError::BadMagic);
    }
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnknownVersion(version));
    }
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("payload length {len} exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("ping frame carries {0} payload bytes")]
    MalformedPing(usize),

    #[error("truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("bad magic")]
    BadMagic,

    #[error("unknown protocol version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message_type: u32, payload: Vec<u8>) {
        let frame = Frame::new(message_type, payload.clone());
        let bytes = frame.encode(DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(bytes.len(), FRAME_HEADER_LEN + payload.len());
        let mut prefix = [0u8; FRAME_HEADER_LEN];
        prefix.copy_from_slice(&bytes[..FRAME_HEADER_LEN]);
        let header = FrameHeader::parse(prefix, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(header.message_type, message_type);
        assert_eq!(header.length as usize, payload.len());
        assert_eq!(&bytes[FRAME_HEADER_LEN..], &payload[..]);
    }

    #[test]
    fn frame_round_trip_empty_single_and_large() {
        round_trip(7, Vec::new());
        round_trip(7, vec![0]);
        round_trip(7, (0..1_000_000u32).map(|i| i as u8).collect());
    }

    #[test]
    fn header_is_big_endian() {
        let bytes = Frame::new(42, &b"hi"[..]).encode(DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0, 42, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn oversized_length_is_rejected_before_payload_arrives() {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[..4].copy_from_slice(&9u32.to_be_bytes());
        header[4..].copy_from_slice(&1025u32.to_be_bytes());
        assert_eq!(
            FrameHeader::parse(header, 1024),
            Err(WireError::PayloadTooLarge { len: 1025, max: 1024 })
        );
        assert!(Frame::new(9, vec![0u8; 1025]).encode(1024).is_err());
    }

    #[test]
    fn ping_with_payload_is_malformed() {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[4..].copy_from_slice(&1u32.to_be_bytes());
        assert_eq!(
            FrameHeader::parse(header, 1024),
            Err(WireError::MalformedPing(1))
        );
    }

    fn sample_announcement() -> Announcement {
        Announcement {
            identity: PeerIdentity::new("Jony").unwrap(),
            session_port: 40123,
            service_hash: service_hash("flightlog"),
            instance: [7u8; 8],
            tag: [0xaa; 32],
        }
    }

    #[test]
    fn announcement_round_trip() {
        let ann = sample_announcement();
        let bytes = ann.to_bytes();
        assert_eq!(bytes.len(), 80 + 4);
        assert_eq!(Announcement::parse(&bytes).unwrap(), ann);
    }

    #[test]
    fn announcement_tagged_bytes_exclude_tag() {
        let mut ann = sample_announcement();
        let before = ann.tagged_bytes();
        ann.tag = [0x55; 32];
        assert_eq!(before, ann.tagged_bytes());
        assert_ne!(ann.to_bytes(), before);
    }

    #[test]
    fn announcement_rejects_garbage() {
        let mut bytes = sample_announcement().to_bytes();
        assert!(matches!(
            Announcement::parse(&bytes[..40]),
            Err(WireError::Truncated { .. })
        ));
        bytes.push(b'!');
        assert!(matches!(
            Announcement::parse(&bytes),
            Err(WireError::Truncated { .. })
        ));
        bytes.pop();
        bytes[0] = b'X';
        assert_eq!(Announcement::parse(&bytes), Err(WireError::BadMagic));
        bytes[0] = b'T';
        bytes[4] = 9;
        assert_eq!(Announcement::parse(&bytes), Err(WireError::UnknownVersion(9)));
    }

    #[test]
    fn hello_round_trip() {
        let hello = Hello {
            identity: PeerIdentity::new("Tim").unwrap(),
            service_hash: service_hash("flightlog"),
            instance: [1, 2, 3, 4, 5, 6, 7, 8],
            nonce: [9u8; 16],
        };
        let bytes = hello.to_bytes();
        let header = HelloHeader::parse(&bytes[..HELLO_HEADER_LEN]).unwrap();
        assert_eq!(header.identity_len, 3);
        let decoded = Hello::from_parts(&header, &bytes[HELLO_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn service_hashes_are_deterministic() {
        assert_eq!(service_hash("a"), service_hash("a"));
        assert_ne!(service_hash("a"), service_hash("b"));
    }
}
