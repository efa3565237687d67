//! Tether wire format: the framing carried by every UDP datagram.
//!
//! Every datagram starts with a fixed 16-byte header. The header names the
//! receiver's session index so the receiver can demultiplex without looking
//! at the source address, and a counter that is either the handshake message
//! number or the AEAD nonce of an encrypted message.
//!
//! The header is a `#[repr(C, packed)]` zerocopy struct with big-endian byte
//! arrays for the multi-byte fields. There is no unsafe code in this module.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current wire version. A receiver seeing another version drops the datagram.
pub const VERSION: u8 = 1;

/// Header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Largest datagram the engine will read or produce.
pub const MAX_DATAGRAM: usize = 9001;

/// Handshake message numbers, carried in the header counter.
pub const HANDSHAKE_MSG_INIT: u64 = 1;
pub const HANDSHAKE_MSG_RESPONSE: u64 = 2;

/// Subtypes, interpreted per message type.
pub mod subtype {
    /// The only handshake flavour: Noise IX.
    pub const HANDSHAKE_IX: u8 = 0;
    pub const TEST_REQUEST: u8 = 0;
    pub const TEST_REPLY: u8 = 1;
    pub const NONE: u8 = 0;
}

// ── Message type ──────────────────────────────────────────────────────────────

/// Low nibble of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Noise handshake message. Cleartext header, Noise-protected payload.
    Handshake = 0,
    /// Encrypted IP packet.
    Message = 1,
    /// Encrypted keepalive probe (request or reply, see `subtype`).
    Test = 4,
    /// Encrypted notice that the sender tore the tunnel down.
    CloseTunnel = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Handshake),
            1 => Ok(MessageType::Message),
            4 => Ok(MessageType::Test),
            5 => Ok(MessageType::CloseTunnel),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// On-wire layout of the header.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RawHeader {
    /// High nibble: version. Low nibble: message type.
    pub version_type: u8,
    pub subtype: u8,
    /// Must be zero.
    pub reserved: [u8; 2],
    /// The receiver's local index. Zero on the first handshake message.
    pub remote_index: [u8; 4],
    /// Handshake message number, or AEAD nonce counter.
    pub counter: [u8; 8],
}

assert_eq_size!(RawHeader, [u8; HEADER_LEN]);

/// Decoded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub subtype: u8,
    pub remote_index: u32,
    pub counter: u64,
}

impl Header {
    pub fn new(message_type: MessageType, subtype: u8, remote_index: u32, counter: u64) -> Self {
        Self {
            message_type,
            subtype,
            remote_index,
            counter,
        }
    }

    /// Serialize to the 16 wire bytes.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let raw = RawHeader {
            version_type: (VERSION << 4) | (u8::from(self.message_type) & 0x0f),
            subtype: self.subtype,
            reserved: [0; 2],
            remote_index: self.remote_index.to_be_bytes(),
            counter: self.counter.to_be_bytes(),
        };
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Split a datagram into its header and the remaining payload.
    pub fn parse(datagram: &[u8]) -> Result<(Header, &[u8]), WireError> {
        let raw = RawHeader::read_from_prefix(datagram)
            .ok_or(WireError::TooShort(datagram.len()))?;

        let version = raw.version_type >> 4;
        if version != VERSION {
            return Err(WireError::UnknownVersion(version));
        }
        let message_type = MessageType::try_from(raw.version_type & 0x0f)?;

        let reserved = raw.reserved;
        if reserved != [0; 2] {
            return Err(WireError::ReservedSet);
        }

        let header = Header {
            message_type,
            subtype: raw.subtype,
            remote_index: u32::from_be_bytes(raw.remote_index),
            counter: u64::from_be_bytes(raw.counter),
        };
        Ok((header, &datagram[HEADER_LEN..]))
    }
}

// ── Handshake payload ─────────────────────────────────────────────────────────

/// Carried inside the Noise payload of both handshake messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Sender's certificate, hex encoded. Opaque to the engine.
    pub cert: String,
    /// Index chosen by the initiator.
    pub initiator_index: u32,
    /// Index chosen by the responder. Zero in message 1.
    pub responder_index: u32,
    /// Sender's wall clock, unix nanoseconds. Informational only.
    pub time: u64,
}

impl HandshakePayload {
    pub fn new(cert: &[u8], initiator_index: u32, responder_index: u32, time: u64) -> Self {
        Self {
            cert: hex::encode(cert),
            initiator_index,
            responder_index,
            time,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::BadPayload(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(|e| WireError::BadPayload(e.to_string()))
    }

    pub fn cert_bytes(&self) -> Result<Vec<u8>, WireError> {
        hex::decode(&self.cert).map_err(|e| WireError::BadPayload(e.to_string()))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short for header: {0} bytes")]
    TooShort(usize),

    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("reserved header bytes are non-zero")]
    ReservedSet,

    #[error("malformed handshake payload: {0}")]
    BadPayload(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let header = Header::new(MessageType::Message, subtype::NONE, 0x0102_0304, 7);
        let bytes = header.encode();
        assert_eq!(bytes[0], 0x11, "version 1, type 1");
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(bytes[15], 7);
    }

    #[test]
    fn header_parse_returns_payload() {
        let header = Header::new(MessageType::Test, subtype::TEST_REPLY, 99, 12345);
        let mut datagram = header.encode().to_vec();
        datagram.extend_from_slice(b"body");

        let (parsed, rest) = Header::parse(&datagram).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(rest, b"body");
    }

    #[test]
    fn short_datagram_rejected() {
        assert_eq!(Header::parse(&[0x11; 10]), Err(WireError::TooShort(10)));
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = Header::new(MessageType::Message, 0, 1, 1).encode();
        bytes[0] = 0x21;
        assert_eq!(Header::parse(&bytes), Err(WireError::UnknownVersion(2)));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut bytes = Header::new(MessageType::Message, 0, 1, 1).encode();
        bytes[0] = 0x19;
        assert_eq!(Header::parse(&bytes), Err(WireError::UnknownMessageType(9)));
    }

    #[test]
    fn reserved_bytes_must_be_zero() {
        let mut bytes = Header::new(MessageType::Message, 0, 1, 1).encode();
        bytes[2] = 1;
        assert_eq!(Header::parse(&bytes), Err(WireError::ReservedSet));
    }

    #[test]
    fn handshake_payload_carries_cert_as_hex() {
        let payload = HandshakePayload::new(&[0xde, 0xad], 5, 0, 1);
        let bytes = payload.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("dead"));

        let back = HandshakePayload::from_bytes(&bytes).unwrap();
        assert_eq!(back.cert_bytes().unwrap(), vec![0xde, 0xad]);
        assert_eq!(back.initiator_index, 5);
    }

    #[test]
    fn garbage_payload_is_bad_payload() {
        let err = HandshakePayload::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, WireError::BadPayload(_)));
    }
}
