//! Core JFK handshake wire types, framing, and constants.
//!
//! This crate provides:
//! - Negotiation type, phase and setup type tags
//! - The inner auth-packet header
//! - Encoders and decoders for the four handshake message bodies
//!
//! # Inner Payload
//!
//! Every handshake payload, once the outer envelope has been removed,
//! starts with a short header:
//!
//! ```text
//! +---------+---------+---------+-------------------------+
//! | version | negType |  phase  | setupType (anonymous)   |
//! +---------+---------+---------+-------------------------+
//! ```
//!
//! The setup type byte is only present when the packet belongs to an
//! anonymous-initiator exchange. The phase-specific body follows.

#![forbid(unsafe_code)]

pub mod messages;

pub use messages::{Message1, Message2, Message3, Message3Inner, Message4, Message4Inner};

use bytes::BufMut;
use thiserror::Error;

/// Only protocol version understood by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the initiator and responder nonces.
pub const NONCE_SIZE: usize = 8;

/// SHA-256 digest length; also the identity hash length.
pub const HASH_LENGTH: usize = 32;

/// HMAC-SHA256 tag length (authenticators and inner MACs).
pub const MAC_LENGTH: usize = 32;

/// Length of one signature component. Signatures travel as `r ‖ s`.
pub const SIGNATURE_HALF_SIZE: usize = 32;

/// Full signature length.
pub const SIGNATURE_SIZE: usize = 2 * SIGNATURE_HALF_SIZE;

/// Cipher block size; the IV length of both envelope and inner ciphertexts.
pub const IV_LENGTH: usize = 16;

/// Big-endian public value length for the legacy Diffie-Hellman group.
pub const DH_PUBLIC_SIZE: usize = 128;

/// X25519 public key length.
pub const ECDH_PUBLIC_SIZE: usize = 32;

/// Header length for exchanges between known peers.
pub const KNOWN_HEADER_LENGTH: usize = 3;

/// Header length for anonymous-initiator exchanges.
pub const ANON_HEADER_LENGTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("payload too short: {0} bytes, minimum {1}")]
    TooShort(usize, usize),

    #[error("unexpected payload length: {actual} bytes, expected {expected}")]
    BadLength { expected: usize, actual: usize },

    #[error("unsupported version: {0}, expected {PROTOCOL_VERSION}")]
    UnsupportedVersion(u8),

    #[error("retired negotiation type: {0}")]
    RetiredNegotiationType(u8),

    #[error("unknown negotiation type: {0}")]
    UnknownNegotiationType(u8),

    #[error("unknown phase: {0}")]
    UnknownPhase(u8),

    #[error("unknown setup type: {0}")]
    UnknownSetupType(u8),
}

/// Protocol variant negotiated between two peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum NegotiationType {
    /// Legacy Diffie-Hellman, initial message IDs from the derived block.
    Dh = 6,
    /// Legacy Diffie-Hellman, initial message IDs hashed from identities.
    DhHashedIds = 7,
    /// X25519, initial message IDs hashed from identities.
    Ecdh = 8,
}

/// Highest value ever retired; anything at or below is refused.
const LAST_RETIRED_NEGOTIATION_TYPE: u8 = 5;

const SUPPORTED_OPEN: [NegotiationType; 3] = [
    NegotiationType::Dh,
    NegotiationType::DhHashedIds,
    NegotiationType::Ecdh,
];
const SUPPORTED_DARKNET: [NegotiationType; 2] =
    [NegotiationType::DhHashedIds, NegotiationType::Ecdh];

impl NegotiationType {
    /// Types this node offers. Open nodes still speak type 6 for older peers.
    pub fn supported(open: bool) -> &'static [NegotiationType] {
        if open {
            &SUPPORTED_OPEN
        } else {
            &SUPPORTED_DARKNET
        }
    }

    /// Highest type present in both lists.
    pub fn best_common(ours: &[NegotiationType], theirs: &[u8]) -> Option<NegotiationType> {
        ours.iter()
            .copied()
            .filter(|t| theirs.contains(&(*t as u8)))
            .max()
    }

    pub fn uses_ecdh(self) -> bool {
        matches!(self, Self::Ecdh)
    }

    /// Whether initial message IDs are hashed from identities rather than
    /// taken from the derived key block.
    pub fn hashed_message_ids(self) -> bool {
        self >= Self::DhHashedIds
    }

    /// Length of an exponential (public value) for this type.
    pub fn public_key_len(self) -> usize {
        if self.uses_ecdh() {
            ECDH_PUBLIC_SIZE
        } else {
            DH_PUBLIC_SIZE
        }
    }
}

impl TryFrom<u8> for NegotiationType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            6 => Ok(Self::Dh),
            7 => Ok(Self::DhHashedIds),
            8 => Ok(Self::Ecdh),
            v if v <= LAST_RETIRED_NEGOTIATION_TYPE => Err(WireError::RetiredNegotiationType(v)),
            v => Err(WireError::UnknownNegotiationType(v)),
        }
    }
}

/// Handshake message number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Message1 = 0,
    Message2 = 1,
    Message3 = 2,
    Message4 = 3,
}

impl TryFrom<u8> for Phase {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Message1),
            1 => Ok(Self::Message2),
            2 => Ok(Self::Message3),
            3 => Ok(Self::Message4),
            v => Err(WireError::UnknownPhase(v)),
        }
    }
}

/// Purpose of an anonymous-initiator exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SetupType {
    /// Connecting to a well-known bootstrap (seed) node.
    SeedNode = 1,
}

impl TryFrom<u8> for SetupType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::SeedNode),
            v => Err(WireError::UnknownSetupType(v)),
        }
    }
}

/// Inner auth-packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthHeader {
    pub negotiation_type: NegotiationType,
    pub phase: Phase,
    /// Present only for anonymous-initiator exchanges.
    pub setup_type: Option<SetupType>,
}

impl AuthHeader {
    pub fn known(negotiation_type: NegotiationType, phase: Phase) -> Self {
        Self {
            negotiation_type,
            phase,
            setup_type: None,
        }
    }

    pub fn anonymous(negotiation_type: NegotiationType, phase: Phase, setup: SetupType) -> Self {
        Self {
            negotiation_type,
            phase,
            setup_type: Some(setup),
        }
    }

    /// Same exchange, next message.
    pub fn with_phase(self, phase: Phase) -> Self {
        Self { phase, ..self }
    }

    pub fn is_anonymous(&self) -> bool {
        self.setup_type.is_some()
    }

    pub fn encoded_len(&self) -> usize {
        if self.is_anonymous() {
            ANON_HEADER_LENGTH
        } else {
            KNOWN_HEADER_LENGTH
        }
    }

    /// Append the header to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.negotiation_type as u8);
        buf.put_u8(self.phase as u8);
        if let Some(setup) = self.setup_type {
            buf.put_u8(setup as u8);
        }
    }

    /// Decode a header, returning it along with the remaining body.
    ///
    /// `anonymous` selects the four-byte layout; the caller knows which one
    /// applies from the key that opened the envelope.
    pub fn decode(buf: &[u8], anonymous: bool) -> Result<(Self, &[u8]), WireError> {
        let header_len = if anonymous {
            ANON_HEADER_LENGTH
        } else {
            KNOWN_HEADER_LENGTH
        };
        if buf.len() < header_len {
            return Err(WireError::TooShort(buf.len(), header_len));
        }

        if buf[0] != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(buf[0]));
        }
        let negotiation_type = NegotiationType::try_from(buf[1])?;
        let phase = Phase::try_from(buf[2])?;
        let setup_type = if anonymous {
            Some(SetupType::try_from(buf[3])?)
        } else {
            None
        };

        Ok((
            Self {
                negotiation_type,
                phase,
                setup_type,
            },
            &buf[header_len..],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_negotiation_type_rejects_retired_and_unknown() {
        for v in 0..=5u8 {
            assert_eq!(
                NegotiationType::try_from(v),
                Err(WireError::RetiredNegotiationType(v))
            );
        }
        assert_eq!(
            NegotiationType::try_from(9),
            Err(WireError::UnknownNegotiationType(9))
        );
        assert_eq!(NegotiationType::try_from(8), Ok(NegotiationType::Ecdh));
    }

    #[test]
    fn test_negotiation_type_properties() {
        assert!(!NegotiationType::Dh.hashed_message_ids());
        assert!(NegotiationType::DhHashedIds.hashed_message_ids());
        assert!(NegotiationType::Ecdh.hashed_message_ids());
        assert_eq!(NegotiationType::Dh.public_key_len(), DH_PUBLIC_SIZE);
        assert_eq!(NegotiationType::Ecdh.public_key_len(), ECDH_PUBLIC_SIZE);
    }

    #[test]
    fn test_supported_and_best_common() {
        assert_eq!(NegotiationType::supported(true).len(), 3);
        assert!(!NegotiationType::supported(false).contains(&NegotiationType::Dh));

        let ours = NegotiationType::supported(true);
        assert_eq!(
            NegotiationType::best_common(ours, &[6, 7]),
            Some(NegotiationType::DhHashedIds)
        );
        assert_eq!(
            NegotiationType::best_common(ours, &[8, 2]),
            Some(NegotiationType::Ecdh)
        );
        assert_eq!(NegotiationType::best_common(ours, &[1, 2, 3]), None);
    }

    #[test]
    fn test_known_header_layout() {
        let header = AuthHeader::known(NegotiationType::DhHashedIds, Phase::Message3);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(b"body");

        assert_eq!(&buf[..3], &[1, 7, 2]);
        let (decoded, body) = AuthHeader::decode(&buf, false).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body, b"body");
    }

    #[test]
    fn test_anonymous_header_carries_setup_type() {
        let header = AuthHeader::anonymous(NegotiationType::Ecdh, Phase::Message1, SetupType::SeedNode);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(&buf[..], &[1, 8, 0, 1]);
        let (decoded, body) = AuthHeader::decode(&buf, true).unwrap();
        assert_eq!(decoded.setup_type, Some(SetupType::SeedNode));
        assert!(body.is_empty());
    }

    #[test]
    fn test_header_errors() {
        assert_eq!(AuthHeader::decode(&[1, 7], false), Err(WireError::TooShort(2, 3)));
        assert_eq!(
            AuthHeader::decode(&[2, 7, 0], false),
            Err(WireError::UnsupportedVersion(2))
        );
        assert_eq!(
            AuthHeader::decode(&[1, 7, 4], false),
            Err(WireError::UnknownPhase(4))
        );
        assert_eq!(
            AuthHeader::decode(&[1, 7, 0, 9], true),
            Err(WireError::UnknownSetupType(9))
        );
    }
}
