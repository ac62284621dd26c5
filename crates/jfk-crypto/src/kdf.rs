//! Session key derivation.
//!
//! Every sub-key is `HMAC-SHA256(key = shared_secret, Ni ‖ Nr ‖ label)` with
//! a one-character ASCII label:
//!
//! | Label | Use |
//! |-------|-----|
//! | `0` | initiator's outgoing key |
//! | `1` | Ke, encrypts the M3/M4 inner payloads |
//! | `2` | Ka, authenticates the M3/M4 inner payloads |
//! | `3` | transport framing MAC key |
//! | `4` | IV derivation key |
//! | `5` | IV nonce seed |
//! | `6` | initial sequence numbers and legacy message IDs |
//! | `7` | responder's outgoing key |

use hmac::{Hmac, Mac};
use jfk_core::NONCE_SIZE;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

pub const KEY_LENGTH: usize = 32;

const INITIATOR_KEY_LABEL: u8 = b'0';
const ENCRYPTION_KEY_LABEL: u8 = b'1';
const MAC_KEY_LABEL: u8 = b'2';
const FRAMING_HMAC_KEY_LABEL: u8 = b'3';
const IV_KEY_LABEL: u8 = b'4';
const IV_NONCE_LABEL: u8 = b'5';
const COUNTERS_LABEL: u8 = b'6';
const RESPONDER_KEY_LABEL: u8 = b'7';

const KNOWN_MESSAGE_ID_SUFFIX: &[u8] = b"INITIAL1";
const ANONYMOUS_MESSAGE_ID_SUFFIX: &[u8] = b"INITIAL0";

/// HMAC-SHA256 over the concatenation of `parts`.
pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; KEY_LENGTH] {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(m) => m,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// One labelled sub-key.
pub fn compute_jfk_key(
    shared_secret: &[u8],
    nonce_i: &[u8; NONCE_SIZE],
    nonce_r: &[u8; NONCE_SIZE],
    label: u8,
) -> [u8; KEY_LENGTH] {
    hmac_sha256(shared_secret, &[&nonce_i[..], &nonce_r[..], &[label][..]])
}

/// Which side of the exchange we played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// The eight sub-keys of one exchange.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedSessionMaterial {
    pub initiator_key: [u8; KEY_LENGTH],
    pub responder_key: [u8; KEY_LENGTH],
    pub encryption_key: [u8; KEY_LENGTH],
    pub mac_key: [u8; KEY_LENGTH],
    pub framing_hmac_key: [u8; KEY_LENGTH],
    pub iv_key: [u8; KEY_LENGTH],
    pub iv_nonce: [u8; KEY_LENGTH],
    pub counters: [u8; KEY_LENGTH],
}

impl DerivedSessionMaterial {
    pub fn derive(shared_secret: &[u8], nonce_i: &[u8; NONCE_SIZE], nonce_r: &[u8; NONCE_SIZE]) -> Self {
        let key = |label| compute_jfk_key(shared_secret, nonce_i, nonce_r, label);
        Self {
            initiator_key: key(INITIATOR_KEY_LABEL),
            responder_key: key(RESPONDER_KEY_LABEL),
            encryption_key: key(ENCRYPTION_KEY_LABEL),
            mac_key: key(MAC_KEY_LABEL),
            framing_hmac_key: key(FRAMING_HMAC_KEY_LABEL),
            iv_key: key(IV_KEY_LABEL),
            iv_nonce: key(IV_NONCE_LABEL),
            counters: key(COUNTERS_LABEL),
        }
    }

    fn counter(&self, offset: usize) -> u32 {
        u32::from_be_bytes([
            self.counters[offset],
            self.counters[offset + 1],
            self.counters[offset + 2],
            self.counters[offset + 3],
        ])
    }

    /// (initiator, responder) initial sequence numbers.
    pub fn initial_sequence_numbers(&self) -> (u32, u32) {
        (self.counter(0), self.counter(4))
    }

    /// (initiator, responder) initial message IDs for negotiation type 6.
    pub fn legacy_message_ids(&self) -> (u32, u32) {
        (self.counter(8), self.counter(12))
    }
}

fn first_word(digest: &[u8]) -> u32 {
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Initial message ID used by `from` when talking to `to`.
pub fn hashed_message_id(from: &[u8], to: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(from);
    hasher.update(to);
    hasher.update(KNOWN_MESSAGE_ID_SUFFIX);
    first_word(&hasher.finalize())
}

/// Initial message ID for both directions of an anonymous-initiator session.
pub fn anonymous_message_id(responder_identity: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(responder_identity);
    hasher.update(ANONYMOUS_MESSAGE_ID_SUFFIX);
    first_word(&hasher.finalize())
}

/// Where initial message IDs come from.
#[derive(Debug, Clone, Copy)]
pub enum MessageIdScheme<'a> {
    /// Bytes 8..16 of the counters block.
    Derived,
    /// Hashed from both identities.
    Hashed { ours: &'a [u8], theirs: &'a [u8] },
    /// Hashed from the responder's identity only.
    Anonymous { responder: &'a [u8] },
}

/// Keys and counters from one side's point of view.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub outgoing_key: [u8; KEY_LENGTH],
    pub incoming_key: [u8; KEY_LENGTH],
    pub framing_hmac_key: [u8; KEY_LENGTH],
    pub iv_key: [u8; KEY_LENGTH],
    pub iv_nonce: [u8; KEY_LENGTH],
    pub our_initial_seq: u32,
    pub their_initial_seq: u32,
    pub our_initial_message_id: u32,
    pub their_initial_message_id: u32,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("our_initial_seq", &self.our_initial_seq)
            .field("their_initial_seq", &self.their_initial_seq)
            .field("our_initial_message_id", &self.our_initial_message_id)
            .field("their_initial_message_id", &self.their_initial_message_id)
            .finish_non_exhaustive()
    }
}

impl SessionKeys {
    pub fn for_role(material: &DerivedSessionMaterial, role: Role, scheme: MessageIdScheme<'_>) -> Self {
        let (initiator_seq, responder_seq) = material.initial_sequence_numbers();
        let (initiator_key, responder_key) = (material.initiator_key, material.responder_key);

        let (outgoing_key, incoming_key, our_initial_seq, their_initial_seq) = match role {
            Role::Initiator => (initiator_key, responder_key, initiator_seq, responder_seq),
            Role::Responder => (responder_key, initiator_key, responder_seq, initiator_seq),
        };

        let (our_initial_message_id, their_initial_message_id) = match scheme {
            MessageIdScheme::Derived => {
                let (initiator_id, responder_id) = material.legacy_message_ids();
                if role.is_initiator() {
                    (initiator_id, responder_id)
                } else {
                    (responder_id, initiator_id)
                }
            }
            MessageIdScheme::Hashed { ours, theirs } => {
                (hashed_message_id(ours, theirs), hashed_message_id(theirs, ours))
            }
            MessageIdScheme::Anonymous { responder } => {
                let id = anonymous_message_id(responder);
                (id, id)
            }
        };

        Self {
            outgoing_key,
            incoming_key,
            framing_hmac_key: material.framing_hmac_key,
            iv_key: material.iv_key,
            iv_nonce: material.iv_nonce,
            our_initial_seq,
            their_initial_seq,
            our_initial_message_id,
            their_initial_message_id,
        }
    }
}
