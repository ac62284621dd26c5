//! Handshake message bodies.
//!
//! # Layouts
//!
//! ```text
//! M1: Ni(8) | g^i | [IDr hash(32), anonymous only]
//! M2: Ni(8) | Nr(8) | g^r | sig r(32) | sig s(32) | authenticator(32)
//! M3: Ni(8) | Nr(8) | g^i | g^r | authenticator(32) | hmac(32) | iv(16) | ciphertext
//! M4: hmac(32) | iv(16) | ciphertext
//! ```
//!
//! Exponential lengths depend on the negotiation type. The M3 and M4
//! ciphertexts decrypt to [`Message3Inner`] and [`Message4Inner`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    NegotiationType, WireError, HASH_LENGTH, IV_LENGTH, MAC_LENGTH, NONCE_SIZE, SIGNATURE_SIZE,
};

fn check_exact(body: &[u8], expected: usize) -> Result<(), WireError> {
    if body.len() != expected {
        return Err(WireError::BadLength {
            expected,
            actual: body.len(),
        });
    }
    Ok(())
}

fn check_min(body: &[u8], min: usize) -> Result<(), WireError> {
    if body.len() < min {
        return Err(WireError::TooShort(body.len(), min));
    }
    Ok(())
}

fn take<const N: usize>(buf: &mut &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

/// Message 1: initiator nonce and exponential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message1 {
    pub nonce_i: [u8; NONCE_SIZE],
    pub exponential_i: Bytes,
    /// Identity hash of the intended responder (anonymous initiators only).
    pub responder_identity_hash: Option<[u8; HASH_LENGTH]>,
}

impl Message1 {
    pub fn encoded_len(negotiation_type: NegotiationType, anonymous: bool) -> usize {
        NONCE_SIZE + negotiation_type.public_key_len() + if anonymous { HASH_LENGTH } else { 0 }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.nonce_i);
        buf.put_slice(&self.exponential_i);
        if let Some(hash) = &self.responder_identity_hash {
            buf.put_slice(hash);
        }
    }

    pub fn decode(
        body: &[u8],
        negotiation_type: NegotiationType,
        anonymous: bool,
    ) -> Result<Self, WireError> {
        check_exact(body, Self::encoded_len(negotiation_type, anonymous))?;

        let mut buf = body;
        let nonce_i = take::<NONCE_SIZE>(&mut buf);
        let exponential_i = buf.copy_to_bytes(negotiation_type.public_key_len());
        let responder_identity_hash = anonymous.then(|| take::<HASH_LENGTH>(&mut buf));

        Ok(Self {
            nonce_i,
            exponential_i,
            responder_identity_hash,
        })
    }
}

/// Message 2: responder nonce, signed exponential and authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message2 {
    pub nonce_i: [u8; NONCE_SIZE],
    pub nonce_r: [u8; NONCE_SIZE],
    pub exponential_r: Bytes,
    /// Signature over `SHA-256(g^r ‖ group parameters)`.
    pub signature: [u8; SIGNATURE_SIZE],
    pub authenticator: [u8; MAC_LENGTH],
}

impl Message2 {
    pub fn encoded_len(negotiation_type: NegotiationType) -> usize {
        2 * NONCE_SIZE + negotiation_type.public_key_len() + SIGNATURE_SIZE + MAC_LENGTH
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.nonce_i);
        buf.put_slice(&self.nonce_r);
        buf.put_slice(&self.exponential_r);
        buf.put_slice(&self.signature);
        buf.put_slice(&self.authenticator);
    }

    pub fn decode(body: &[u8], negotiation_type: NegotiationType) -> Result<Self, WireError> {
        check_exact(body, Self::encoded_len(negotiation_type))?;

        let mut buf = body;
        let nonce_i = take::<NONCE_SIZE>(&mut buf);
        let nonce_r = take::<NONCE_SIZE>(&mut buf);
        let exponential_r = buf.copy_to_bytes(negotiation_type.public_key_len());
        let signature = take::<SIGNATURE_SIZE>(&mut buf);
        let authenticator = take::<MAC_LENGTH>(&mut buf);

        Ok(Self {
            nonce_i,
            nonce_r,
            exponential_r,
            signature,
            authenticator,
        })
    }
}

/// Message 3: echoed exchange values plus the initiator's encrypted identity
/// proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message3 {
    pub nonce_i: [u8; NONCE_SIZE],
    pub nonce_r: [u8; NONCE_SIZE],
    pub exponential_i: Bytes,
    pub exponential_r: Bytes,
    pub authenticator: [u8; MAC_LENGTH],
    /// `HMAC(Ka, "I" ‖ iv ‖ ciphertext)`
    pub hmac: [u8; MAC_LENGTH],
    pub iv: [u8; IV_LENGTH],
    pub ciphertext: Bytes,
}

impl Message3 {
    fn fixed_len(negotiation_type: NegotiationType) -> usize {
        2 * NONCE_SIZE + 2 * negotiation_type.public_key_len() + 2 * MAC_LENGTH + IV_LENGTH
    }

    pub fn min_len(negotiation_type: NegotiationType) -> usize {
        Self::fixed_len(negotiation_type) + Message3Inner::MIN_LEN
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.nonce_i);
        buf.put_slice(&self.nonce_r);
        buf.put_slice(&self.exponential_i);
        buf.put_slice(&self.exponential_r);
        buf.put_slice(&self.authenticator);
        buf.put_slice(&self.hmac);
        buf.put_slice(&self.iv);
        buf.put_slice(&self.ciphertext);
    }

    pub fn decode(body: &[u8], negotiation_type: NegotiationType) -> Result<Self, WireError> {
        check_min(body, Self::min_len(negotiation_type))?;

        let key_len = negotiation_type.public_key_len();
        let mut buf = body;
        let nonce_i = take::<NONCE_SIZE>(&mut buf);
        let nonce_r = take::<NONCE_SIZE>(&mut buf);
        let exponential_i = buf.copy_to_bytes(key_len);
        let exponential_r = buf.copy_to_bytes(key_len);
        let authenticator = take::<MAC_LENGTH>(&mut buf);
        let hmac = take::<MAC_LENGTH>(&mut buf);
        let iv = take::<IV_LENGTH>(&mut buf);
        let ciphertext = Bytes::copy_from_slice(buf);

        Ok(Self {
            nonce_i,
            nonce_r,
            exponential_i,
            exponential_r,
            authenticator,
            hmac,
            iv,
            ciphertext,
        })
    }
}

/// Message 4: the responder's encrypted identity proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message4 {
    /// `HMAC(Ka, "R" ‖ iv ‖ ciphertext)`
    pub hmac: [u8; MAC_LENGTH],
    pub iv: [u8; IV_LENGTH],
    pub ciphertext: Bytes,
}

impl Message4 {
    pub const MIN_LEN: usize = MAC_LENGTH + IV_LENGTH + Message4Inner::MIN_LEN;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.hmac);
        buf.put_slice(&self.iv);
        buf.put_slice(&self.ciphertext);
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        check_min(body, Self::MIN_LEN)?;

        let mut buf = body;
        let hmac = take::<MAC_LENGTH>(&mut buf);
        let iv = take::<IV_LENGTH>(&mut buf);
        let ciphertext = Bytes::copy_from_slice(buf);

        Ok(Self {
            hmac,
            iv,
            ciphertext,
        })
    }
}

/// Decrypted M3 payload: `sig(64) | trackerId(8) | bootId(8) | reference`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message3Inner {
    pub signature: [u8; SIGNATURE_SIZE],
    pub tracker_id: i64,
    pub boot_id: u64,
    /// Serialized reference of the initiator.
    pub reference: Bytes,
}

impl Message3Inner {
    pub const MIN_LEN: usize = SIGNATURE_SIZE + 8 + 8;

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::MIN_LEN + self.reference.len());
        buf.put_slice(&self.signature);
        buf.put_i64(self.tracker_id);
        buf.put_u64(self.boot_id);
        buf.put_slice(&self.reference);
        buf.freeze()
    }

    pub fn decode(plaintext: &[u8]) -> Result<Self, WireError> {
        check_min(plaintext, Self::MIN_LEN)?;

        let mut buf = plaintext;
        let signature = take::<SIGNATURE_SIZE>(&mut buf);
        let tracker_id = buf.get_i64();
        let boot_id = buf.get_u64();
        let reference = Bytes::copy_from_slice(buf);

        Ok(Self {
            signature,
            tracker_id,
            boot_id,
            reference,
        })
    }
}

/// Decrypted M4 payload:
/// `sig(64) | trackerId(8) | reused(1) | bootId(8) | reference`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message4Inner {
    pub signature: [u8; SIGNATURE_SIZE],
    pub tracker_id: i64,
    /// The responder kept its previous packet tracker for this session.
    pub reused_tracker: bool,
    pub boot_id: u64,
    pub reference: Bytes,
}

impl Message4Inner {
    pub const MIN_LEN: usize = SIGNATURE_SIZE + 8 + 1 + 8;

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::MIN_LEN + self.reference.len());
        buf.put_slice(&self.signature);
        buf.put_i64(self.tracker_id);
        buf.put_u8(u8::from(self.reused_tracker));
        buf.put_u64(self.boot_id);
        buf.put_slice(&self.reference);
        buf.freeze()
    }

    pub fn decode(plaintext: &[u8]) -> Result<Self, WireError> {
        check_min(plaintext, Self::MIN_LEN)?;

        let mut buf = plaintext;
        let signature = take::<SIGNATURE_SIZE>(&mut buf);
        let tracker_id = buf.get_i64();
        let reused_tracker = buf.get_u8() != 0;
        let boot_id = buf.get_u64();
        let reference = Bytes::copy_from_slice(buf);

        Ok(Self {
            signature,
            tracker_id,
            reused_tracker,
            boot_id,
            reference,
        })
    }
}
