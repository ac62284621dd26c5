//! Outer envelope of every handshake packet.
//!
//! # Packet Format
//!
//! ```text
//! +--------+-------------------+--------------+-------------+-----------+
//! | IV(16) | E[SHA-256(data)]  | E[len u16 BE]| E[data]     | padding   |
//! +--------+-------------------+--------------+-------------+-----------+
//! ```
//!
//! `E` is one AES-256-CTR keystream started at the IV and run across the
//! digest, the length and the data in that order. Padding is random and not
//! encrypted. The digest comparison filters garbage cheaply; the handshake
//! messages inside carry the real authentication.

use aes::Aes256;
use bytes::{BufMut, Bytes, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher};
use jfk_common::constant_time_eq;
use jfk_core::{HASH_LENGTH, IV_LENGTH};
use rand::rngs::OsRng;
use rand::{thread_rng, Rng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::error;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub const ENVELOPE_KEY_LENGTH: usize = 32;

const LENGTH_FIELD_SIZE: usize = 2;

/// Bytes in front of the payload.
pub const ENVELOPE_OVERHEAD: usize = IV_LENGTH + HASH_LENGTH + LENGTH_FIELD_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("packet too short: {0} bytes, minimum {1}")]
    TooShort(usize, usize),

    #[error("payload too long: {0} bytes, maximum {1}")]
    TooLong(usize, usize),

    #[error("declared length {declared} exceeds {available} available bytes")]
    LengthOutOfBounds { declared: usize, available: usize },

    #[error("payload digest mismatch")]
    DigestMismatch,
}

/// Size limits the transport imposes on an envelope.
#[derive(Debug, Clone, Copy)]
pub struct PaddingPolicy {
    pub max_packet_size: usize,
    pub header_overhead: usize,
    pub max_padding: usize,
}

impl PaddingPolicy {
    /// Largest payload that still fits one datagram.
    pub fn max_payload(&self) -> usize {
        self.max_packet_size
            .saturating_sub(self.header_overhead + ENVELOPE_OVERHEAD)
    }

    fn padding_len(&self, pre_padding_len: usize) -> usize {
        let limit = self.max_packet_size.saturating_sub(self.header_overhead);
        if pre_padding_len > limit {
            error!(
                "auth packet of {} bytes exceeds {} byte limit, sending unpadded",
                pre_padding_len, limit
            );
            return 0;
        }
        let bound = self.max_padding.min(limit - pre_padding_len);
        if bound == 0 {
            0
        } else {
            thread_rng().gen_range(0..bound)
        }
    }
}

/// XOR `buf` with the AES-256-CTR keystream for `key`/`iv`.
pub fn stream_xor(key: &[u8; ENVELOPE_KEY_LENGTH], iv: &[u8; IV_LENGTH], buf: &mut [u8]) {
    let mut cipher = Aes256Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(buf);
}

pub fn random_iv() -> [u8; IV_LENGTH] {
    let mut iv = [0u8; IV_LENGTH];
    OsRng.fill_bytes(&mut iv);
    iv
}

pub fn encode(
    key: &[u8; ENVELOPE_KEY_LENGTH],
    payload: &[u8],
    policy: &PaddingPolicy,
) -> Result<Bytes, EnvelopeError> {
    if payload.len() > policy.max_packet_size || payload.len() > u16::MAX as usize {
        return Err(EnvelopeError::TooLong(payload.len(), policy.max_packet_size));
    }

    let iv = random_iv();
    let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());

    let pre_padding_len = ENVELOPE_OVERHEAD + payload.len();
    let padding_len = policy.padding_len(pre_padding_len);
    let mut buf = BytesMut::with_capacity(pre_padding_len + padding_len);
    buf.put_slice(&iv);

    let mut digest: [u8; HASH_LENGTH] = Sha256::digest(payload).into();
    cipher.apply_keystream(&mut digest);
    buf.put_slice(&digest);

    let mut length = (payload.len() as u16).to_be_bytes();
    cipher.apply_keystream(&mut length);
    buf.put_slice(&length);

    let start = buf.len();
    buf.put_slice(payload);
    cipher.apply_keystream(&mut buf[start..]);

    let mut padding = vec![0u8; padding_len];
    thread_rng().fill(&mut padding[..]);
    buf.put_slice(&padding);

    Ok(buf.freeze())
}

/// Open an envelope. `min_payload` is the smallest inner payload that can
/// be valid (the header length).
pub fn decode(
    key: &[u8; ENVELOPE_KEY_LENGTH],
    packet: &[u8],
    min_payload: usize,
) -> Result<Bytes, EnvelopeError> {
    let min_len = ENVELOPE_OVERHEAD + min_payload;
    if packet.len() < min_len {
        return Err(EnvelopeError::TooShort(packet.len(), min_len));
    }

    let mut iv = [0u8; IV_LENGTH];
    iv.copy_from_slice(&packet[..IV_LENGTH]);
    let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());

    let mut digest = [0u8; HASH_LENGTH];
    digest.copy_from_slice(&packet[IV_LENGTH..IV_LENGTH + HASH_LENGTH]);
    cipher.apply_keystream(&mut digest);

    let mut length = [0u8; LENGTH_FIELD_SIZE];
    length.copy_from_slice(&packet[IV_LENGTH + HASH_LENGTH..ENVELOPE_OVERHEAD]);
    cipher.apply_keystream(&mut length);
    let declared = u16::from_be_bytes(length) as usize;

    let available = packet.len() - ENVELOPE_OVERHEAD;
    if declared > available {
        return Err(EnvelopeError::LengthOutOfBounds {
            declared,
            available,
        });
    }

    let mut payload = packet[ENVELOPE_OVERHEAD..ENVELOPE_OVERHEAD + declared].to_vec();
    cipher.apply_keystream(&mut payload);

    let computed: [u8; HASH_LENGTH] = Sha256::digest(&payload).into();
    if !constant_time_eq(&computed, &digest) {
        return Err(EnvelopeError::DigestMismatch);
    }

    Ok(Bytes::from(payload))
}
