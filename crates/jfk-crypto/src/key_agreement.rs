//! Ephemeral key-agreement contexts.
//!
//! Two algorithms are supported:
//! - Legacy Diffie-Hellman over the 1024-bit MODP group of RFC 2409 §6.2
//!   (generator 2, 256-bit private exponents, 128-byte public values).
//! - X25519 for negotiation type 8.
//!
//! Each context is signed once when generated: the signature covers
//! `SHA-256(public_value ‖ group_parameters)` and travels in M2 unchanged.

use std::time::Instant;

use bytes::Bytes;
use jfk_core::{NegotiationType, DH_PUBLIC_SIZE, ECDH_PUBLIC_SIZE, HASH_LENGTH, SIGNATURE_SIZE};
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::collaborators::NodeSigner;
use crate::error::HandshakeError;
use crate::identity::{verify_digest, IDENTITY_LENGTH};

/// RFC 2409 Oakley group 2 prime, big-endian.
pub const DH_GROUP_PRIME: [u8; DH_PUBLIC_SIZE] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
    0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe6, 0x53, 0x81,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

pub const DH_GENERATOR: u32 = 2;

/// Private exponent size in bytes.
const DH_EXPONENT_SIZE: usize = 32;

/// Group parameters signed alongside X25519 public keys.
pub const ECDH_GROUP_PARAMS: &[u8] = b"X25519";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAgreementKind {
    Dh,
    Ecdh,
}

impl KeyAgreementKind {
    pub fn for_negotiation(negotiation_type: NegotiationType) -> Self {
        if negotiation_type.uses_ecdh() {
            Self::Ecdh
        } else {
            Self::Dh
        }
    }

    pub fn group_params(self) -> &'static [u8] {
        match self {
            Self::Dh => &DH_GROUP_PRIME,
            Self::Ecdh => ECDH_GROUP_PARAMS,
        }
    }

    pub fn public_key_len(self) -> usize {
        match self {
            Self::Dh => DH_PUBLIC_SIZE,
            Self::Ecdh => ECDH_PUBLIC_SIZE,
        }
    }
}

/// Digest that context signatures cover.
pub fn context_digest(kind: KeyAgreementKind, public_value: &[u8]) -> [u8; HASH_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(public_value);
    hasher.update(kind.group_params());
    hasher.finalize().into()
}

/// Check a peer's signature over its exponential.
pub fn verify_context_signature(
    kind: KeyAgreementKind,
    identity: &[u8; IDENTITY_LENGTH],
    public_value: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> bool {
    verify_digest(identity, signature, &context_digest(kind, public_value))
}

fn dh_prime() -> BigUint {
    BigUint::from_bytes_be(&DH_GROUP_PRIME)
}

fn to_fixed_be(value: &BigUint) -> Zeroizing<Vec<u8>> {
    let raw = Zeroizing::new(value.to_bytes_be());
    let mut out = Zeroizing::new(vec![0u8; DH_PUBLIC_SIZE]);
    let start = DH_PUBLIC_SIZE.saturating_sub(raw.len());
    out[start..].copy_from_slice(&raw[raw.len().saturating_sub(DH_PUBLIC_SIZE)..]);
    out
}

/// `1 < y < p - 1`. Values outside this range force the shared secret into
/// a tiny subgroup.
pub fn dh_public_value_is_valid(public_value: &[u8]) -> bool {
    if public_value.len() != DH_PUBLIC_SIZE {
        return false;
    }
    let y = BigUint::from_bytes_be(public_value);
    let one = BigUint::from(1u32);
    let p_minus_one = dh_prime() - &one;
    y > one && y < p_minus_one
}

pub struct DhContext {
    exponent: Zeroizing<Vec<u8>>,
    public_value: Bytes,
    signature: [u8; SIGNATURE_SIZE],
    created_at: Instant,
}

impl DhContext {
    fn generate(signer: &dyn NodeSigner, now: Instant) -> Self {
        let prime = dh_prime();
        let generator = BigUint::from(DH_GENERATOR);
        loop {
            let mut exponent = Zeroizing::new(vec![0u8; DH_EXPONENT_SIZE]);
            OsRng.fill_bytes(&mut exponent);
            let x = BigUint::from_bytes_be(&exponent);
            let y = generator.modpow(&x, &prime);
            let public_value = to_fixed_be(&y);
            if !dh_public_value_is_valid(&public_value) {
                continue;
            }
            let signature =
                signer.sign_digest(&context_digest(KeyAgreementKind::Dh, &public_value));
            return Self {
                exponent,
                public_value: Bytes::copy_from_slice(&public_value),
                signature,
                created_at: now,
            };
        }
    }

    /// `SHA-256` of the 128-byte big-endian `g^xy mod p`.
    fn shared_secret(&self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, HandshakeError> {
        if !dh_public_value_is_valid(peer_public) {
            return Err(HandshakeError::InvalidExponential);
        }
        let y = BigUint::from_bytes_be(peer_public);
        let x = BigUint::from_bytes_be(&self.exponent);
        let z = to_fixed_be(&y.modpow(&x, &dh_prime()));
        Ok(Zeroizing::new(Sha256::digest(&z[..]).into()))
    }
}

pub struct EcdhContext {
    secret: StaticSecret,
    public_value: Bytes,
    signature: [u8; SIGNATURE_SIZE],
    created_at: Instant,
}

impl EcdhContext {
    fn generate(signer: &dyn NodeSigner, now: Instant) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let signature = signer.sign_digest(&context_digest(KeyAgreementKind::Ecdh, public.as_bytes()));
        Self {
            secret,
            public_value: Bytes::copy_from_slice(public.as_bytes()),
            signature,
            created_at: now,
        }
    }

    fn shared_secret(&self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, HandshakeError> {
        let bytes: [u8; ECDH_PUBLIC_SIZE] = peer_public
            .try_into()
            .map_err(|_| HandshakeError::InvalidExponential)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        // Low-order points yield an all-zero secret.
        if !shared.was_contributory() {
            return Err(HandshakeError::InvalidExponential);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

/// An ephemeral key pair plus its one-time signature.
pub enum KeyAgreementContext {
    Dh(DhContext),
    Ecdh(EcdhContext),
}

impl KeyAgreementContext {
    pub fn generate(kind: KeyAgreementKind, signer: &dyn NodeSigner, now: Instant) -> Self {
        match kind {
            KeyAgreementKind::Dh => Self::Dh(DhContext::generate(signer, now)),
            KeyAgreementKind::Ecdh => Self::Ecdh(EcdhContext::generate(signer, now)),
        }
    }

    pub fn kind(&self) -> KeyAgreementKind {
        match self {
            Self::Dh(_) => KeyAgreementKind::Dh,
            Self::Ecdh(_) => KeyAgreementKind::Ecdh,
        }
    }

    pub fn public_key_bytes(&self) -> &Bytes {
        match self {
            Self::Dh(ctx) => &ctx.public_value,
            Self::Ecdh(ctx) => &ctx.public_value,
        }
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_SIZE] {
        match self {
            Self::Dh(ctx) => &ctx.signature,
            Self::Ecdh(ctx) => &ctx.signature,
        }
    }

    pub fn created_at(&self) -> Instant {
        match self {
            Self::Dh(ctx) => ctx.created_at,
            Self::Ecdh(ctx) => ctx.created_at,
        }
    }

    pub fn derive_shared_secret(&self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, HandshakeError> {
        match self {
            Self::Dh(ctx) => ctx.shared_secret(peer_public),
            Self::Ecdh(ctx) => ctx.shared_secret(peer_public),
        }
    }
}

impl std::fmt::Debug for KeyAgreementContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyAgreementContext")
            .field("kind", &self.kind())
            .field("public", &hex::encode(&self.public_key_bytes()[..8]))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeypair;

    #[test]
    fn test_dh_agreement() {
        let signer = IdentityKeypair::generate();
        let now = Instant::now();
        let a = KeyAgreementContext::generate(KeyAgreementKind::Dh, &signer, now);
        let b = KeyAgreementContext::generate(KeyAgreementKind::Dh, &signer, now);

        assert_eq!(a.public_key_bytes().len(), DH_PUBLIC_SIZE);
        let ab = a.derive_shared_secret(b.public_key_bytes()).unwrap();
        let ba = b.derive_shared_secret(a.public_key_bytes()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn test_ecdh_agreement() {
        let signer = IdentityKeypair::generate();
        let now = Instant::now();
        let a = KeyAgreementContext::generate(KeyAgreementKind::Ecdh, &signer, now);
        let b = KeyAgreementContext::generate(KeyAgreementKind::Ecdh, &signer, now);

        assert_eq!(a.public_key_bytes().len(), ECDH_PUBLIC_SIZE);
        let ab = a.derive_shared_secret(b.public_key_bytes()).unwrap();
        let ba = b.derive_shared_secret(a.public_key_bytes()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn test_context_signature_covers_group() {
        let signer = IdentityKeypair::generate();
        let ctx = KeyAgreementContext::generate(KeyAgreementKind::Ecdh, &signer, Instant::now());
        let identity = signer.identity();

        assert!(verify_context_signature(
            KeyAgreementKind::Ecdh,
            &identity,
            ctx.public_key_bytes(),
            ctx.signature()
        ));
        assert!(!verify_context_signature(
            KeyAgreementKind::Dh,
            &identity,
            ctx.public_key_bytes(),
            ctx.signature()
        ));
    }

    #[test]
    fn test_dh_range_check() {
        let mut one = [0u8; DH_PUBLIC_SIZE];
        one[DH_PUBLIC_SIZE - 1] = 1;
        assert!(!dh_public_value_is_valid(&one));
        assert!(!dh_public_value_is_valid(&[0u8; DH_PUBLIC_SIZE]));
        assert!(!dh_public_value_is_valid(&DH_GROUP_PRIME));

        let mut p_minus_one = DH_GROUP_PRIME;
        p_minus_one[DH_PUBLIC_SIZE - 1] -= 1;
        assert!(!dh_public_value_is_valid(&p_minus_one));

        let mut two = [0u8; DH_PUBLIC_SIZE];
        two[DH_PUBLIC_SIZE - 1] = 2;
        assert!(dh_public_value_is_valid(&two));
        assert!(!dh_public_value_is_valid(&two[1..]));
    }

    #[test]
    fn test_ecdh_rejects_low_order_point() {
        let signer = IdentityKeypair::generate();
        let ctx = KeyAgreementContext::generate(KeyAgreementKind::Ecdh, &signer, Instant::now());
        assert!(matches!(
            ctx.derive_shared_secret(&[0u8; ECDH_PUBLIC_SIZE]),
            Err(HandshakeError::InvalidExponential)
        ));
        assert!(matches!(
            ctx.derive_shared_secret(&[1u8; 5]),
            Err(HandshakeError::InvalidExponential)
        ));
    }
}
