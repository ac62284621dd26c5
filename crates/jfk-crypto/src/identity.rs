//! Ed25519 node identity, identity hashes and envelope setup keys.
//!
//! A node's **identity** is its 32-byte Ed25519 public key. The
//! **identity hash** is `SHA-256(identity)`; it names the node on the wire
//! (the anonymous M1 hint) and seeds the keys of the outer envelope.
//!
//! # Example
//!
//! ```
//! use jfk_crypto::identity::{identity_hash, verify_digest, IdentityKeypair};
//! use jfk_crypto::NodeSigner;
//!
//! let keypair = IdentityKeypair::generate();
//! let digest = identity_hash(b"some transcript");
//! let signature = keypair.sign_digest(&digest);
//!
//! assert!(verify_digest(&keypair.identity(), &signature, &digest));
//! ```

use std::fmt;
use std::fs;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use jfk_core::{HASH_LENGTH, SIGNATURE_SIZE};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::collaborators::NodeSigner;

/// Length of a node identity (Ed25519 public key).
pub const IDENTITY_LENGTH: usize = 32;

/// Printable node identifier: base64url-encoded identity (43 characters).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn from_bytes(bytes: &[u8; IDENTITY_LENGTH]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parse a node ID from its string representation.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s.trim())
            .context("invalid base64url encoding")?;

        if bytes.len() != IDENTITY_LENGTH {
            anyhow::bail!(
                "invalid node ID length: expected {} bytes, got {}",
                IDENTITY_LENGTH,
                bytes.len()
            );
        }

        Ok(Self(s.trim().to_string()))
    }

    pub fn to_bytes(&self) -> Result<[u8; IDENTITY_LENGTH]> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.0)
            .context("invalid base64url encoding")?;

        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid identity length"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// `SHA-256(data)`.
pub fn identity_hash(data: &[u8]) -> [u8; HASH_LENGTH] {
    Sha256::digest(data).into()
}

/// Envelope key for two known peers: XOR of both identity hashes, so both
/// sides compute the same key.
pub fn setup_key(ours: &[u8; HASH_LENGTH], theirs: &[u8; HASH_LENGTH]) -> [u8; HASH_LENGTH] {
    let mut key = [0u8; HASH_LENGTH];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = ours[i] ^ theirs[i];
    }
    key
}

/// Envelope key for anonymous-initiator exchanges with `responder`.
pub fn anonymous_setup_key(responder_identity_hash: &[u8; HASH_LENGTH]) -> [u8; HASH_LENGTH] {
    identity_hash(responder_identity_hash)
}

/// Verify an Ed25519 signature over a 32-byte digest.
pub fn verify_digest(
    identity: &[u8; IDENTITY_LENGTH],
    signature: &[u8; SIGNATURE_SIZE],
    digest: &[u8; HASH_LENGTH],
) -> bool {
    let key = match VerifyingKey::from_bytes(identity) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let sig = Signature::from_bytes(signature);
    key.verify(digest, &sig).is_ok()
}

/// Ed25519 identity keypair. The signing key is zeroized on drop.
pub struct IdentityKeypair {
    signing_key: SigningKey,
}

impl IdentityKeypair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_bytes(self.signing_key.verifying_key().as_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Get the private key bytes.
    ///
    /// # Security
    /// Handle with care! These bytes can recreate the identity.
    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Save the private key, restricted to the owner on Unix.
    pub fn save(&self, private_path: &str) -> Result<()> {
        let mut private_bytes = self.private_key_bytes();
        let written = fs::write(private_path, private_bytes);
        private_bytes.zeroize();
        written?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(private_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(private_path, perms)?;
        }

        Ok(())
    }

    /// Load keypair from private key file.
    pub fn load(private_path: &str) -> Result<Self> {
        let mut bytes = fs::read(private_path).context("failed to read private key")?;

        if bytes.len() != 32 {
            bytes.zeroize();
            anyhow::bail!("invalid private key length: expected 32 bytes");
        }

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&bytes);
        bytes.zeroize();

        let keypair = Self::from_bytes(&key_bytes);
        key_bytes.zeroize();

        Ok(keypair)
    }

    /// Load the keypair at `path`, creating and saving a new one if the
    /// file does not exist yet.
    pub fn load_or_generate(path: &str) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            return Self::load(path);
        }
        let keypair = Self::generate();
        keypair.save(path)?;
        Ok(keypair)
    }
}

impl NodeSigner for IdentityKeypair {
    fn identity(&self) -> [u8; IDENTITY_LENGTH] {
        *self.signing_key.verifying_key().as_bytes()
    }

    fn sign_digest(&self, digest: &[u8; HASH_LENGTH]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(digest).to_bytes()
    }
}
