//! JFK ("Just Fast Keying") handshake engine.
//!
//! This crate provides:
//! - Ed25519 node identities and setup keys
//! - Pre-generated Diffie-Hellman and X25519 key-agreement contexts
//! - Session key derivation from the shared secret and both nonces
//! - The authenticator cache that keeps the responder stateless until M3
//! - The four-message state machine and its packet dispatcher
//!
//! # Design
//!
//! ```text
//! Initiator                                   Responder
//!   M1: Ni, g^i, [hash(IDr)]          ->
//!                                     <-      M2: Ni, Nr, g^r, sig(g^r), auth
//!   M3: Ni, Nr, g^i, g^r, auth,
//!       HMAC_Ka(E_Ke(sig, ...))       ->
//!                                     <-      M4: HMAC_Ka(E_Ke(sig, ...))
//! ```
//!
//! Every message travels inside an encrypted envelope keyed by the setup
//! key of the two identities (or of the responder alone for anonymous
//! initiators). The responder keeps no per-exchange state between M1 and
//! M3; the authenticator, keyed by a rotating transient key, binds the
//! exchange instead.
//!
//! The socket, peer table, session objects and timers are supplied by the
//! caller through the traits in [`collaborators`].

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod authenticator;
pub mod collaborators;
pub mod context_pool;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod identity;
mod jfk;
pub mod kdf;
pub mod key_agreement;
mod state;
pub mod throttle;

pub use authenticator::AuthenticatorCache;
pub use collaborators::{
    DatagramTransport, HandshakeCompletion, NodeSigner, PeerRegistry, PeerSession, Scheduler, Task,
};
pub use context_pool::ContextPool;
pub use dispatcher::{Decoded, Handshaker, LocalNode};
pub use error::{DropClass, HandshakeError};
pub use identity::{IdentityKeypair, NodeId};
pub use kdf::{Role, SessionKeys};
pub use key_agreement::{KeyAgreementContext, KeyAgreementKind};
pub use throttle::RekeyThrottle;

/// Lock a mutex, carrying on with the data if a previous holder panicked.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
