//! Contracts for the services the handshake relies on but does not own.
//!
//! The dispatcher talks to the socket, the peer table, the long-lived
//! per-peer session objects, the node's signing key and the timer service
//! only through these traits.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use jfk_core::{NegotiationType, SetupType, HASH_LENGTH, SIGNATURE_SIZE};

use crate::identity::{identity_hash, IDENTITY_LENGTH};
use crate::kdf::{Role, SessionKeys};

/// Non-blocking datagram sender.
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram. Must not block on the network.
    fn send_datagram(&self, data: &[u8], destination: SocketAddr) -> io::Result<()>;

    /// Largest datagram the transport accepts, headers included.
    fn max_packet_size(&self) -> usize;

    /// Bytes the transport adds in front of every datagram.
    fn header_overhead(&self) -> usize;
}

/// The node's long-term signing key.
pub trait NodeSigner: Send + Sync {
    fn identity(&self) -> [u8; IDENTITY_LENGTH];

    fn sign_digest(&self, digest: &[u8; HASH_LENGTH]) -> [u8; SIGNATURE_SIZE];
}

/// Everything a session object needs to install a completed handshake.
#[derive(Debug)]
pub struct HandshakeCompletion {
    pub role: Role,
    pub negotiation_type: NegotiationType,
    pub keys: SessionKeys,
    pub peer_boot_id: u64,
    /// Reference blob the peer sent about itself.
    pub peer_reference: Bytes,
    pub source: SocketAddr,
    /// At the responder: the tracker the initiator offered to reuse.
    /// At the initiator: the tracker the responder chose.
    pub tracker_id: i64,
    pub reused_tracker: bool,
    /// Set for anonymous-initiator exchanges.
    pub setup_type: Option<SetupType>,
    /// Handshake clock at completion. Sessions report it back through
    /// `last_connection_completed`.
    pub completed_at: Instant,
}

/// Long-lived per-peer session object.
pub trait PeerSession: Send + Sync {
    fn identity(&self) -> [u8; IDENTITY_LENGTH];

    fn identity_hash(&self) -> [u8; HASH_LENGTH] {
        identity_hash(&self.identity())
    }

    /// Address to send M1 to, if the peer currently has one.
    fn handshake_address(&self) -> Option<SocketAddr>;

    /// We connect to this peer without revealing our identity up front
    /// (bootstrap/seed connections).
    fn is_anonymous_target(&self) -> bool {
        false
    }

    /// Negotiation types the peer advertised.
    fn negotiation_types(&self) -> Vec<u8>;

    /// Tracker the initiator offers to keep, or -1.
    fn reusable_tracker_id(&self) -> i64 {
        -1
    }

    /// Boot ID we present to this peer.
    fn outgoing_boot_id(&self) -> u64;

    /// Install the negotiated keys. Must be idempotent across concurrent
    /// attempts. Returns the tracker ID in use, or `None` if the session
    /// refused the handshake.
    fn complete_handshake(&self, completion: HandshakeCompletion) -> Option<i64>;

    /// `completed_at` of the last installed handshake.
    fn last_connection_completed(&self) -> Option<Instant>;
}

/// Maps addresses and references to peers.
pub trait PeerRegistry: Send + Sync {
    fn lookup_by_address(&self, address: SocketAddr) -> Option<Arc<dyn PeerSession>>;

    fn all_known_peers(&self) -> Vec<Arc<dyn PeerSession>>;

    /// Identity an anonymous initiator's reference claims. Must not change
    /// the registry; the claim is not yet authenticated.
    fn identity_from_reference(&self, reference: &[u8]) -> Option<[u8; IDENTITY_LENGTH]>;

    /// Find or admit the peer described by an anonymous initiator's
    /// reference. Only called after the initiator's signature verified
    /// against `identity_from_reference`. Returns `None` if the reference
    /// is unusable or the registry is refusing new peers.
    fn peer_from_reference(
        &self,
        reference: &[u8],
        setup_type: SetupType,
        from: SocketAddr,
    ) -> Option<Arc<dyn PeerSession>>;
}

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Deferred work off the packet path.
pub trait Scheduler: Send + Sync {
    /// Run as soon as possible on another thread.
    fn execute(&self, task: Task);

    fn schedule(&self, delay: Duration, task: Task);
}
