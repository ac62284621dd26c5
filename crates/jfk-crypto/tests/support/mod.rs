//! In-memory collaborators for driving two or more handshakers by hand.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use jfk_common::HandshakeConfig;
use jfk_core::{SetupType, HASH_LENGTH, SIGNATURE_SIZE};
use jfk_crypto::collaborators::Task;
use jfk_crypto::identity::IDENTITY_LENGTH;
use jfk_crypto::{
    DatagramTransport, Decoded, HandshakeCompletion, Handshaker, IdentityKeypair, LocalNode,
    NodeSigner, PeerRegistry, PeerSession, Scheduler,
};

pub const MAX_PACKET_SIZE: usize = 1280;
pub const HEADER_OVERHEAD: usize = 28;

/// Records every datagram instead of sending it.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl MemoryTransport {
    pub fn take(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().unwrap().is_empty()
    }
}

impl DatagramTransport for MemoryTransport {
    fn send_datagram(&self, data: &[u8], destination: SocketAddr) -> io::Result<()> {
        self.sent.lock().unwrap().push((data.to_vec(), destination));
        Ok(())
    }

    fn max_packet_size(&self) -> usize {
        MAX_PACKET_SIZE
    }

    fn header_overhead(&self) -> usize {
        HEADER_OVERHEAD
    }
}

/// Holds tasks until the test runs them.
#[derive(Default)]
pub struct ManualScheduler {
    immediate: Mutex<Vec<Task>>,
    delayed: Mutex<Vec<(Duration, Task)>>,
}

impl ManualScheduler {
    pub fn run_immediate(&self) -> usize {
        let tasks: Vec<Task> = self.immediate.lock().unwrap().drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }

    /// Remove and return the delayed tasks scheduled with exactly `delay`.
    pub fn take_delayed(&self, delay: Duration) -> Vec<Task> {
        let mut delayed = self.delayed.lock().unwrap();
        let (matching, rest): (Vec<_>, Vec<_>) = delayed.drain(..).partition(|(d, _)| *d == delay);
        *delayed = rest;
        matching.into_iter().map(|(_, task)| task).collect()
    }
}

impl Scheduler for ManualScheduler {
    fn execute(&self, task: Task) {
        self.immediate.lock().unwrap().push(task);
    }

    fn schedule(&self, delay: Duration, task: Task) {
        self.delayed.lock().unwrap().push((delay, task));
    }
}

/// Signs with `inner` until `corrupt` is set, then flips a signature bit.
pub struct FaultySigner {
    pub inner: Arc<IdentityKeypair>,
    pub corrupt: AtomicBool,
}

impl FaultySigner {
    pub fn new(inner: Arc<IdentityKeypair>) -> Self {
        Self {
            inner,
            corrupt: AtomicBool::new(false),
        }
    }
}

impl NodeSigner for FaultySigner {
    fn identity(&self) -> [u8; IDENTITY_LENGTH] {
        self.inner.identity()
    }

    fn sign_digest(&self, digest: &[u8; HASH_LENGTH]) -> [u8; SIGNATURE_SIZE] {
        let mut signature = self.inner.sign_digest(digest);
        if self.corrupt.load(Ordering::SeqCst) {
            signature[SIGNATURE_SIZE - 1] ^= 0x01;
        }
        signature
    }
}

/// One node's view of a remote peer.
pub struct TestPeer {
    identity: [u8; IDENTITY_LENGTH],
    address: SocketAddr,
    negotiation_types: Vec<u8>,
    anonymous_target: bool,
    offered_tracker: i64,
    /// Tracker this side assigns when it completes as responder.
    assigned_tracker: i64,
    pub completions: Mutex<Vec<HandshakeCompletion>>,
    last_completed: Mutex<Option<Instant>>,
}

impl TestPeer {
    pub fn new(identity: [u8; IDENTITY_LENGTH], address: SocketAddr, negotiation_types: &[u8]) -> Self {
        Self {
            identity,
            address,
            negotiation_types: negotiation_types.to_vec(),
            anonymous_target: false,
            offered_tracker: -1,
            assigned_tracker: 7,
            completions: Mutex::new(Vec::new()),
            last_completed: Mutex::new(None),
        }
    }

    pub fn anonymous_target(mut self) -> Self {
        self.anonymous_target = true;
        self
    }

    pub fn offering_tracker(mut self, tracker: i64) -> Self {
        self.offered_tracker = tracker;
        self
    }

    pub fn assigning_tracker(mut self, tracker: i64) -> Self {
        self.assigned_tracker = tracker;
        self
    }

    pub fn completion_count(&self) -> usize {
        self.completions.lock().unwrap().len()
    }
}

impl PeerSession for TestPeer {
    fn identity(&self) -> [u8; IDENTITY_LENGTH] {
        self.identity
    }

    fn handshake_address(&self) -> Option<SocketAddr> {
        Some(self.address)
    }

    fn is_anonymous_target(&self) -> bool {
        self.anonymous_target
    }

    fn negotiation_types(&self) -> Vec<u8> {
        self.negotiation_types.clone()
    }

    fn reusable_tracker_id(&self) -> i64 {
        self.offered_tracker
    }

    fn outgoing_boot_id(&self) -> u64 {
        0xB007
    }

    fn complete_handshake(&self, completion: HandshakeCompletion) -> Option<i64> {
        let tracker = match completion.role {
            jfk_crypto::Role::Responder => self.assigned_tracker,
            jfk_crypto::Role::Initiator => completion.tracker_id,
        };
        *self.last_completed.lock().unwrap() = Some(completion.completed_at);
        self.completions.lock().unwrap().push(completion);
        Some(tracker)
    }

    fn last_connection_completed(&self) -> Option<Instant> {
        *self.last_completed.lock().unwrap()
    }
}

/// Fixed peer list plus peers created from anonymous references.
pub struct TestRegistry {
    peers: Vec<Arc<TestPeer>>,
    pub created: Mutex<Vec<Arc<TestPeer>>>,
}

impl TestRegistry {
    pub fn new(peers: Vec<Arc<TestPeer>>) -> Self {
        Self {
            peers,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn first_peer(&self) -> Arc<dyn PeerSession> {
        self.peers[0].clone()
    }
}

impl PeerRegistry for TestRegistry {
    fn lookup_by_address(&self, address: SocketAddr) -> Option<Arc<dyn PeerSession>> {
        self.peers
            .iter()
            .find(|p| p.address == address)
            .map(|p| Arc::clone(p) as Arc<dyn PeerSession>)
    }

    fn all_known_peers(&self) -> Vec<Arc<dyn PeerSession>> {
        self.peers
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn PeerSession>)
            .collect()
    }

    fn identity_from_reference(&self, reference: &[u8]) -> Option<[u8; IDENTITY_LENGTH]> {
        reference.try_into().ok()
    }

    fn peer_from_reference(
        &self,
        reference: &[u8],
        _setup_type: SetupType,
        from: SocketAddr,
    ) -> Option<Arc<dyn PeerSession>> {
        let identity = self.identity_from_reference(reference)?;
        let peer = Arc::new(TestPeer::new(identity, from, &[7, 8]).assigning_tracker(11));
        self.created.lock().unwrap().push(Arc::clone(&peer));
        Some(peer as Arc<dyn PeerSession>)
    }
}

pub fn test_config() -> HandshakeConfig {
    HandshakeConfig {
        context_pool_size: 3,
        startup_grace_secs: 0,
        ..HandshakeConfig::default()
    }
}

pub struct Node {
    pub address: SocketAddr,
    pub keypair: Arc<IdentityKeypair>,
    pub transport: Arc<MemoryTransport>,
    pub scheduler: Arc<ManualScheduler>,
    pub registry: Arc<TestRegistry>,
    pub handshaker: Handshaker,
}

impl Node {
    pub fn new(
        keypair: Arc<IdentityKeypair>,
        address: SocketAddr,
        config: HandshakeConfig,
        peers: Vec<Arc<TestPeer>>,
        now: Instant,
    ) -> Self {
        let local = LocalNode {
            signer: keypair.clone(),
            // The reference is simply our identity, which is all the test
            // registry needs to rebuild an anonymous initiator.
            reference: Bytes::copy_from_slice(&keypair.identity()),
            open: true,
        };
        Self::with_local(keypair, local, address, config, peers, now)
    }

    /// A node whose signer or reference may disagree with `keypair`.
    pub fn with_local(
        keypair: Arc<IdentityKeypair>,
        local: LocalNode,
        address: SocketAddr,
        config: HandshakeConfig,
        peers: Vec<Arc<TestPeer>>,
        now: Instant,
    ) -> Self {
        let transport = Arc::new(MemoryTransport::default());
        let scheduler = Arc::new(ManualScheduler::default());
        let registry = Arc::new(TestRegistry::new(peers));
        let handshaker = Handshaker::new(
            config,
            local,
            transport.clone(),
            registry.clone(),
            scheduler.clone(),
            now,
        )
        .unwrap();
        handshaker.start(now);

        Self {
            address,
            keypair,
            transport,
            scheduler,
            registry,
            handshaker,
        }
    }

    pub fn identity(&self) -> [u8; IDENTITY_LENGTH] {
        self.keypair.identity()
    }

    /// Hand every packet `self` sent to `to`; returns how many were delivered.
    pub fn deliver_to(&self, to: &Node, now: Instant) -> usize {
        let mut delivered = 0;
        for (packet, destination) in self.transport.take() {
            if destination != to.address {
                continue;
            }
            assert_eq!(
                to.handshaker.handle_incoming(&packet, self.address, now),
                Decoded::Handled
            );
            delivered += 1;
        }
        delivered
    }
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Bounce packets between two nodes until both go quiet.
pub fn run_exchange(a: &Node, b: &Node, now: Instant) {
    for _ in 0..8 {
        let moved = a.deliver_to(b, now) + b.deliver_to(a, now);
        if moved == 0 {
            return;
        }
    }
    panic!("handshake did not settle");
}

/// Initiator `a` and responder `b`, each knowing the other.
pub struct Pair {
    pub a: Node,
    pub b: Node,
    /// `a`'s session object for `b`.
    pub b_at_a: Arc<TestPeer>,
    /// `b`'s session object for `a`.
    pub a_at_b: Arc<TestPeer>,
}

pub fn known_pair(types: &[u8], config: HandshakeConfig, now: Instant) -> Pair {
    let key_a = Arc::new(IdentityKeypair::generate());
    let key_b = Arc::new(IdentityKeypair::generate());
    let (addr_a, addr_b) = (addr(4001), addr(4002));

    let b_at_a = Arc::new(TestPeer::new(key_b.identity(), addr_b, types).offering_tracker(7));
    let a_at_b = Arc::new(TestPeer::new(key_a.identity(), addr_a, types));

    let a = Node::new(key_a, addr_a, config.clone(), vec![b_at_a.clone()], now);
    let b = Node::new(key_b, addr_b, config, vec![a_at_b.clone()], now);
    Pair { a, b, b_at_a, a_at_b }
}
