//! Handshake packet dispatcher.
//!
//! Incoming datagrams are tried against the setup key of the peer at the
//! source address, then against every known peer (the peer may have moved),
//! then against our own anonymous key. The first key that opens the
//! envelope decides who the packet is from and which header layout applies.
//!
//! # Thread Safety
//!
//! `handle_incoming` may be called from any number of receive threads.
//! Shared state is split across the pools, the authenticator cache, the
//! address throttle and one mutex per peer state; none of them is held
//! while another is taken, except a peer state lock around cache calls.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use jfk_common::{HandshakeConfig, LogGate};
use jfk_core::{
    AuthHeader, Message1, NegotiationType, Phase, SetupType, ANON_HEADER_LENGTH, HASH_LENGTH,
    KNOWN_HEADER_LENGTH, NONCE_SIZE,
};
use rand::rngs::OsRng;
use rand::{thread_rng, Rng, RngCore};
use tracing::{debug, error, info, warn};

use crate::authenticator::AuthenticatorCache;
use crate::collaborators::{DatagramTransport, NodeSigner, PeerRegistry, PeerSession, Scheduler};
use crate::context_pool::ContextPool;
use crate::envelope::{self, PaddingPolicy, ENVELOPE_KEY_LENGTH};
use crate::error::{DropClass, HandshakeError};
use crate::identity::{anonymous_setup_key, identity_hash, setup_key, IDENTITY_LENGTH};
use crate::key_agreement::KeyAgreementKind;
use crate::lock_or_recover;
use crate::state::PeerHandshakeState;
use crate::throttle::RekeyThrottle;

const AUTH_FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Who we are on the handshake.
pub struct LocalNode {
    pub signer: Arc<dyn NodeSigner>,
    /// Blob describing this node, sent to peers in M3 and M4.
    pub reference: Bytes,
    /// Open nodes still offer negotiation type 6.
    pub open: bool,
}

/// Outcome of [`Handshaker::handle_incoming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// A key opened the envelope. The packet was processed or dropped.
    Handled,
    /// No key opened the envelope; it may belong to another protocol.
    NotRecognized,
    ShuttingDown,
}

/// The envelope key that opened a packet and what it tells us.
struct Opened<'a> {
    peer: Option<&'a Arc<dyn PeerSession>>,
    key: [u8; ENVELOPE_KEY_LENGTH],
    anonymous: bool,
}

/// A decoded packet on its way to a phase handler.
pub(crate) struct Inbound<'a> {
    pub header: AuthHeader,
    /// `None` only for packets from an anonymous initiator.
    pub peer: Option<&'a Arc<dyn PeerSession>>,
    /// Replies go out under the same key.
    pub key: [u8; ENVELOPE_KEY_LENGTH],
    pub source: SocketAddr,
    pub now: Instant,
}

pub struct Handshaker {
    pub(crate) config: HandshakeConfig,
    pub(crate) signer: Arc<dyn NodeSigner>,
    pub(crate) identity: [u8; IDENTITY_LENGTH],
    pub(crate) identity_hash: [u8; HASH_LENGTH],
    anonymous_key: [u8; ENVELOPE_KEY_LENGTH],
    pub(crate) reference: Bytes,
    open: bool,
    pub(crate) transport: Arc<dyn DatagramTransport>,
    pub(crate) registry: Arc<dyn PeerRegistry>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    dh_pool: Arc<ContextPool>,
    ecdh_pool: Option<Arc<ContextPool>>,
    pub(crate) authenticators: Arc<AuthenticatorCache>,
    pub(crate) address_throttle: RekeyThrottle,
    states: Mutex<HashMap<[u8; HASH_LENGTH], Arc<Mutex<PeerHandshakeState>>>>,
    pub(crate) shutting_down: Arc<AtomicBool>,
    auth_failure_log: LogGate,
    no_contexts_log: LogGate,
}

impl Handshaker {
    pub fn new(
        config: HandshakeConfig,
        local: LocalNode,
        transport: Arc<dyn DatagramTransport>,
        registry: Arc<dyn PeerRegistry>,
        scheduler: Arc<dyn Scheduler>,
        now: Instant,
    ) -> Result<Self, jfk_common::Error> {
        config.validate()?;

        let identity = local.signer.identity();
        let identity_hash = identity_hash(&identity);

        let pool = |kind| {
            Arc::new(ContextPool::new(
                kind,
                config.context_pool_size,
                config.context_generation_interval(),
                Arc::clone(&local.signer),
                Arc::clone(&scheduler),
            ))
        };
        let dh_pool = pool(KeyAgreementKind::Dh);
        let ecdh_pool = config.enable_ecdh.then(|| pool(KeyAgreementKind::Ecdh));

        let authenticators = Arc::new(AuthenticatorCache::new(
            config.effective_authenticator_cache_capacity(),
            config.transient_key_rekey_interval(),
            now,
        ));
        let address_throttle =
            RekeyThrottle::new(config.rekey_throttle_table_size, config.rekey_throttle_window());
        let grace_until = now + config.startup_grace();
        let no_contexts_log = LogGate::new(config.no_contexts_log_interval());

        Ok(Self {
            signer: local.signer,
            identity,
            identity_hash,
            anonymous_key: anonymous_setup_key(&identity_hash),
            reference: local.reference,
            open: local.open,
            transport,
            registry,
            scheduler,
            dh_pool,
            ecdh_pool,
            authenticators,
            address_throttle,
            states: Mutex::new(HashMap::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            auth_failure_log: LogGate::new(AUTH_FAILURE_LOG_INTERVAL).with_grace_until(grace_until),
            no_contexts_log,
            config,
        })
    }

    /// Fill the context pools and start the background timers.
    pub fn start(&self, now: Instant) {
        self.dh_pool.start(now);
        if let Some(pool) = &self.ecdh_pool {
            pool.start(now);
        }
        schedule_rotation_check(
            Arc::clone(&self.authenticators),
            Arc::clone(&self.scheduler),
            now,
        );
        info!(
            "JFK handshaker started (types {:?}, anonymous initiators {})",
            self.supported_types(),
            if self.config.accept_anonymous_initiators {
                "accepted"
            } else {
                "refused"
            }
        );
    }

    /// Stop handling packets and wipe every secret we hold.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dh_pool.shutdown();
        if let Some(pool) = &self.ecdh_pool {
            pool.shutdown();
        }
        self.authenticators.shutdown();
        let states: Vec<_> = lock_or_recover(&self.states).drain().collect();
        for (_, state) in states {
            lock_or_recover(&state).clear();
        }
        info!("JFK handshaker shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn identity(&self) -> &[u8; IDENTITY_LENGTH] {
        &self.identity
    }

    pub fn authenticator_cache(&self) -> &AuthenticatorCache {
        &self.authenticators
    }

    /// Negotiation types this node speaks, lowest first.
    pub fn supported_types(&self) -> Vec<NegotiationType> {
        NegotiationType::supported(self.open)
            .iter()
            .copied()
            .filter(|t| self.ecdh_pool.is_some() || !t.uses_ecdh())
            .collect()
    }

    pub(crate) fn supports(&self, negotiation_type: NegotiationType) -> bool {
        self.supported_types().contains(&negotiation_type)
    }

    pub(crate) fn pool_for(&self, kind: KeyAgreementKind) -> Result<&Arc<ContextPool>, HandshakeError> {
        match kind {
            KeyAgreementKind::Dh => Ok(&self.dh_pool),
            KeyAgreementKind::Ecdh => self
                .ecdh_pool
                .as_ref()
                .ok_or_else(|| HandshakeError::protocol("ECDH is disabled on this node")),
        }
    }

    pub(crate) fn state_for(&self, identity_hash: &[u8; HASH_LENGTH]) -> Arc<Mutex<PeerHandshakeState>> {
        let mut states = lock_or_recover(&self.states);
        let max_nonces = self.config.max_nonces_per_peer;
        Arc::clone(
            states
                .entry(*identity_hash)
                .or_insert_with(|| Arc::new(Mutex::new(PeerHandshakeState::new(max_nonces)))),
        )
    }

    /// Entry point for every datagram that might be a handshake packet.
    pub fn handle_incoming(&self, packet: &[u8], source: SocketAddr, now: Instant) -> Decoded {
        if self.is_shutting_down() {
            return Decoded::ShuttingDown;
        }

        let mut tried = None;
        if let Some(peer) = self.registry.lookup_by_address(source) {
            if self.try_peer(&peer, packet, source, now) {
                return Decoded::Handled;
            }
            tried = Some(peer.identity_hash());
        }

        for peer in self.registry.all_known_peers() {
            if tried == Some(peer.identity_hash()) {
                continue;
            }
            if self.try_peer(&peer, packet, source, now) {
                debug!("handshake packet from {} matched a peer at another address", source);
                return Decoded::Handled;
            }
        }

        if self.config.accept_anonymous_initiators {
            if let Ok(payload) = envelope::decode(&self.anonymous_key, packet, ANON_HEADER_LENGTH) {
                let opened = Opened {
                    peer: None,
                    key: self.anonymous_key,
                    anonymous: true,
                };
                self.process_payload(opened, &payload, source, now);
                return Decoded::Handled;
            }
        }

        debug!("unmatched packet from {} ({} bytes)", source, packet.len());
        Decoded::NotRecognized
    }

    fn try_peer(&self, peer: &Arc<dyn PeerSession>, packet: &[u8], source: SocketAddr, now: Instant) -> bool {
        let peer_hash = peer.identity_hash();
        let mut candidates = vec![(setup_key(&self.identity_hash, &peer_hash), false)];
        if peer.is_anonymous_target() {
            candidates.push((anonymous_setup_key(&peer_hash), true));
        }

        for (key, anonymous) in candidates {
            let min_payload = if anonymous {
                ANON_HEADER_LENGTH
            } else {
                KNOWN_HEADER_LENGTH
            };
            if let Ok(payload) = envelope::decode(&key, packet, min_payload) {
                let opened = Opened {
                    peer: Some(peer),
                    key,
                    anonymous,
                };
                self.process_payload(opened, &payload, source, now);
                return true;
            }
        }
        false
    }

    /// Parse the header and hand the body to its phase.
    fn process_payload(&self, opened: Opened<'_>, payload: &[u8], source: SocketAddr, now: Instant) {
        let result = AuthHeader::decode(payload, opened.anonymous)
            .map_err(HandshakeError::from)
            .and_then(|(header, body)| {
                let inbound = Inbound {
                    header,
                    peer: opened.peer,
                    key: opened.key,
                    source,
                    now,
                };
                self.dispatch(&inbound, body)
            });
        if let Err(err) = result {
            self.log_drop(&err, source, now);
        }
    }

    fn dispatch(&self, inbound: &Inbound<'_>, body: &[u8]) -> Result<(), HandshakeError> {
        let negotiation_type = inbound.header.negotiation_type;
        if !self.supports(negotiation_type) {
            return Err(HandshakeError::protocol(format!(
                "negotiation type {} is not supported here",
                negotiation_type as u8
            )));
        }

        let initiated_anonymously = inbound.header.is_anonymous() && inbound.peer.is_some();
        match inbound.header.phase {
            Phase::Message1 | Phase::Message3 if initiated_anonymously => Err(HandshakeError::Unexpected(
                "initiator message on an anonymous reply channel",
            )),
            Phase::Message1 => self.process_message1(inbound, body),
            Phase::Message2 => {
                let peer = inbound
                    .peer
                    .ok_or(HandshakeError::Unexpected("M2 sent to an anonymous responder"))?;
                self.process_message2(inbound, peer, body)
            }
            Phase::Message3 => self.process_message3(inbound, body),
            Phase::Message4 => {
                let peer = inbound
                    .peer
                    .ok_or(HandshakeError::Unexpected("M4 sent to an anonymous responder"))?;
                self.process_message4(inbound, peer, body)
            }
        }
    }

    /// Start a handshake with `peer` by sending M1.
    pub fn send_handshake(&self, peer: &Arc<dyn PeerSession>, now: Instant) -> Result<(), HandshakeError> {
        let result = self.send_message1(peer, now);
        if let Err(err) = &result {
            let destination = peer
                .handshake_address()
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
            self.log_drop(err, destination, now);
        }
        result
    }

    fn send_message1(&self, peer: &Arc<dyn PeerSession>, now: Instant) -> Result<(), HandshakeError> {
        if self.is_shutting_down() {
            return Err(HandshakeError::ShuttingDown);
        }
        let destination = peer
            .handshake_address()
            .ok_or(HandshakeError::Unexpected("peer has no handshake address"))?;

        let negotiation_type = self.select_negotiation_type(peer.as_ref());
        let kind = KeyAgreementKind::for_negotiation(negotiation_type);
        let peer_hash = peer.identity_hash();
        let anonymous = peer.is_anonymous_target();

        let state = self.state_for(&peer_hash);
        let (nonce_i, context) = {
            let mut state = lock_or_recover(&state);
            let context = match state.reusable_context(kind, now, self.config.context_reuse_window()) {
                Some(context) => context,
                None => {
                    let context = self.pool_for(kind)?.acquire(now)?;
                    state.set_context(Arc::clone(&context), now);
                    context
                }
            };
            let nonce = random_nonce();
            state.remember_nonce(nonce);
            (nonce, context)
        };

        let message = Message1 {
            nonce_i,
            exponential_i: context.public_key_bytes().clone(),
            responder_identity_hash: anonymous.then_some(peer_hash),
        };
        let (header, key) = if anonymous {
            (
                AuthHeader::anonymous(negotiation_type, Phase::Message1, SetupType::SeedNode),
                anonymous_setup_key(&peer_hash),
            )
        } else {
            (
                AuthHeader::known(negotiation_type, Phase::Message1),
                setup_key(&self.identity_hash, &peer_hash),
            )
        };

        let payload = encode_payload(&header, |buf| message.encode(buf));
        debug!(
            "sending M1 to {} (type {}, anonymous {})",
            destination, negotiation_type as u8, anonymous
        );
        self.send_auth_packet(&key, &payload, destination)
    }

    /// Highest common type, or a random one of ours if the peer shares none.
    fn select_negotiation_type(&self, peer: &dyn PeerSession) -> NegotiationType {
        let ours = self.supported_types();
        if let Some(best) = NegotiationType::best_common(&ours, &peer.negotiation_types()) {
            return best;
        }
        let fallback = ours[thread_rng().gen_range(0..ours.len())];
        info!(
            "no negotiation type in common with peer (theirs {:?}), trying {}",
            peer.negotiation_types(),
            fallback as u8
        );
        fallback
    }

    pub(crate) fn send_auth_packet(
        &self,
        key: &[u8; ENVELOPE_KEY_LENGTH],
        payload: &[u8],
        destination: SocketAddr,
    ) -> Result<(), HandshakeError> {
        send_auth_packet(
            self.transport.as_ref(),
            self.config.max_auth_padding,
            key,
            payload,
            destination,
        )
    }

    pub(crate) fn log_drop(&self, err: &HandshakeError, source: SocketAddr, now: Instant) {
        match err.class() {
            DropClass::Malformed => debug!("dropping malformed handshake packet from {}: {}", source, err),
            DropClass::Unauthenticated | DropClass::Unexpected => {
                if self.auth_failure_log.allow(now) {
                    info!("dropping handshake packet from {}: {}", source, err);
                } else {
                    debug!("dropping handshake packet from {}: {}", source, err);
                }
            }
            DropClass::Exhausted => {
                warn!("handshake with {} dropped: {}", source, err);
                if self.no_contexts_log.allow(now) {
                    error!("key-agreement contexts exhausted; handshakes are being dropped");
                }
            }
            DropClass::ProtocolMismatch => error!("handshake with {} failed: {}", source, err),
            DropClass::Retired => warn!("peer {} uses {}; it needs to upgrade", source, err),
            DropClass::Refused => error!("handshake with {} refused: {}", source, err),
            DropClass::Local => warn!("handshake with {} aborted: {}", source, err),
        }
    }
}

impl Drop for Handshaker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Check the transient key periodically so that it rotates on time even
/// when no exchange triggers it.
fn schedule_rotation_check(cache: Arc<AuthenticatorCache>, scheduler: Arc<dyn Scheduler>, now: Instant) {
    let delay = cache.next_rotation_check(now);
    let next = Arc::clone(&scheduler);
    scheduler.schedule(
        delay,
        Box::new(move || {
            if cache.is_shut_down() {
                return;
            }
            let now = Instant::now();
            cache.maybe_rotate_transient_key(now);
            schedule_rotation_check(cache, next, now);
        }),
    );
}

pub(crate) fn send_auth_packet(
    transport: &dyn DatagramTransport,
    max_padding: usize,
    key: &[u8; ENVELOPE_KEY_LENGTH],
    payload: &[u8],
    destination: SocketAddr,
) -> Result<(), HandshakeError> {
    let policy = PaddingPolicy {
        max_packet_size: transport.max_packet_size(),
        header_overhead: transport.header_overhead(),
        max_padding,
    };
    let packet = envelope::encode(key, payload, &policy)?;
    transport.send_datagram(&packet, destination)?;
    Ok(())
}

pub(crate) fn encode_payload(header: &AuthHeader, body: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    header.encode(&mut buf);
    body(&mut buf);
    buf.freeze()
}

pub(crate) fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Address bytes as bound into the authenticator: IP octets then port.
pub(crate) fn address_bytes(address: SocketAddr) -> Vec<u8> {
    let mut out = match address.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    out.extend_from_slice(&address.port().to_be_bytes());
    out
}
