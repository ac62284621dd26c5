//! Static peer table and per-peer session objects.
//!
//! Peers come from a JSON file:
//!
//! ```json
//! [
//!   { "identity": "<base64url>", "address": "192.0.2.1:4100", "seed": false }
//! ]
//! ```
//!
//! Anonymous initiators that reach us while we act as a seed are added to
//! the table at runtime, once their handshake signature has verified. At
//! most `max_accepted` of them are kept; the least recently seen go first.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use lru::LruCache;
use jfk_core::SetupType;
use jfk_crypto::identity::IDENTITY_LENGTH;
use jfk_crypto::{HandshakeCompletion, NodeId, PeerRegistry, PeerSession, Role, SessionKeys};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

fn default_negotiation_types() -> Vec<u8> {
    vec![7, 8]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub identity: NodeId,
    pub address: SocketAddr,
    #[serde(default = "default_negotiation_types")]
    pub negotiation_types: Vec<u8>,
    /// Connect without revealing our identity up front.
    #[serde(default)]
    pub seed: bool,
}

pub fn load_peers(path: impl AsRef<Path>) -> Result<Vec<PeerEntry>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read peers file {}", path.display()))?;
    let entries: Vec<PeerEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse peers file {}", path.display()))?;
    for entry in &entries {
        entry.identity.to_bytes()?;
    }
    Ok(entries)
}

#[derive(Default)]
struct SessionState {
    tracker_id: Option<i64>,
    keys: Option<SessionKeys>,
    peer_boot_id: Option<u64>,
    address: Option<SocketAddr>,
    last_completed: Option<Instant>,
}

/// Tracker IDs handed out by this process.
static NEXT_TRACKER: AtomicI64 = AtomicI64::new(1);

pub struct NodeSession {
    identity: [u8; IDENTITY_LENGTH],
    node_id: NodeId,
    negotiation_types: Vec<u8>,
    seed: bool,
    boot_id: u64,
    state: Mutex<SessionState>,
}

impl NodeSession {
    pub fn new(
        identity: [u8; IDENTITY_LENGTH],
        address: Option<SocketAddr>,
        negotiation_types: Vec<u8>,
        seed: bool,
        boot_id: u64,
    ) -> Self {
        Self {
            identity,
            node_id: NodeId::from_bytes(&identity),
            negotiation_types,
            seed,
            boot_id,
            state: Mutex::new(SessionState {
                address,
                ..SessionState::default()
            }),
        }
    }

    pub fn from_entry(entry: &PeerEntry, boot_id: u64) -> Result<Self> {
        Ok(Self::new(
            entry.identity.to_bytes()?,
            Some(entry.address),
            entry.negotiation_types.clone(),
            entry.seed,
            boot_id,
        ))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn address(&self) -> Option<SocketAddr> {
        self.state.lock().ok().and_then(|s| s.address)
    }

    /// Whether a fresh handshake is due.
    pub fn needs_handshake(&self, now: Instant, rekey_after: Duration) -> bool {
        match self.state.lock() {
            Ok(state) => state
                .last_completed
                .map_or(true, |at| now.saturating_duration_since(at) >= rekey_after),
            Err(_) => false,
        }
    }

    pub fn has_keys(&self) -> bool {
        self.state.lock().map(|s| s.keys.is_some()).unwrap_or(false)
    }
}

impl PeerSession for NodeSession {
    fn identity(&self) -> [u8; IDENTITY_LENGTH] {
        self.identity
    }

    fn handshake_address(&self) -> Option<SocketAddr> {
        self.address()
    }

    fn is_anonymous_target(&self) -> bool {
        self.seed
    }

    fn negotiation_types(&self) -> Vec<u8> {
        self.negotiation_types.clone()
    }

    fn reusable_tracker_id(&self) -> i64 {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.tracker_id)
            .unwrap_or(-1)
    }

    fn outgoing_boot_id(&self) -> u64 {
        self.boot_id
    }

    fn complete_handshake(&self, completion: HandshakeCompletion) -> Option<i64> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                warn!("session state for {} is poisoned", self.node_id);
                return None;
            }
        };

        let tracker_id = match completion.role {
            // Keep the initiator's tracker if it is the one we already use.
            Role::Responder => match state.tracker_id {
                Some(current) if current == completion.tracker_id => current,
                _ => NEXT_TRACKER.fetch_add(1, Ordering::Relaxed),
            },
            Role::Initiator => completion.tracker_id,
        };

        if let Some(previous) = state.peer_boot_id {
            if previous != completion.peer_boot_id {
                info!("{} restarted (boot ID changed)", self.node_id);
            }
        }

        info!(
            "session with {} at {} established ({:?}, type {}, tracker {})",
            self.node_id,
            completion.source,
            completion.role,
            completion.negotiation_type as u8,
            tracker_id
        );

        state.tracker_id = Some(tracker_id);
        state.peer_boot_id = Some(completion.peer_boot_id);
        state.address = Some(completion.source);
        state.keys = Some(completion.keys);
        state.last_completed = Some(completion.completed_at);
        Some(tracker_id)
    }

    fn last_connection_completed(&self) -> Option<Instant> {
        self.state.lock().ok().and_then(|s| s.last_completed)
    }
}

/// Known peers plus anonymous initiators accepted at runtime.
pub struct PeerTable {
    known: Vec<Arc<NodeSession>>,
    accepted: Mutex<LruCache<[u8; IDENTITY_LENGTH], Arc<NodeSession>>>,
    boot_id: u64,
}

impl PeerTable {
    pub fn new(entries: &[PeerEntry], boot_id: u64, max_accepted: usize) -> Result<Self> {
        let known = entries
            .iter()
            .map(|e| NodeSession::from_entry(e, boot_id).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let bound = NonZeroUsize::new(max_accepted).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            known,
            accepted: Mutex::new(LruCache::new(bound)),
            boot_id,
        })
    }

    pub fn known(&self) -> &[Arc<NodeSession>] {
        &self.known
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn all(&self) -> Vec<Arc<NodeSession>> {
        let mut all = self.known.clone();
        if let Ok(accepted) = self.accepted.lock() {
            all.extend(accepted.iter().map(|(_, peer)| Arc::clone(peer)));
        }
        all
    }
}

impl PeerRegistry for PeerTable {
    fn lookup_by_address(&self, address: SocketAddr) -> Option<Arc<dyn PeerSession>> {
        self.all()
            .into_iter()
            .find(|p| p.address() == Some(address))
            .map(|p| p as Arc<dyn PeerSession>)
    }

    fn all_known_peers(&self) -> Vec<Arc<dyn PeerSession>> {
        self.all()
            .into_iter()
            .map(|p| p as Arc<dyn PeerSession>)
            .collect()
    }

    fn identity_from_reference(&self, reference: &[u8]) -> Option<[u8; IDENTITY_LENGTH]> {
        reference.try_into().ok()
    }

    fn peer_from_reference(
        &self,
        reference: &[u8],
        setup_type: SetupType,
        from: SocketAddr,
    ) -> Option<Arc<dyn PeerSession>> {
        let identity = self.identity_from_reference(reference)?;

        if let Some(peer) = self.known.iter().find(|p| p.identity == identity) {
            return Some(Arc::clone(peer) as Arc<dyn PeerSession>);
        }

        let mut accepted = self.accepted.lock().ok()?;
        if let Some(peer) = accepted.get(&identity) {
            return Some(Arc::clone(peer) as Arc<dyn PeerSession>);
        }

        let peer = Arc::new(NodeSession::new(
            identity,
            Some(from),
            default_negotiation_types(),
            false,
            self.boot_id,
        ));
        info!(
            "accepted {:?} connection from {} ({})",
            setup_type,
            peer.node_id(),
            from
        );
        if let Some((_, evicted)) = accepted.push(identity, Arc::clone(&peer)) {
            debug!("dropped anonymous peer {} to make room", evicted.node_id());
        }
        Some(peer as Arc<dyn PeerSession>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jfk_core::NegotiationType;
    use jfk_crypto::kdf::{DerivedSessionMaterial, MessageIdScheme};

    const ID: &str = "AQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHyA";

    fn completion(role: Role, tracker_id: i64) -> HandshakeCompletion {
        let material = DerivedSessionMaterial::derive(&[1u8; 32], &[1; 8], &[2; 8]);
        HandshakeCompletion {
            role,
            negotiation_type: NegotiationType::Ecdh,
            keys: SessionKeys::for_role(&material, role, MessageIdScheme::Derived),
            peer_boot_id: 1,
            peer_reference: bytes::Bytes::new(),
            source: "127.0.0.1:4100".parse().unwrap(),
            tracker_id,
            reused_tracker: false,
            setup_type: None,
            completed_at: Instant::now(),
        }
    }

    #[test]
    fn test_parse_peer_entry_defaults() {
        let raw = format!(r#"[{{"identity":"{ID}","address":"127.0.0.1:4100"}}]"#);
        let entries: Vec<PeerEntry> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entries[0].negotiation_types, vec![7, 8]);
        assert!(!entries[0].seed);
        assert_eq!(entries[0].identity.to_bytes().unwrap()[0], 1);
    }

    #[test]
    fn test_responder_keeps_current_tracker() {
        let session = NodeSession::new([1; 32], None, vec![8], false, 5);
        assert!(session.needs_handshake(Instant::now(), Duration::from_secs(60)));

        let first = session.complete_handshake(completion(Role::Responder, -1)).unwrap();
        assert!(first > 0);
        assert_eq!(session.reusable_tracker_id(), first);

        let again = session.complete_handshake(completion(Role::Responder, first)).unwrap();
        assert_eq!(again, first);

        let fresh = session.complete_handshake(completion(Role::Responder, first + 1000)).unwrap();
        assert_ne!(fresh, first);
        assert!(session.has_keys());
        assert!(!session.needs_handshake(Instant::now(), Duration::from_secs(60)));
    }

    #[test]
    fn test_initiator_adopts_responder_tracker() {
        let session = NodeSession::new([1; 32], None, vec![8], false, 5);
        assert_eq!(session.complete_handshake(completion(Role::Initiator, 42)), Some(42));
        assert_eq!(session.reusable_tracker_id(), 42);
    }

    #[test]
    fn test_anonymous_reference_creates_one_session() {
        let table = PeerTable::new(&[], 9, 8).unwrap();
        let from: SocketAddr = "127.0.0.1:4200".parse().unwrap();

        let peer = table.peer_from_reference(&[3; 32], SetupType::SeedNode, from).unwrap();
        assert_eq!(peer.identity(), [3; 32]);
        assert!(table.peer_from_reference(&[3; 32], SetupType::SeedNode, from).is_some());
        assert_eq!(table.accepted_count(), 1);

        assert!(table.lookup_by_address(from).is_some());
        assert!(table.peer_from_reference(b"short", SetupType::SeedNode, from).is_none());
    }

    #[test]
    fn test_resolving_reference_does_not_admit() {
        let table = PeerTable::new(&[], 9, 8).unwrap();
        assert_eq!(table.identity_from_reference(&[4; 32]), Some([4; 32]));
        assert_eq!(table.identity_from_reference(b"short"), None);
        assert_eq!(table.accepted_count(), 0);
        assert!(table.all_known_peers().is_empty());
    }

    #[test]
    fn test_accepted_peers_are_bounded() {
        let table = PeerTable::new(&[], 9, 2).unwrap();
        for i in 0..5u8 {
            let from = SocketAddr::from(([127, 0, 0, 1], 4300 + u16::from(i)));
            table.peer_from_reference(&[i; 32], SetupType::SeedNode, from).unwrap();
        }
        assert_eq!(table.accepted_count(), 2);

        let identities: Vec<_> = table.all_known_peers().iter().map(|p| p.identity()).collect();
        assert!(identities.contains(&[4; 32]));
        assert!(!identities.contains(&[0; 32]));
    }
}
