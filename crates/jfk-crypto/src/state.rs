//! Per-peer initiator state.
//!
//! Only the initiator keeps state across messages: the nonces it has put in
//! M1, the context behind its exponential, and after M2 the derived keys
//! and the transcript prefix needed to check M4.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use jfk_core::{NegotiationType, NONCE_SIZE};
use zeroize::Zeroizing;

use crate::kdf::DerivedSessionMaterial;
use crate::key_agreement::{KeyAgreementContext, KeyAgreementKind};

/// An exchange that has sent M3 and waits for M4.
pub(crate) struct PendingExchange {
    pub negotiation_type: NegotiationType,
    /// `Ni ‖ Nr ‖ g^i ‖ g^r`, the prefix of the M4 signed data.
    pub jfk_buffer: Zeroizing<Vec<u8>>,
    pub material: DerivedSessionMaterial,
    /// Reference we sent in M3; the responder signs it in M4.
    pub my_reference: Bytes,
}

struct ActiveContext {
    context: Arc<KeyAgreementContext>,
    acquired_at: Instant,
}

pub(crate) struct PeerHandshakeState {
    nonces_sent: VecDeque<[u8; NONCE_SIZE]>,
    max_nonces: usize,
    contexts: Vec<ActiveContext>,
    pending: Option<PendingExchange>,
    pub last_rekey: Option<Instant>,
}

impl PeerHandshakeState {
    pub fn new(max_nonces: usize) -> Self {
        Self {
            nonces_sent: VecDeque::with_capacity(max_nonces),
            max_nonces: max_nonces.max(1),
            contexts: Vec::new(),
            pending: None,
            last_rekey: None,
        }
    }

    pub fn remember_nonce(&mut self, nonce: [u8; NONCE_SIZE]) {
        while self.nonces_sent.len() >= self.max_nonces {
            self.nonces_sent.pop_front();
        }
        self.nonces_sent.push_back(nonce);
    }

    pub fn has_sent_nonce(&self, nonce: &[u8; NONCE_SIZE]) -> bool {
        self.nonces_sent.iter().any(|n| n == nonce)
    }

    /// Context of `kind` still young enough to put in another M1.
    pub fn reusable_context(
        &self,
        kind: KeyAgreementKind,
        now: Instant,
        reuse_window: Duration,
    ) -> Option<Arc<KeyAgreementContext>> {
        self.contexts
            .iter()
            .find(|c| c.context.kind() == kind)
            .filter(|c| now.saturating_duration_since(c.acquired_at) < reuse_window)
            .map(|c| Arc::clone(&c.context))
    }

    /// Context of `kind` our last M1 carried, regardless of age.
    pub fn current_context(&self, kind: KeyAgreementKind) -> Option<Arc<KeyAgreementContext>> {
        self.contexts
            .iter()
            .find(|c| c.context.kind() == kind)
            .map(|c| Arc::clone(&c.context))
    }

    pub fn set_context(&mut self, context: Arc<KeyAgreementContext>, now: Instant) {
        self.contexts.retain(|c| c.context.kind() != context.kind());
        self.contexts.push(ActiveContext {
            context,
            acquired_at: now,
        });
    }

    pub fn set_pending(&mut self, pending: PendingExchange) {
        self.pending = Some(pending);
    }

    pub fn pending(&self) -> Option<&PendingExchange> {
        self.pending.as_ref()
    }

    /// Forget the exchange. Key material is zeroized as it drops.
    pub fn clear(&mut self) {
        self.pending = None;
        self.nonces_sent.clear();
        self.contexts.clear();
    }
}
