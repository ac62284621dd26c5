//! The four JFK messages.
//!
//! # Signed Data
//!
//! ```text
//! M3: SHA-256(Ni ‖ Nr ‖ g^i ‖ g^r ‖ ID_R ‖ tracker ‖ boot ‖ ref_I)
//! M4: SHA-256(Ni ‖ Nr ‖ g^i ‖ g^r ‖ ID_I ‖ tracker ‖ reused ‖ boot ‖ ref_R ‖ ref_I)
//! ```
//!
//! Integers are big-endian. The inner payloads of M3 and M4 are encrypted
//! with Ke under AES-256-CTR and authenticated with `HMAC_Ka(label ‖ iv ‖
//! ciphertext)`, where the label is `I` for M3 and `R` for M4.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use jfk_common::constant_time_eq;
use jfk_core::{
    Message1, Message2, Message3, Message3Inner, Message4, Message4Inner, NegotiationType, Phase,
    HASH_LENGTH, IV_LENGTH, MAC_LENGTH, NONCE_SIZE,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::collaborators::{HandshakeCompletion, PeerSession};
use crate::dispatcher::{address_bytes, encode_payload, random_nonce, send_auth_packet, Handshaker, Inbound};
use crate::envelope::{random_iv, stream_xor, ENVELOPE_KEY_LENGTH};
use crate::error::HandshakeError;
use crate::identity::verify_digest;
use crate::kdf::{hmac_sha256, DerivedSessionMaterial, MessageIdScheme, Role, SessionKeys};
use crate::key_agreement::{dh_public_value_is_valid, verify_context_signature, KeyAgreementKind};
use crate::lock_or_recover;
use crate::state::PendingExchange;
use crate::throttle::peer_rekey_throttled;

const INITIATOR_LABEL: u8 = b'I';
const RESPONDER_LABEL: u8 = b'R';

fn transcript_digest(data: &[u8]) -> [u8; HASH_LENGTH] {
    Sha256::digest(data).into()
}

fn exchange_prefix(nonce_i: &[u8], nonce_r: &[u8], exponential_i: &[u8], exponential_r: &[u8]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(2 * NONCE_SIZE + exponential_i.len() + exponential_r.len());
    out.extend_from_slice(nonce_i);
    out.extend_from_slice(nonce_r);
    out.extend_from_slice(exponential_i);
    out.extend_from_slice(exponential_r);
    out
}

fn message3_signed_data(
    prefix: &[u8],
    responder_identity: &[u8],
    tracker_id: i64,
    boot_id: u64,
    initiator_reference: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + responder_identity.len() + 16 + initiator_reference.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(responder_identity);
    out.extend_from_slice(&tracker_id.to_be_bytes());
    out.extend_from_slice(&boot_id.to_be_bytes());
    out.extend_from_slice(initiator_reference);
    out
}

fn message4_signed_data(
    prefix: &[u8],
    initiator_identity: &[u8],
    tracker_id: i64,
    reused_tracker: bool,
    boot_id: u64,
    responder_reference: &[u8],
    initiator_reference: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        prefix.len() + initiator_identity.len() + 17 + responder_reference.len() + initiator_reference.len(),
    );
    out.extend_from_slice(prefix);
    out.extend_from_slice(initiator_identity);
    out.extend_from_slice(&tracker_id.to_be_bytes());
    out.push(u8::from(reused_tracker));
    out.extend_from_slice(&boot_id.to_be_bytes());
    out.extend_from_slice(responder_reference);
    out.extend_from_slice(initiator_reference);
    out
}

/// Encrypt an inner payload under Ke and MAC it under Ka.
fn seal_inner(
    material: &DerivedSessionMaterial,
    label: u8,
    plaintext: &[u8],
) -> ([u8; MAC_LENGTH], [u8; IV_LENGTH], Bytes) {
    let iv = random_iv();
    let mut ciphertext = plaintext.to_vec();
    stream_xor(&material.encryption_key, &iv, &mut ciphertext);
    let hmac = hmac_sha256(&material.mac_key, &[&[label][..], &iv[..], &ciphertext[..]]);
    (hmac, iv, Bytes::from(ciphertext))
}

fn verify_inner_mac(
    material: &DerivedSessionMaterial,
    label: u8,
    iv: &[u8; IV_LENGTH],
    ciphertext: &[u8],
    hmac: &[u8; MAC_LENGTH],
) -> bool {
    let expected = hmac_sha256(&material.mac_key, &[&[label][..], &iv[..], ciphertext]);
    constant_time_eq(&expected, hmac)
}

fn decrypt_inner(material: &DerivedSessionMaterial, iv: &[u8; IV_LENGTH], ciphertext: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut plaintext = Zeroizing::new(ciphertext.to_vec());
    stream_xor(&material.encryption_key, iv, &mut plaintext);
    plaintext
}

fn check_exponential(negotiation_type: NegotiationType, exponential: &[u8]) -> Result<(), HandshakeError> {
    if !negotiation_type.uses_ecdh() && !dh_public_value_is_valid(exponential) {
        return Err(HandshakeError::InvalidExponential);
    }
    Ok(())
}

impl Handshaker {
    fn message_id_scheme<'a>(
        &'a self,
        negotiation_type: NegotiationType,
        anonymous: bool,
        role: Role,
        peer_identity: &'a [u8],
    ) -> MessageIdScheme<'a> {
        if !negotiation_type.hashed_message_ids() {
            MessageIdScheme::Derived
        } else if anonymous {
            let responder = match role {
                Role::Initiator => peer_identity,
                Role::Responder => &self.identity[..],
            };
            MessageIdScheme::Anonymous { responder }
        } else {
            MessageIdScheme::Hashed {
                ours: &self.identity,
                theirs: peer_identity,
            }
        }
    }

    /// Responder: answer an M1 with M2 without keeping any state.
    pub(crate) fn process_message1(&self, inbound: &Inbound<'_>, body: &[u8]) -> Result<(), HandshakeError> {
        let negotiation_type = inbound.header.negotiation_type;
        let message = Message1::decode(body, negotiation_type, inbound.header.is_anonymous())?;

        if let Some(hint) = message.responder_identity_hash {
            if !constant_time_eq(&hint, &self.identity_hash) {
                return Err(HandshakeError::protocol("M1 is addressed to a different identity"));
            }
        }

        check_exponential(negotiation_type, &message.exponential_i)?;

        let throttled = match inbound.peer {
            Some(peer) => {
                let state = self.state_for(&peer.identity_hash());
                let mut state = lock_or_recover(&state);
                peer_rekey_throttled(&mut state.last_rekey, self.config.rekey_throttle_window(), inbound.now)
            }
            None => self.address_throttle.throttle(inbound.source, inbound.now),
        };
        if throttled {
            return Err(HandshakeError::Throttled(inbound.source));
        }

        let kind = KeyAgreementKind::for_negotiation(negotiation_type);
        let context = self.pool_for(kind)?.acquire(inbound.now)?;
        let nonce_r = random_nonce();
        let exponential_r = context.public_key_bytes().clone();
        let address = address_bytes(inbound.source);
        let authenticator = self.authenticators.authenticate(&[
            &exponential_r[..],
            &message.exponential_i[..],
            &nonce_r[..],
            &message.nonce_i[..],
            &address[..],
        ]);

        let reply = Message2 {
            nonce_i: message.nonce_i,
            nonce_r,
            exponential_r,
            signature: *context.signature(),
            authenticator,
        };
        let payload = encode_payload(&inbound.header.with_phase(Phase::Message2), |buf| reply.encode(buf));
        debug!("sending M2 to {}", inbound.source);
        self.send_auth_packet(&inbound.key, &payload, inbound.source)
    }

    /// Initiator: check the responder's exponential, derive keys, send M3.
    pub(crate) fn process_message2(
        &self,
        inbound: &Inbound<'_>,
        peer: &Arc<dyn PeerSession>,
        body: &[u8],
    ) -> Result<(), HandshakeError> {
        let negotiation_type = inbound.header.negotiation_type;
        let message = Message2::decode(body, negotiation_type)?;

        if let Some(cached) = self.authenticators.cached_reply(&message.authenticator) {
            info!("duplicate M2 from {}, resending M3", inbound.source);
            return self.send_auth_packet(&inbound.key, &cached, inbound.source);
        }

        let kind = KeyAgreementKind::for_negotiation(negotiation_type);
        let state = self.state_for(&peer.identity_hash());
        let mut state = lock_or_recover(&state);

        if !state.has_sent_nonce(&message.nonce_i) {
            return Err(HandshakeError::Unexpected("M2 echoes a nonce we never sent"));
        }
        let context = state
            .current_context(kind)
            .ok_or(HandshakeError::Unexpected("M2 for a key agreement we did not start"))?;

        check_exponential(negotiation_type, &message.exponential_r)?;
        let peer_identity = peer.identity();
        if !verify_context_signature(kind, &peer_identity, &message.exponential_r, &message.signature) {
            return Err(HandshakeError::Unauthenticated("M2 exponential signature"));
        }

        let shared_secret = context.derive_shared_secret(&message.exponential_r)?;
        let material = DerivedSessionMaterial::derive(&shared_secret[..], &message.nonce_i, &message.nonce_r);
        let exponential_i = context.public_key_bytes().clone();
        let prefix = Zeroizing::new(exchange_prefix(
            &message.nonce_i,
            &message.nonce_r,
            &exponential_i,
            &message.exponential_r,
        ));

        let tracker_id = peer.reusable_tracker_id();
        let boot_id = peer.outgoing_boot_id();
        let signed = message3_signed_data(&prefix, &peer_identity, tracker_id, boot_id, &self.reference);
        let inner = Message3Inner {
            signature: self.signer.sign_digest(&transcript_digest(&signed)),
            tracker_id,
            boot_id,
            reference: self.reference.clone(),
        };
        let (hmac, iv, ciphertext) = seal_inner(&material, INITIATOR_LABEL, &inner.to_bytes());

        let reply = Message3 {
            nonce_i: message.nonce_i,
            nonce_r: message.nonce_r,
            exponential_i,
            exponential_r: message.exponential_r.clone(),
            authenticator: message.authenticator,
            hmac,
            iv,
            ciphertext,
        };
        let payload = encode_payload(&inbound.header.with_phase(Phase::Message3), |buf| reply.encode(buf));

        state.set_pending(PendingExchange {
            negotiation_type,
            jfk_buffer: prefix,
            material,
            my_reference: self.reference.clone(),
        });
        drop(state);

        let payload = self
            .authenticators
            .lookup_or_store_reply(message.authenticator, payload.clone(), inbound.now)
            .unwrap_or(payload);

        debug!("sending M3 to {}", inbound.source);
        self.send_auth_packet(&inbound.key, &payload, inbound.source)?;
        self.schedule_message3_resend(peer, inbound.key, payload, inbound.source, inbound.now);
        Ok(())
    }

    /// Resend M3 once after a delay unless the handshake has completed.
    fn schedule_message3_resend(
        &self,
        peer: &Arc<dyn PeerSession>,
        key: [u8; ENVELOPE_KEY_LENGTH],
        payload: Bytes,
        destination: SocketAddr,
        sent_at: Instant,
    ) {
        let peer = Arc::clone(peer);
        let transport = Arc::clone(&self.transport);
        let shutting_down = Arc::clone(&self.shutting_down);
        let max_padding = self.config.max_auth_padding;

        self.scheduler.schedule(
            self.config.message3_resend_delay(),
            Box::new(move || {
                if shutting_down.load(Ordering::Acquire) {
                    return;
                }
                if peer.last_connection_completed().is_some_and(|at| at >= sent_at) {
                    return;
                }
                match send_auth_packet(transport.as_ref(), max_padding, &key, &payload, destination) {
                    Ok(()) => debug!("resent M3 to {}", destination),
                    Err(e) => debug!("failed to resend M3 to {}: {}", destination, e),
                }
            }),
        );
    }

    /// Responder: authenticate the initiator, complete, answer with M4.
    pub(crate) fn process_message3(&self, inbound: &Inbound<'_>, body: &[u8]) -> Result<(), HandshakeError> {
        let header = inbound.header;
        let negotiation_type = header.negotiation_type;
        let message = Message3::decode(body, negotiation_type)?;

        let address = address_bytes(inbound.source);
        let bound = [
            &message.exponential_r[..],
            &message.exponential_i[..],
            &message.nonce_r[..],
            &message.nonce_i[..],
            &address[..],
        ];
        if !self.authenticators.verify(&bound, &message.authenticator) {
            return Err(HandshakeError::Unauthenticated(
                "M3 authenticator (the transient key may have rotated)",
            ));
        }

        if let Some(cached) = self.authenticators.cached_reply(&message.authenticator) {
            info!("duplicate M3 from {}, resending M4", inbound.source);
            return self.send_auth_packet(&inbound.key, &cached, inbound.source);
        }

        let kind = KeyAgreementKind::for_negotiation(negotiation_type);
        let context = self
            .pool_for(kind)?
            .find_by_public_value(&message.exponential_r)
            .ok_or(HandshakeError::UnknownExponential)?;
        check_exponential(negotiation_type, &message.exponential_i)?;

        let shared_secret = context.derive_shared_secret(&message.exponential_i)?;
        let material = DerivedSessionMaterial::derive(&shared_secret[..], &message.nonce_i, &message.nonce_r);

        if !verify_inner_mac(&material, INITIATOR_LABEL, &message.iv, &message.ciphertext, &message.hmac) {
            return Err(HandshakeError::Unauthenticated("M3 inner MAC"));
        }
        let plaintext = decrypt_inner(&material, &message.iv, &message.ciphertext);
        let inner = Message3Inner::decode(&plaintext)?;

        let peer_identity = match inbound.peer {
            Some(peer) => peer.identity(),
            None => self
                .registry
                .identity_from_reference(&inner.reference)
                .ok_or(HandshakeError::Malformed("unusable initiator reference"))?,
        };

        let prefix = exchange_prefix(
            &message.nonce_i,
            &message.nonce_r,
            &message.exponential_i,
            &message.exponential_r,
        );
        let signed = message3_signed_data(&prefix, &self.identity, inner.tracker_id, inner.boot_id, &inner.reference);
        if !verify_digest(&peer_identity, &inner.signature, &transcript_digest(&signed)) {
            return Err(HandshakeError::Unauthenticated("M3 signature"));
        }

        // Anonymous initiators enter the registry only once their signature holds.
        let peer = match inbound.peer {
            Some(peer) => Arc::clone(peer),
            None => {
                let setup_type = header
                    .setup_type
                    .ok_or(HandshakeError::Malformed("anonymous M3 without a setup type"))?;
                let peer = self
                    .registry
                    .peer_from_reference(&inner.reference, setup_type, inbound.source)
                    .ok_or(HandshakeError::Malformed("unusable initiator reference"))?;
                if peer.identity() != peer_identity {
                    return Err(HandshakeError::Unauthenticated("initiator reference resolved to another identity"));
                }
                peer
            }
        };

        let scheme = self.message_id_scheme(negotiation_type, header.is_anonymous(), Role::Responder, &peer_identity);
        let completion = HandshakeCompletion {
            role: Role::Responder,
            negotiation_type,
            keys: SessionKeys::for_role(&material, Role::Responder, scheme),
            peer_boot_id: inner.boot_id,
            peer_reference: inner.reference.clone(),
            source: inbound.source,
            tracker_id: inner.tracker_id,
            reused_tracker: false,
            setup_type: header.setup_type,
            completed_at: inbound.now,
        };
        let tracker_id = match peer.complete_handshake(completion) {
            Some(id) if id > 0 => id,
            _ => return Err(HandshakeError::CompletionRefused),
        };
        let reused_tracker = tracker_id == inner.tracker_id;

        let boot_id = peer.outgoing_boot_id();
        let signed = message4_signed_data(
            &prefix,
            &peer_identity,
            tracker_id,
            reused_tracker,
            boot_id,
            &self.reference,
            &inner.reference,
        );
        let reply_inner = Message4Inner {
            signature: self.signer.sign_digest(&transcript_digest(&signed)),
            tracker_id,
            reused_tracker,
            boot_id,
            reference: self.reference.clone(),
        };
        let (hmac, iv, ciphertext) = seal_inner(&material, RESPONDER_LABEL, &reply_inner.to_bytes());
        let reply = Message4 { hmac, iv, ciphertext };
        let payload = encode_payload(&header.with_phase(Phase::Message4), |buf| reply.encode(buf));

        let payload = self
            .authenticators
            .lookup_or_store_reply(message.authenticator, payload.clone(), inbound.now)
            .unwrap_or(payload);

        info!(
            "handshake with {} complete as responder (type {}, tracker {}{})",
            inbound.source,
            negotiation_type as u8,
            tracker_id,
            if reused_tracker { ", reused" } else { "" }
        );
        self.send_auth_packet(&inbound.key, &payload, inbound.source)
    }

    /// Initiator: authenticate the responder and install the session.
    pub(crate) fn process_message4(
        &self,
        inbound: &Inbound<'_>,
        peer: &Arc<dyn PeerSession>,
        body: &[u8],
    ) -> Result<(), HandshakeError> {
        let header = inbound.header;
        let negotiation_type = header.negotiation_type;
        let message = Message4::decode(body)?;

        let state = self.state_for(&peer.identity_hash());
        let mut state = lock_or_recover(&state);

        let completion = {
            let pending = state
                .pending()
                .ok_or(HandshakeError::Unexpected("M4 without an exchange awaiting it"))?;
            if pending.negotiation_type != negotiation_type {
                return Err(HandshakeError::Unexpected("M4 negotiation type differs from M3"));
            }

            if !verify_inner_mac(
                &pending.material,
                RESPONDER_LABEL,
                &message.iv,
                &message.ciphertext,
                &message.hmac,
            ) {
                return Err(HandshakeError::Unauthenticated("M4 inner MAC"));
            }

            if let Some(first_seen) = self.authenticators.mark_completed(message.hmac, inbound.now) {
                info!(
                    "duplicate M4 from {} ({:?} after the first)",
                    inbound.source,
                    inbound.now.saturating_duration_since(first_seen)
                );
                return Ok(());
            }

            let plaintext = decrypt_inner(&pending.material, &message.iv, &message.ciphertext);
            let inner = Message4Inner::decode(&plaintext)?;

            let peer_identity = peer.identity();
            let signed = message4_signed_data(
                &pending.jfk_buffer,
                &self.identity,
                inner.tracker_id,
                inner.reused_tracker,
                inner.boot_id,
                &inner.reference,
                &pending.my_reference,
            );
            if !verify_digest(&peer_identity, &inner.signature, &transcript_digest(&signed)) {
                return Err(HandshakeError::Unauthenticated("M4 signature"));
            }

            let scheme =
                self.message_id_scheme(negotiation_type, header.is_anonymous(), Role::Initiator, &peer_identity);
            HandshakeCompletion {
                role: Role::Initiator,
                negotiation_type,
                keys: SessionKeys::for_role(&pending.material, Role::Initiator, scheme),
                peer_boot_id: inner.boot_id,
                peer_reference: inner.reference,
                source: inbound.source,
                tracker_id: inner.tracker_id,
                reused_tracker: inner.reused_tracker,
                setup_type: header.setup_type,
                completed_at: inbound.now,
            }
        };

        state.clear();
        drop(state);

        let tracker_id = completion.tracker_id;
        match peer.complete_handshake(completion) {
            Some(id) if id >= 0 => {
                info!(
                    "handshake with {} complete as initiator (type {}, tracker {})",
                    inbound.source, negotiation_type as u8, tracker_id
                );
                Ok(())
            }
            _ => Err(HandshakeError::CompletionRefused),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_data_layout() {
        let prefix = exchange_prefix(&[1; 8], &[2; 8], b"gi", b"gr");
        assert_eq!(prefix.len(), 20);

        let m3 = message3_signed_data(&prefix, b"R", -1, 7, b"ref");
        assert_eq!(m3.len(), 20 + 1 + 8 + 8 + 3);
        assert_eq!(&m3[21..29], &(-1i64).to_be_bytes());

        let m4 = message4_signed_data(&prefix, b"I", 5, true, 7, b"rr", b"ri");
        assert_eq!(m4[29], 1);
        assert!(m4.ends_with(b"rrri"));
    }

    #[test]
    fn test_inner_seal_and_open() {
        let material = DerivedSessionMaterial::derive(&[4u8; 32], &[1; 8], &[2; 8]);
        let (hmac, iv, ciphertext) = seal_inner(&material, INITIATOR_LABEL, b"inner payload");

        assert!(verify_inner_mac(&material, INITIATOR_LABEL, &iv, &ciphertext, &hmac));
        assert!(!verify_inner_mac(&material, RESPONDER_LABEL, &iv, &ciphertext, &hmac));
        assert_eq!(&decrypt_inner(&material, &iv, &ciphertext)[..], b"inner payload");
    }
}
