//! Reasons a handshake packet is dropped.

use std::io;
use std::net::SocketAddr;

use jfk_core::WireError;
use thiserror::Error;

use crate::envelope::EnvelopeError;
use crate::key_agreement::KeyAgreementKind;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("wire format: {0}")]
    Wire(#[from] WireError),

    #[error("envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("malformed: {0}")]
    Malformed(&'static str),

    #[error("authentication failed: {0}")]
    Unauthenticated(&'static str),

    #[error("unexpected message: {0}")]
    Unexpected(&'static str),

    #[error("no {0:?} key-agreement contexts available")]
    NoContexts(KeyAgreementKind),

    #[error("protocol mismatch: {0}")]
    Protocol(String),

    #[error("exponential out of range")]
    InvalidExponential,

    #[error("exponential is not one of ours")]
    UnknownExponential,

    #[error("rekey from {0} throttled")]
    Throttled(SocketAddr),

    #[error("session refused the handshake")]
    CompletionRefused,

    #[error("transport: {0}")]
    Transport(#[from] io::Error),

    #[error("shutting down")]
    ShuttingDown,
}

/// How loudly a drop is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropClass {
    /// Length or field bounds; debug level.
    Malformed,
    /// MAC, signature or exponential checks; rate limited.
    Unauthenticated,
    /// Valid but unexpected in the current state; rate limited.
    Unexpected,
    /// No key-agreement context; warn, loud at most once per interval.
    Exhausted,
    /// Incompatible or buggy peer; error level.
    ProtocolMismatch,
    /// Retired negotiation type; warn level.
    Retired,
    /// Refused by policy (throttle, session); error level.
    Refused,
    /// Local I/O; warn level.
    Local,
}

impl HandshakeError {
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    pub fn class(&self) -> DropClass {
        match self {
            Self::Wire(WireError::TooShort(..) | WireError::BadLength { .. }) => DropClass::Malformed,
            Self::Wire(WireError::RetiredNegotiationType(_)) => DropClass::Retired,
            Self::Wire(_) | Self::Protocol(_) => DropClass::ProtocolMismatch,
            Self::Envelope(EnvelopeError::TooLong(..)) => DropClass::Local,
            Self::Envelope(_) | Self::Malformed(_) => DropClass::Malformed,
            Self::Unauthenticated(_) | Self::InvalidExponential | Self::UnknownExponential => {
                DropClass::Unauthenticated
            }
            Self::Unexpected(_) => DropClass::Unexpected,
            Self::NoContexts(_) => DropClass::Exhausted,
            Self::Throttled(_) | Self::CompletionRefused => DropClass::Refused,
            Self::Transport(_) | Self::ShuttingDown => DropClass::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_errors_split_by_severity() {
        assert_eq!(
            HandshakeError::from(WireError::TooShort(1, 3)).class(),
            DropClass::Malformed
        );
        assert_eq!(
            HandshakeError::from(WireError::UnknownNegotiationType(12)).class(),
            DropClass::ProtocolMismatch
        );
        assert_eq!(
            HandshakeError::from(WireError::RetiredNegotiationType(2)).class(),
            DropClass::Retired
        );
        assert_eq!(
            HandshakeError::from(WireError::UnknownSetupType(7)).class(),
            DropClass::ProtocolMismatch
        );
    }

    #[test]
    fn test_crypto_failures_are_unauthenticated() {
        assert_eq!(
            HandshakeError::Unauthenticated("signature").class(),
            DropClass::Unauthenticated
        );
        assert_eq!(HandshakeError::InvalidExponential.class(), DropClass::Unauthenticated);
        assert_eq!(
            HandshakeError::NoContexts(KeyAgreementKind::Ecdh).class(),
            DropClass::Exhausted
        );
    }
}
