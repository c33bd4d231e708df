//! Error types for the Mercury transport.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::Address;

/// Why a channel declared its remote end dead.
///
/// Carried as a one-byte code in death notifications and passed to
/// [`NubHandler::handle_channel_failure`](crate::NubHandler::handle_channel_failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FailureReason {
    /// A reliable packet went unacknowledged past the resend limit.
    NoAck = 1,
    /// The peer kept sending messages we could not understand.
    ProtocolViolation = 2,
    /// The socket reported the peer unreachable.
    Unreachable = 3,
    /// The owner condemned the channel explicitly.
    Condemned = 4,
}

impl FailureReason {
    /// Numeric reason code used on the wire.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::NoAck => "no acknowledgement",
            FailureReason::ProtocolViolation => "protocol violation",
            FailureReason::Unreachable => "unreachable",
            FailureReason::Condemned => "condemned",
        };
        f.write_str(text)
    }
}

/// Errors that can occur in the Mercury transport.
///
/// `TransportFailure` is permanent for the address it names: callers treat it
/// as a deregistration signal. `Protocol` covers malformed or unexpected
/// payloads, which are dropped without tearing the channel down.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MercuryError {
    /// The remote process stopped acknowledging or became unreachable
    #[error("Transport failure to {addr}: {reason}")]
    TransportFailure { addr: Address, reason: FailureReason },
    /// A datagram or payload could not be decoded or had no handler
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// No reply arrived before the request deadline
    #[error("Request to {0} timed out")]
    Timeout(Address),
    /// Socket level error
    #[error("Network error: {0}")]
    Network(String),
    /// A payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// An encoded message would not fit in one datagram
    #[error("Payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    /// The run loop was started without a bound socket
    #[error("Nub is not bound to a socket")]
    NotBound,
}

impl From<std::io::Error> for MercuryError {
    fn from(err: std::io::Error) -> Self {
        MercuryError::Network(err.to_string())
    }
}

impl MercuryError {
    /// Whether this error means the peer is gone for good.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, MercuryError::TransportFailure { .. })
    }
}
