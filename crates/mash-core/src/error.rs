//! Error kinds shared across the core (spec.md §7).
//!
//! Each layer defines its own `thiserror` enum (`FramerError`, `ConnectionError`,
//! `PoolError`, `HandshakeError`, `CoordinatorError`, `DialerError`). `MashError`
//! aggregates them for callers that don't need to match on the originating
//! layer, mirroring how `sdk::client::ClientError` aggregates
//! `HandshakeError`/`StreamError` elsewhere in this protocol family.

use thiserror::Error;

use crate::commissioning::HandshakeError;
use crate::connection::ConnectionError;
use crate::coordinator::CoordinatorError;
use crate::dialer::DialerError;
use crate::framer::FramerError;
use crate::pool::PoolError;

/// Coarse classification used to decide retry policy (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket/TLS failure.
    Transport,
    /// Device sent a typed error code; returned as structured output.
    ProtocolReject,
    /// A `ProtocolReject` carrying a parseable remaining duration.
    Cooldown,
    /// `ProtocolReject` with code=busy lacking a cooldown suffix.
    StaleSession,
    /// Timeout/reset/EOF from the network layer.
    Infrastructure,
    /// Decode failure or invariant violation; surfaced immediately.
    Internal,
}

/// Aggregate error type for consumers that don't need per-layer matching.
#[derive(Debug, Error)]
pub enum MashError {
    #[error("framer error: {0}")]
    Framer(#[from] FramerError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("dialer error: {0}")]
    Dialer(#[from] DialerError),
}

impl MashError {
    /// Classifies the error per spec.md §7's error-kind table.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MashError::Framer(_) | MashError::Connection(_) | MashError::Dialer(_) => {
                ErrorKind::Transport
            }
            MashError::Pool(PoolError::TooManyInterleavedFrames) => ErrorKind::Internal,
            MashError::Pool(_) => ErrorKind::Transport,
            MashError::Handshake(HandshakeError::Cooldown(_)) => ErrorKind::Cooldown,
            MashError::Handshake(HandshakeError::StaleSession) => ErrorKind::StaleSession,
            MashError::Handshake(HandshakeError::DeviceRejection(_)) => ErrorKind::ProtocolReject,
            MashError::Handshake(HandshakeError::Infrastructure(_)) => ErrorKind::Infrastructure,
            MashError::Handshake(HandshakeError::Internal(_)) => ErrorKind::Internal,
            MashError::Handshake(HandshakeError::Cancelled) => ErrorKind::Internal,
            MashError::Coordinator(_) => ErrorKind::Internal,
        }
    }
}
