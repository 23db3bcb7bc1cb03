//! One live TLS/TCP attachment with lifecycle state (spec.md §4.2).

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant as TokioInstant;
use tracing::debug;

use crate::framer::{Framer, FramerError};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is not live")]
    NotConnected,
    #[error(transparent)]
    Framer(#[from] FramerError),
}

/// Lifecycle state of a [`Connection`] (spec.md §3 "Connection").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    TlsConnected,
    Operational,
}

/// A boxed, type-erased duplex byte stream -- either a raw TCP socket during
/// early dial stages, or a TLS-wrapped stream once the handshake completes.
/// Commissioning and operational connections may use different concrete TLS
/// stream types, so the framer is generic over this trait object rather than
/// a single stream type.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

/// One live attachment to a peer (spec.md §3 "Connection", §4.2).
///
/// Invariants (spec.md §3):
/// - The framer is `Some` iff `state != Disconnected`.
/// - Transitioning *to* `Disconnected` drops the framer immediately, closing
///   the underlying stream; there is no deferred-release window, since
///   nothing in this crate holds a handle to the framer independent of the
///   `Connection` that owns it.
pub struct Connection {
    state: ConnectionState,
    framer: Option<Framer<Box<dyn AsyncDuplex>>>,
    /// Sticky: set on any transition out of `Disconnected`, cleared only by
    /// explicit teardown (spec.md §3, §4.6.7).
    had_connection: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("had_connection", &self.had_connection)
            .field("framer_present", &self.framer.is_some())
            .finish()
    }
}

impl Connection {
    /// A connection with no live stream (used as the "detached" placeholder
    /// in spec.md §4.6.3's "any -> 1" transition when a suite zone exists).
    pub fn empty() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            framer: None,
            had_connection: false,
        }
    }

    /// Wraps an already-established duplex stream as a freshly connected
    /// attachment at the given state (`TlsConnected` or `Operational`).
    pub fn attach(stream: Box<dyn AsyncDuplex>, state: ConnectionState) -> Self {
        assert_ne!(
            state,
            ConnectionState::Disconnected,
            "attach() requires a connected state"
        );
        Self {
            state,
            framer: Some(Framer::new(stream)),
            had_connection: true,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }

    pub fn had_connection(&self) -> bool {
        self.had_connection
    }

    /// Idempotent state transition (spec.md §4.2).
    ///
    /// Transitioning *to* `Disconnected` drops the framer (closing the
    /// underlying socket layers); transitioning *from* `Disconnected` sets
    /// `had_connection`.
    pub fn transition_to(&mut self, new_state: ConnectionState) {
        if self.state == new_state {
            return;
        }
        if new_state == ConnectionState::Disconnected {
            debug!(target: "mash::connection", from = ?self.state, "closing connection");
            self.framer = None;
        }
        if self.state == ConnectionState::Disconnected && new_state != ConnectionState::Disconnected {
            self.had_connection = true;
        }
        self.state = new_state;
    }

    /// Clears the sticky `had_connection` flag. Only explicit teardown does
    /// this (spec.md §4.6.7, §9 open question resolved in DESIGN.md).
    pub fn clear_had_connection(&mut self) {
        self.had_connection = false;
    }

    pub fn set_read_deadline_from(&mut self, deadline: Option<TokioInstant>) -> Option<TokioInstant> {
        match self.framer.as_mut() {
            Some(framer) => framer.set_read_deadline(deadline),
            None => None,
        }
    }

    pub fn framer_mut(&mut self) -> Result<&mut Framer<Box<dyn AsyncDuplex>>, ConnectionError> {
        self.framer.as_mut().ok_or(ConnectionError::NotConnected)
    }

    /// Raw stream access for protocols that run before framing matters
    /// (the PASE handshake, per spec.md §6's `Handshake(ctx, stream)`).
    pub fn stream_mut(&mut self) -> Result<&mut dyn AsyncDuplex, ConnectionError> {
        let framer = self.framer.as_mut().ok_or(ConnectionError::NotConnected)?;
        Ok(&mut **framer.get_mut())
    }

    /// Write/read failures transition to `Disconnected` *before* returning
    /// the error, so callers that swallow it never observe an inconsistent
    /// `is_connected()` (spec.md §4.2 "Failure semantics").
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        let result = match self.framer.as_mut() {
            Some(framer) => framer.write_frame(payload).await,
            None => return Err(ConnectionError::NotConnected),
        };
        if result.is_err() {
            self.transition_to(ConnectionState::Disconnected);
        }
        Ok(result?)
    }

    pub async fn read_frame(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let result = match self.framer.as_mut() {
            Some(framer) => framer.read_frame().await,
            None => return Err(ConnectionError::NotConnected),
        };
        if result.is_err() {
            self.transition_to(ConnectionState::Disconnected);
        }
        Ok(result?)
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::empty()
    }
}

/// Shared handle to a [`Connection`], matching the pool's need to hand the
/// same live attachment to both the main task and a background notification
/// reader (spec.md §5) while keeping ownership singular.
pub type SharedConnection = Arc<tokio::sync::Mutex<Connection>>;

pub fn shared(conn: Connection) -> SharedConnection {
    Arc::new(tokio::sync::Mutex::new(conn))
}
