//! PASE session state and the leaf handshake trait boundary (spec.md §3 "PASEState", §6).
//!
//! The byte-level SPAKE2+ math is explicitly out of scope (spec.md §1); this
//! module only owns the *state* the core tracks plus the trait boundary a
//! real SPAKE2+ implementation plugs into.

use async_trait::async_trait;

use crate::commissioning::HandshakeError;
use crate::connection::AsyncDuplex;

/// Opaque handle to a live PASE session, owned by whatever implements
/// [`PaseSessionFactory`]. The core never inspects its contents.
pub struct PaseSessionHandle(Box<dyn std::any::Any + Send + Sync>);

impl PaseSessionHandle {
    pub fn new<T: std::any::Any + Send + Sync>(inner: T) -> Self {
        Self(Box::new(inner))
    }

    pub fn downcast_ref<T: std::any::Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Address of the boxed session object itself, not of this handle's
    /// storage slot -- used by [`PaseState::identity_token`] to detect
    /// whether a *different* session was installed, which comparing the
    /// enclosing `Option`'s address (fixed for the Coordinator's lifetime)
    /// could never do.
    fn heap_address(&self) -> usize {
        self.0.as_ref() as *const (dyn std::any::Any + Send + Sync) as *const () as usize
    }
}

impl std::fmt::Debug for PaseSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PaseSessionHandle(..)")
    }
}

/// session handle + derived 32-byte session key + completion flag
/// (spec.md §3 "PASEState"). The zero value means "no session"; `completed =
/// true` with a key present is the only valid "commissioned" state.
#[derive(Default)]
pub struct PaseState {
    handle: Option<PaseSessionHandle>,
    session_key: Option<[u8; 32]>,
    pub completed: bool,
}

impl std::fmt::Debug for PaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaseState")
            .field("has_handle", &self.handle.is_some())
            .field("has_key", &self.session_key.is_some())
            .field("completed", &self.completed)
            .finish()
    }
}

impl PaseState {
    pub fn is_commissioned(&self) -> bool {
        self.completed && self.session_key.is_some()
    }

    pub fn session_key(&self) -> Option<&[u8; 32]> {
        self.session_key.as_ref()
    }

    pub fn set(&mut self, handle: PaseSessionHandle, session_key: [u8; 32]) {
        self.handle = Some(handle);
        self.session_key = Some(session_key);
        self.completed = true;
    }

    /// Full reset, used when a fresh PASEState is needed for rotation
    /// (spec.md §3 invariants: "sessionKey is immutable once set; rotations
    /// go through a fresh PASEState").
    pub fn clear(&mut self) {
        self.handle = None;
        self.session_key = None;
        self.completed = false;
    }

    /// Pointer-identity marker used by the Coordinator's session-reuse gate
    /// (spec.md §4.6.4 condition 5) to detect whether a precondition handler
    /// replaced the PASE identity out from under it. Reads the address of the
    /// boxed session object, not of `self` -- the latter is a fixed field
    /// slot inside the owning `Coordinator` and would report "unchanged"
    /// even after a full re-commission overwrote it in place.
    pub fn identity_token(&self) -> usize {
        self.handle.as_ref().map(PaseSessionHandle::heap_address).unwrap_or(0)
    }
}

/// Leaf trait: runs the opaque SPAKE2+-based handshake over an already-TLS'd
/// stream and returns the derived session key (spec.md §6 "A PASEClientSession
/// factory and a Handshake(ctx, stream) -> key, error").
#[async_trait]
pub trait PaseSessionFactory: Send + Sync {
    async fn handshake(
        &self,
        setup_code: &str,
        stream: &mut dyn AsyncDuplex,
    ) -> Result<([u8; 32], PaseSessionHandle), HandshakeError>;
}
