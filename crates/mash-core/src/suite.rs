//! The long-lived suite zone, owned outside [`crate::pool::ConnPool`] so
//! pool-wide cleanups never touch it (spec.md §3 "SuiteSession", §4.4).

use crate::connection::Connection;
use crate::crypto::CryptoState;
use crate::ids::ZoneId;

/// Single writer, many readers (spec.md §4.4). `zone_id = None` means "no
/// suite zone has been commissioned yet" -- the suite-start gate in
/// `mash_core::coordinator` checks this before running commissioning.
pub struct SuiteSession {
    zone_id: Option<ZoneId>,
    crypto: CryptoState,
    conn: Connection,
}

impl SuiteSession {
    pub fn new() -> Self {
        Self {
            zone_id: None,
            crypto: CryptoState::default(),
            conn: Connection::empty(),
        }
    }

    pub fn is_commissioned(&self) -> bool {
        self.zone_id.is_some()
    }

    pub fn zone_id(&self) -> Option<&ZoneId> {
        self.zone_id.as_ref()
    }

    /// `"main-<zone_id>"`, matching the `conn_key` convention ConnPool uses
    /// for its own tracked zones (spec.md §3 "SuiteSession owns: conn_key").
    pub fn conn_key(&self) -> Option<String> {
        self.zone_id.as_ref().map(|id| format!("main-{id}"))
    }

    pub fn crypto(&self) -> &CryptoState {
        &self.crypto
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Establishes or replaces the suite zone's identity and crypto bundle.
    pub fn record(&mut self, zone_id: ZoneId, crypto: CryptoState) {
        self.zone_id = Some(zone_id);
        self.crypto = crypto;
    }

    pub fn set_conn(&mut self, conn: Connection) {
        self.conn = conn;
    }

    /// Takes the live connection, leaving an empty placeholder behind. Used
    /// when the Coordinator promotes the suite zone to `main` for a test
    /// that needs it (spec.md §4.6.4) and must later hand it back.
    pub fn take_conn(&mut self) -> Connection {
        std::mem::replace(&mut self.conn, Connection::empty())
    }

    /// Full reset, used at suite end (spec.md §4.8).
    pub fn clear(&mut self) {
        self.zone_id = None;
        self.crypto = CryptoState::default();
        self.conn = Connection::empty();
    }
}

impl Default for SuiteSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_suite_session_is_not_commissioned() {
        let suite = SuiteSession::new();
        assert!(!suite.is_commissioned());
        assert!(suite.conn_key().is_none());
    }

    #[test]
    fn record_sets_conn_key_and_clear_resets_everything() {
        let mut suite = SuiteSession::new();
        let zone_id = ZoneId::derive(&[3u8; 32]);
        suite.record(zone_id.clone(), CryptoState::default());
        assert!(suite.is_commissioned());
        assert_eq!(suite.conn_key(), Some(format!("main-{zone_id}")));

        suite.clear();
        assert!(!suite.is_commissioned());
        assert!(suite.crypto().is_empty());
    }
}
