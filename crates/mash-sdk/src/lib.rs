//! Ergonomic facade over `mash-core` for conformance-harness action handlers.
//!
//! Mirrors the way `alpine-protocol-sdk` wraps
//! `alpine-protocol-rs::sdk::AlpineClient`: an action-handler crate depends
//! only on [`ConformanceRunner`], never on `mash-core`'s internal types
//! directly. This crate owns no protocol logic of its own -- it threads
//! calls straight through to a [`mash::coordinator::Coordinator`], exposing
//! the upward interface of spec.md §6 as a single ergonomic surface.

use std::sync::Arc;

use mash::coordinator::{CommissioningModeWatcher, Coordinator, CoordinatorError, DeviceStateProbe};
use mash::handlers::{PreconditionFlag, PreconditionSet};
use mash::pase::PaseSessionFactory;
use mash::pool::ConnPool;
use mash::{CryptoState, PaseState, RunnerConfig, SuiteSession, ZoneId, ZoneType};
use tracing::debug;

/// Owns a [`Coordinator`] and exposes precondition setup/teardown plus the
/// idempotent `ensure_*` helpers a test-case driver calls between test cases
/// (spec.md §6 "Upward interface").
pub struct ConformanceRunner {
    coordinator: Coordinator,
}

impl ConformanceRunner {
    pub fn new(
        config: RunnerConfig,
        pase_factory: Arc<dyn PaseSessionFactory>,
        device_state_probe: Option<Arc<dyn DeviceStateProbe>>,
        mode_watcher: Option<Arc<dyn CommissioningModeWatcher>>,
    ) -> Result<Self, CoordinatorError> {
        let coordinator = Coordinator::new(config, pase_factory, device_state_probe, mode_watcher)?;
        Ok(Self { coordinator })
    }

    /// Runs the minimum transition needed to satisfy a test case's declared
    /// preconditions (spec.md §4.6). After this returns, [`Self::current_level`]
    /// is at least the level the preconditions imply.
    pub async fn setup_preconditions(&mut self, preconditions: &PreconditionSet) -> Result<(), CoordinatorError> {
        self.coordinator.setup_preconditions(preconditions).await
    }

    /// Per-test teardown: unsubscribes, clears the notification buffer,
    /// restores the device-state baseline on a best-effort basis, and is
    /// safe to call more than once in a row (spec.md §4.6.7, Property P7).
    pub async fn teardown_test(&mut self) -> Result<(), CoordinatorError> {
        self.coordinator.teardown_test().await
    }

    /// Idempotent: no-op if `main` is already connected at level >= 2.
    pub async fn ensure_connected(&mut self) -> Result<(), CoordinatorError> {
        self.coordinator.ensure_connected().await
    }

    /// Idempotent: no-op if a PASE session is already commissioned.
    pub async fn ensure_commissioned(&mut self, zone_type: ZoneType) -> Result<(), CoordinatorError> {
        self.coordinator.ensure_commissioned(zone_type).await
    }

    /// Commissions the suite zone once per suite, typed `Test` (spec.md §4.8).
    /// Call at suite start before any test case that needs level 3.
    pub async fn ensure_suite_zone(&mut self) -> Result<(), CoordinatorError> {
        self.coordinator.ensure_suite_zone().await
    }

    /// Suite-end teardown: `RemoveZone` on the suite zone, close every other
    /// tracked zone, fully disconnect (spec.md §4.8).
    pub async fn suite_teardown(&mut self) -> Result<(), CoordinatorError> {
        self.coordinator.suite_teardown().await
    }

    /// Current precondition level: 0 (none), 2 (connected), or 3 (commissioned).
    pub fn current_level(&self) -> u8 {
        self.coordinator.current_level()
    }

    pub fn zone_id(&self) -> Option<ZoneId> {
        self.coordinator
            .suite()
            .zone_id()
            .cloned()
            .or_else(|| self.coordinator.pase().session_key().map(ZoneId::derive))
    }

    /// Read access to the working crypto bundle, for handlers that need to
    /// present or inspect the controller's current operational identity.
    pub fn crypto(&self) -> &CryptoState {
        self.coordinator.crypto()
    }

    pub fn pase(&self) -> &PaseState {
        self.coordinator.pase()
    }

    pub fn suite(&self) -> &SuiteSession {
        self.coordinator.suite()
    }

    /// The request/response multiplexer + notification buffer + subscription
    /// registry action handlers route traffic through (spec.md §4.3).
    pub fn pool(&self) -> &ConnPool {
        self.coordinator.pool()
    }

    pub fn pool_mut(&mut self) -> &mut ConnPool {
        self.coordinator.pool_mut()
    }

    /// Convenience wrapper used by handlers that just need the next message
    /// ID before building a request frame themselves (spec.md §6).
    pub fn next_message_id(&self) -> u32 {
        self.coordinator.pool().next_message_id()
    }

    /// Marks that the current test case's handler mutated device state
    /// outside the normal request/response path (e.g. an Invoke with
    /// side effects), informing §4.6.7 baseline enforcement.
    pub fn mark_device_state_modified(&mut self) {
        debug!(target: "mash::sdk", "device state marked modified by handler");
        self.coordinator.mark_device_state_modified();
    }
}

/// Builds a [`PreconditionSet`] from the string keys a YAML test case would
/// declare, per spec.md §4.6.1's mapping table. Unknown keys become
/// [`PreconditionFlag::Simulation`] (level 0, non-inhibiting), matching
/// spec.md §4.6.1's "everything else (simulation flags) -> 0" row; true
/// rejection of genuinely unknown keys is the loader's job (spec.md §1, §9),
/// not this crate's.
pub fn preconditions_from_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> PreconditionSet {
    let mut set = PreconditionSet::new();
    for key in keys {
        set.insert(flag_for_key(key));
    }
    set
}

fn flag_for_key(key: &str) -> PreconditionFlag {
    match key {
        "device_in_commissioning_mode" => PreconditionFlag::DeviceInCommissioningMode,
        "device_uncommissioned" => PreconditionFlag::DeviceUncommissioned,
        "commissioning_window_open" => PreconditionFlag::CommissioningWindowOpen,
        "tls_connection_established" => PreconditionFlag::TlsConnectionEstablished,
        "connection_established" => PreconditionFlag::ConnectionEstablished,
        "device_commissioned" => PreconditionFlag::DeviceCommissioned,
        "session_established" => PreconditionFlag::SessionEstablished,
        "fresh_commission" => PreconditionFlag::FreshCommission,
        "session_previously_connected" => PreconditionFlag::SessionPreviouslyConnected,
        "device_has_grid_zone" => PreconditionFlag::DeviceHasGridZone,
        "device_has_local_zone" => PreconditionFlag::DeviceHasLocalZone,
        "device_reset" => PreconditionFlag::DeviceReset,
        "two_zones_connected" => PreconditionFlag::TwoZonesConnected,
        other => PreconditionFlag::Simulation(Box::leak(other.to_string().into_boxed_str())),
    }
}

/// Re-exported so dependents don't need a direct `mash-core` dependency just
/// to match on pool errors surfaced through request-issuing handlers.
pub use mash::pool::PoolError as RequestError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_map_to_level_zero_simulation_flags() {
        let set = preconditions_from_keys(["fault_injected_reboot"]);
        assert_eq!(set.needed_level(), 0);
        assert!(!set.has_reuse_inhibitor());
    }

    #[test]
    fn known_keys_map_to_the_documented_level() {
        let set = preconditions_from_keys(["device_has_grid_zone"]);
        assert_eq!(set.needed_level(), 3);
        assert!(set.has_reuse_inhibitor());
        assert!(set.requests_multi_zone());
    }

    #[test]
    fn mixed_keys_take_the_maximum_level() {
        let set = preconditions_from_keys(["device_in_commissioning_mode", "session_established"]);
        assert_eq!(set.needed_level(), 3);
    }
}
