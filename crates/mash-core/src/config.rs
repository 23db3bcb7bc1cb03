//! Runner configuration surface (spec.md §6, "CLI/env surface").
//!
//! Parsing of CLI flags or config files is out of scope (spec.md §1); this
//! struct is populated by the embedding CLI/loader and passed straight into
//! the core, the same way `AlpineClient::connect` elsewhere in this protocol
//! family takes a pre-built `DeviceIdentity`/`CapabilitySet` rather than
//! parsing flags itself.

use std::net::SocketAddr;
use std::time::Duration;

/// The only CLI/env-derived fields that affect the core.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Address of the device or controller under test. `None` for stub/offline runs.
    pub target: Option<SocketAddr>,
    /// PASE setup code used to authenticate the commissioning handshake.
    pub setup_code: String,
    /// Operating mode label. Carried through from the CLI/env surface for the
    /// embedding harness's own dispatch; this crate's core state machines have
    /// no mode-dependent branches (see DESIGN.md Non-goals).
    pub mode: String,
    /// Default timeout applied to request/response and handshake operations.
    pub timeout: Duration,
    /// Disables peer-certificate verification on commissioning TLS (never on operational mTLS).
    pub insecure_skip_verify: bool,
    /// Enable key used to authorize device-state queries for baseline enforcement (spec.md §4.6.7).
    pub enable_key: Option<String>,
    /// Whether PICS (protocol implementation conformance statements) is inferred automatically.
    /// PICS inference is a test-selection concern in the embedding harness, not
    /// a core runner behavior; this crate only stores the flag (see DESIGN.md Non-goals).
    pub auto_pics: bool,
    /// Common Name the controller presents on its own operational certificate
    /// (spec.md §4.5.3 "GenerateControllerOperationalCert(zoneCA, controller_id)").
    pub controller_id: String,
}

impl RunnerConfig {
    /// Builds a config for stub/offline runs: no target, defaults elsewhere.
    pub fn offline(setup_code: impl Into<String>) -> Self {
        Self {
            target: None,
            setup_code: setup_code.into(),
            mode: "default".to_string(),
            timeout: Duration::from_secs(10),
            insecure_skip_verify: false,
            enable_key: None,
            auto_pics: false,
            controller_id: "mash-conformance-runner".to_string(),
        }
    }

    /// Whether the runner has enough information to issue device-state queries
    /// for baseline capture/enforcement (spec.md §4.6.7).
    pub fn can_query_device_state(&self) -> bool {
        self.target.is_some() && self.enable_key.is_some()
    }
}
