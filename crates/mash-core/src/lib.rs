//! Connection/session lifecycle core for the MASH conformance test harness.
//!
//! This crate implements the hard core of the harness runner: a three-phase
//! commissioning state machine (commissioning TLS -> PASE -> certificate
//! exchange -> operational mTLS), a request/response multiplexer with
//! notification demultiplexing, a precondition planner that walks between
//! implicit session "levels", and a multi-zone connection pool with explicit
//! ownership of a long-lived suite zone.
//!
//! It does not load YAML test cases, check expectations, implement action
//! handler bodies, or implement the byte-level SPAKE2+ math / CBOR codec /
//! wire frame format -- those are leaves this crate calls through traits.

pub mod commissioning;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod crypto;
pub mod dialer;
pub mod error;
pub mod framer;
pub mod handlers;
pub mod ids;
pub mod messages;
pub mod pase;
pub mod pool;
pub mod suite;

pub use commissioning::{CommissioningFsm, CommissioningInputs, CommissioningState};
pub use config::RunnerConfig;
pub use connection::{Connection, ConnectionState};
pub use coordinator::{CommissioningModeWatcher, Coordinator, CoordinatorError, DeviceStateProbe};
pub use crypto::CryptoState;
pub use dialer::{Dialer, ZoneType};
pub use error::{ErrorKind, MashError};
pub use ids::ZoneId;
pub use pase::PaseState;
pub use pool::ConnPool;
pub use suite::SuiteSession;
