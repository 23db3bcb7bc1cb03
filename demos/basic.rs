//! Standalone usage sketch for `mash-sdk`, not a workspace member or test.
//!
//! Shows the shape an action-handler engine would drive: build a
//! `ConformanceRunner`, set up a test case's declared preconditions, issue a
//! request through the pool, then tear down. Replace `StubPaseFactory` with
//! a real SPAKE2+ implementation and set `target` to run against a device.

use std::sync::Arc;

use async_trait::async_trait;
use mash::connection::AsyncDuplex;
use mash::pase::{PaseSessionFactory, PaseSessionHandle};
use mash::{commissioning::HandshakeError, RunnerConfig};
use mash_sdk::{preconditions_from_keys, ConformanceRunner};

struct StubPaseFactory;

#[async_trait]
impl PaseSessionFactory for StubPaseFactory {
    async fn handshake(
        &self,
        _setup_code: &str,
        _stream: &mut dyn AsyncDuplex,
    ) -> Result<([u8; 32], PaseSessionHandle), HandshakeError> {
        // A real implementation runs SPAKE2+ here. This sketch has no device
        // to talk to, so it always fails -- swap in a real factory and a
        // `target` address to commission an actual device.
        Err(HandshakeError::Infrastructure(
            "no device reachable in this sketch".into(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = RunnerConfig::offline("00112233");
    let mut runner = ConformanceRunner::new(config, Arc::new(StubPaseFactory), None, None)?;

    // A YAML test case might declare `preconditions: [session_established]`.
    let preconditions = preconditions_from_keys(["session_established"]);
    match runner.setup_preconditions(&preconditions).await {
        Ok(()) => println!("level now {}", runner.current_level()),
        Err(e) => println!("setup failed (expected with no real device): {e}"),
    }

    runner.teardown_test().await?;
    Ok(())
}
