//! Drives a single device from uncommissioned to operational (spec.md §4.5).
//!
//! ```text
//!        ┌──(timeout/IO)──► Failed
//! Idle ──► Dialing ──► TlsUp ──► PaseInProgress ──► PaseDone ──► CertExchange ──► OperationalHandover ──► Operational
//!          │              │           │                            │                    │
//!          └──cooldown────┤           │                    (device closes here)         │
//!                         └──busy─────┘                                                 │
//!                                               ◄─── readiness probe ──────────────────┘
//! ```

mod cooldown;

pub use cooldown::{cooldown_remaining, extract_cooldown_duration};

use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use rustls_pki_types::CertificateDer;
use thiserror::Error;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionError, ConnectionState};
use crate::crypto::{self, CryptoError, CryptoState};
use crate::dialer::{Dialer, DialerError, ZoneType};
use crate::ids::ZoneId;
use crate::messages::{
    cbor_decode_frame, cbor_decode_payload, cbor_encode_envelope, CertRenewalAck, CertRenewalCsr,
    CertRenewalInstall, CertRenewalRequest, DeviceError, FrameHeader, OpCode, DEVICE_ERROR_CODE_BUSY,
};
use crate::pase::{PaseSessionFactory, PaseState};

/// Infrastructure retries before the FSM surfaces the failure (spec.md §4.5.2).
const INFRASTRUCTURE_RETRIES: u8 = 2;
const INFRASTRUCTURE_RETRY_SPACING: Duration = Duration::from_secs(1);
const STALE_SESSION_SLEEP: Duration = Duration::from_millis(500);
const READINESS_PROBE_FEATURE_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissioningState {
    Idle,
    Dialing,
    TlsUp,
    PaseInProgress,
    PaseDone,
    CertExchange,
    OperationalHandover,
    Operational,
    Failed,
}

/// Failure classification the PASE step (and the FSM itself) returns
/// (spec.md §4.5.2, §7). Exactly these six variants -- [`crate::error::MashError`]
/// matches on each individually.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("device cooldown, {0:?} remaining")]
    Cooldown(Duration),
    #[error("stale session (busy without a cooldown marker)")]
    StaleSession,
    #[error("device rejected the operation: {0:?}")]
    DeviceRejection(crate::messages::DeviceError),
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<ConnectionError> for HandshakeError {
    fn from(e: ConnectionError) -> Self {
        HandshakeError::Infrastructure(e.to_string())
    }
}

impl From<DialerError> for HandshakeError {
    fn from(e: DialerError) -> Self {
        HandshakeError::Infrastructure(e.to_string())
    }
}

impl From<CryptoError> for HandshakeError {
    fn from(e: CryptoError) -> Self {
        HandshakeError::Internal(e.to_string())
    }
}

/// Result of classifying a raw [`DeviceError`] the leaf surfaced, per spec.md
/// §4.5.2's failure-classification table.
enum PaseRejectionClass {
    Cooldown(Duration),
    StaleSession,
    Rejection,
}

/// Classifies a device's rejection per spec.md §4.5.2: a `cooldown active
/// (<dur> remaining)` marker in the error text means `Cooldown`; error code 5
/// (busy) with no such marker means `StaleSession`; anything else is a plain
/// `Rejection` the FSM does not retry.
fn classify_device_rejection(err: &DeviceError) -> PaseRejectionClass {
    if cooldown::extract_cooldown_duration(&err.message).is_some() {
        PaseRejectionClass::Cooldown(cooldown::cooldown_remaining(&err.message))
    } else if err.code == DEVICE_ERROR_CODE_BUSY {
        PaseRejectionClass::StaleSession
    } else {
        PaseRejectionClass::Rejection
    }
}

/// Per-invocation inputs (spec.md §4.5 "Inputs").
pub struct CommissioningInputs {
    pub target: SocketAddr,
    pub setup_code: String,
    pub zone_type: ZoneType,
    pub controller_id: String,
    /// Reused if already connected and commissioning has not completed on it
    /// (spec.md §4.5.1); `None` dials fresh.
    pub existing_connection: Option<Connection>,
    /// If a suite zone (or a prior zone in this session) already has a Zone
    /// CA for this `(zone_id, zone_type)`, callers may supply it so
    /// `CertExchange` reuses rather than regenerates it (spec.md §4.5.3
    /// "generates (or reuses)").
    pub reusable_zone_ca: Option<crypto::IssuedCert>,
    /// `RunnerConfig::timeout`, the deadline applied to the readiness probe
    /// that closes out the handover (spec.md §4.5.4 step 4, §6).
    pub timeout: Duration,
}

pub struct CommissioningOutcome {
    pub connection: Connection,
    pub conn_key: String,
    pub zone_id: ZoneId,
    pub crypto: CryptoState,
    pub pase: PaseState,
    /// Notification frames observed and buffered during the readiness probe
    /// (spec.md §4.5.4 step 4) -- pushed into the pool's notification queue
    /// by the caller once this connection is registered.
    pub buffered_notifications: Vec<Vec<u8>>,
}

pub struct CommissioningFsm<'a> {
    dialer: &'a Dialer,
    pase_factory: &'a dyn PaseSessionFactory,
}

impl<'a> CommissioningFsm<'a> {
    pub fn new(dialer: &'a Dialer, pase_factory: &'a dyn PaseSessionFactory) -> Self {
        Self {
            dialer,
            pase_factory,
        }
    }

    pub async fn run(
        &self,
        inputs: CommissioningInputs,
    ) -> Result<CommissioningOutcome, HandshakeError> {
        let mut state = CommissioningState::Idle;
        let mut inputs = inputs;
        let (mut conn, mut peer_cert) = self.dial_or_reuse(&mut inputs, &mut state).await?;

        state = CommissioningState::PaseInProgress;
        let (session_key, handle) = self
            .run_pase_with_retries(&mut conn, &mut peer_cert, &inputs)
            .await?;
        state = CommissioningState::PaseDone;
        debug!(target: "mash::commissioning", ?state, "pase complete");

        let zone_id = ZoneId::derive(&session_key);
        let mut pase = PaseState::default();
        pase.set(handle, session_key);

        state = CommissioningState::CertExchange;
        let crypto = match self
            .cert_exchange(&mut conn, &zone_id, inputs.zone_type, &inputs)
            .await
        {
            Ok(crypto) => crypto,
            Err(e) => {
                warn!(
                    target: "mash::commissioning",
                    error = %e,
                    "cert exchange failed, falling back to pinning the commissioning peer cert"
                );
                self.pin_commissioning_peer(peer_cert)?
            }
        };

        state = CommissioningState::OperationalHandover;
        conn.transition_to(ConnectionState::Disconnected);
        let (op_conn, buffered_notifications) = self
            .operational_handover(inputs.target, &crypto, inputs.timeout)
            .await?;
        state = CommissioningState::Operational;
        debug!(target: "mash::commissioning", ?state, zone_id = %zone_id, "commissioning complete");

        Ok(CommissioningOutcome {
            connection: op_conn,
            conn_key: format!("main-{zone_id}"),
            zone_id,
            crypto,
            pase,
            buffered_notifications,
        })
    }

    /// Reuses a caller-supplied connection iff it is still live; otherwise
    /// dials fresh commissioning TLS (spec.md §4.5.1). Returns the peer
    /// certificate observed on a fresh dial, if any, for the cert-exchange
    /// fallback of spec.md §4.5.3.
    async fn dial_or_reuse(
        &self,
        inputs: &mut CommissioningInputs,
        state: &mut CommissioningState,
    ) -> Result<(Connection, Option<CertificateDer<'static>>), HandshakeError> {
        if let Some(conn) = inputs.existing_connection.take() {
            if conn.is_connected() {
                *state = CommissioningState::TlsUp;
                return Ok((conn, None));
            }
        }
        *state = CommissioningState::Dialing;
        let (stream, peer_cert) = self.dialer.dial_commissioning(inputs.target).await?;
        *state = CommissioningState::TlsUp;
        Ok((Connection::attach(stream, ConnectionState::TlsConnected), Some(peer_cert)))
    }

    /// The PASE retry policy of spec.md §4.5.2. The leaf (`PaseSessionFactory`)
    /// only ever reports a raw [`HandshakeError::DeviceRejection`] carrying the
    /// device's error code/text as-is; classifying that text into Cooldown vs.
    /// StaleSession is this FSM's own job, via `cooldown::cooldown_remaining`/
    /// `extract_cooldown_duration` -- "parsing this substring is part of the
    /// contract with the commissioning library" (spec.md §4.5.2 line 299).
    /// Reconnects always redial fresh -- the commissioning connection is
    /// single-use per PASE attempt -- and update `peer_cert` to the most
    /// recently observed one.
    async fn run_pase_with_retries(
        &self,
        conn: &mut Connection,
        peer_cert: &mut Option<CertificateDer<'static>>,
        inputs: &CommissioningInputs,
    ) -> Result<([u8; 32], crate::pase::PaseSessionHandle), HandshakeError> {
        let mut cooldown_used = false;
        let mut stale_used = false;
        let mut infra_attempts = 0u8;

        loop {
            let stream = conn.stream_mut()?;
            let attempt = self.pase_factory.handshake(&inputs.setup_code, stream).await;
            match attempt {
                Ok(result) => return Ok(result),
                Err(HandshakeError::DeviceRejection(device_err)) => {
                    match classify_device_rejection(&device_err) {
                        PaseRejectionClass::Cooldown(wait) if !cooldown_used => {
                            cooldown_used = true;
                            debug!(target: "mash::commissioning", wait_ms = wait.as_millis() as u64, "cooldown, retrying once");
                            tokio::time::sleep(wait).await;
                            let (new_conn, cert) = self.redial_commissioning(inputs.target).await?;
                            *conn = new_conn;
                            *peer_cert = cert;
                        }
                        PaseRejectionClass::Cooldown(_) => return Err(HandshakeError::Cooldown(cooldown::cooldown_remaining(&device_err.message))),
                        PaseRejectionClass::StaleSession if !stale_used => {
                            stale_used = true;
                            tokio::time::sleep(STALE_SESSION_SLEEP).await;
                            let (new_conn, cert) = self.redial_commissioning(inputs.target).await?;
                            *conn = new_conn;
                            *peer_cert = cert;
                        }
                        PaseRejectionClass::StaleSession => return Err(HandshakeError::StaleSession),
                        PaseRejectionClass::Rejection => return Err(HandshakeError::DeviceRejection(device_err)),
                    }
                }
                Err(HandshakeError::Infrastructure(msg)) if infra_attempts < INFRASTRUCTURE_RETRIES => {
                    infra_attempts += 1;
                    warn!(
                        target: "mash::commissioning",
                        attempt = infra_attempts,
                        error = msg,
                        "infrastructure failure during pase, retrying"
                    );
                    tokio::time::sleep(INFRASTRUCTURE_RETRY_SPACING).await;
                    let (new_conn, cert) = self.redial_commissioning(inputs.target).await?;
                    *conn = new_conn;
                    *peer_cert = cert;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn redial_commissioning(
        &self,
        target: SocketAddr,
    ) -> Result<(Connection, Option<CertificateDer<'static>>), HandshakeError> {
        let (stream, peer_cert) = self.dialer.dial_commissioning(target).await?;
        Ok((Connection::attach(stream, ConnectionState::TlsConnected), Some(peer_cert)))
    }

    /// Four-message cert exchange (spec.md §4.5.3).
    async fn cert_exchange(
        &self,
        conn: &mut Connection,
        zone_id: &ZoneId,
        zone_type: ZoneType,
        inputs: &CommissioningInputs,
    ) -> Result<CryptoState, HandshakeError> {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        let request_header = FrameHeader {
            message_id: 1,
            op: OpCode::CertRenewalRequest,
            endpoint_id: 0,
            feature_id: 0,
        };
        let request_bytes = cbor_encode_envelope(&request_header, &CertRenewalRequest { nonce })
            .map_err(HandshakeError::Internal)?;
        conn.write_frame(&request_bytes).await?;

        let csr_raw = conn.read_frame().await?;
        let csr_frame = cbor_decode_frame(&csr_raw).map_err(HandshakeError::Internal)?;
        let csr: CertRenewalCsr = cbor_decode_payload(
            csr_frame.payload.as_deref().unwrap_or_default(),
        )
        .map_err(HandshakeError::Internal)?;

        let zone_ca = match inputs.reusable_zone_ca.clone() {
            Some(existing) => existing,
            None => crypto::generate_zone_ca(zone_id, zone_type)?,
        };
        let issued_device_cert = crypto::sign_csr(&zone_ca, &csr.csr_der)?;
        let controller_cert =
            crypto::generate_controller_operational_cert(&zone_ca, &inputs.controller_id)?;

        let install_header = FrameHeader {
            message_id: 2,
            op: OpCode::CertRenewalInstall,
            endpoint_id: 0,
            feature_id: 0,
        };
        let install_bytes = cbor_encode_envelope(
            &install_header,
            &CertRenewalInstall {
                cert_der: issued_device_cert.cert_der.to_vec(),
                sequence: 1,
            },
        )
        .map_err(HandshakeError::Internal)?;
        conn.write_frame(&install_bytes).await?;

        let ack_raw = conn.read_frame().await?;
        let ack_frame = cbor_decode_frame(&ack_raw).map_err(HandshakeError::Internal)?;
        let ack: CertRenewalAck = cbor_decode_payload(ack_frame.payload.as_deref().unwrap_or_default())
            .map_err(HandshakeError::Internal)?;
        if !ack.status {
            return Err(HandshakeError::Internal(format!(
                "device rejected cert install at sequence {}",
                ack.active_sequence
            )));
        }

        let mut zone_ca_pool = crate::crypto::ZoneCaPool::default();
        // Accumulated, never substituted (Property P4).
        zone_ca_pool.add_cert(zone_ca.cert_der.clone());

        Ok(CryptoState {
            zone_ca: Some(zone_ca),
            controller_cert: Some(controller_cert),
            zone_ca_pool,
            issued_device_cert: Some(issued_device_cert),
        })
    }

    /// Fallback of spec.md §4.5.3: pin the commissioning peer cert into the
    /// pool so transport-only tests still succeed without true operational auth.
    fn pin_commissioning_peer(
        &self,
        peer_cert: Option<CertificateDer<'static>>,
    ) -> Result<CryptoState, HandshakeError> {
        let peer_cert = peer_cert.ok_or_else(|| {
            HandshakeError::Internal(
                "cert exchange failed and no commissioning peer cert was retained for pinning".into(),
            )
        })?;
        let mut zone_ca_pool = crate::crypto::ZoneCaPool::default();
        zone_ca_pool.add_cert(peer_cert);
        Ok(CryptoState {
            zone_ca: None,
            controller_cert: None,
            zone_ca_pool,
            issued_device_cert: None,
        })
    }

    /// Redials with the operational TLS profile and runs the readiness probe
    /// (spec.md §4.5.4).
    async fn operational_handover(
        &self,
        target: SocketAddr,
        crypto: &CryptoState,
        timeout: Duration,
    ) -> Result<(Connection, Vec<Vec<u8>>), HandshakeError> {
        // The retry count/spacing for the operational redial live in
        // `Dialer::dial_operational` itself (spec.md §4.5.4 step 3).
        let stream = self.dialer.dial_operational(target, crypto).await?;
        let mut conn = Connection::attach(stream, ConnectionState::Operational);
        let buffered = self.readiness_probe(&mut conn, timeout).await?;
        Ok((conn, buffered))
    }

    /// Sends a Subscribe to a well-known feature and waits up to `timeout`
    /// (`RunnerConfig::timeout`, spec.md §6) for a matching response,
    /// buffering any notifications encountered rather than discarding them
    /// (spec.md §4.5.4 step 4).
    async fn readiness_probe(&self, conn: &mut Connection, timeout: Duration) -> Result<Vec<Vec<u8>>, HandshakeError> {
        const PROBE_MESSAGE_ID: u32 = u32::MAX;
        let header = FrameHeader {
            message_id: PROBE_MESSAGE_ID,
            op: OpCode::Subscribe,
            endpoint_id: 0,
            feature_id: READINESS_PROBE_FEATURE_ID,
        };
        let probe_bytes =
            crate::messages::cbor_encode_header_only(&header).map_err(HandshakeError::Internal)?;
        conn.write_frame(&probe_bytes).await?;

        let deadline = TokioInstant::now() + timeout;
        let previous = conn.set_read_deadline_from(Some(deadline));
        let mut buffered = Vec::new();
        let result = loop {
            match conn.read_frame().await {
                Ok(raw) => {
                    let frame = match cbor_decode_frame(&raw) {
                        Ok(frame) => frame,
                        Err(e) => break Err(HandshakeError::Internal(e)),
                    };
                    if frame.header.message_id == 0 {
                        buffered.push(raw);
                        continue;
                    }
                    if frame.header.message_id != PROBE_MESSAGE_ID {
                        continue;
                    }
                    break Ok(());
                }
                Err(e) => break Err(HandshakeError::from(e)),
            }
        };
        conn.set_read_deadline_from(previous);
        result.map(|_| buffered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_error_maps_transport_failures_to_infrastructure() {
        let err: HandshakeError = ConnectionError::NotConnected.into();
        assert!(matches!(err, HandshakeError::Infrastructure(_)));
    }

    struct NoopPase;
    #[async_trait::async_trait]
    impl PaseSessionFactory for NoopPase {
        async fn handshake(
            &self,
            _setup_code: &str,
            _stream: &mut dyn crate::connection::AsyncDuplex,
        ) -> Result<([u8; 32], crate::pase::PaseSessionHandle), HandshakeError> {
            Err(HandshakeError::Internal("not exercised by this test".into()))
        }
    }

    fn device_csr_der() -> Vec<u8> {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![]).unwrap();
        params.serialize_request(&key_pair).unwrap().der().to_vec()
    }

    /// Spawns a fake device that completes exactly one four-message cert
    /// exchange (spec.md §4.5.3) and hands back the controller side of the duplex.
    fn spawn_cert_exchange_device() -> Connection {
        let (controller_side, device_side) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            let mut framer = crate::framer::Framer::new(device_side);
            let _request_raw = framer.read_frame().await.unwrap();

            let csr_header = FrameHeader {
                message_id: 1,
                op: OpCode::CertRenewalCsr,
                endpoint_id: 0,
                feature_id: 0,
            };
            let csr_bytes = cbor_encode_envelope(&csr_header, &CertRenewalCsr { csr_der: device_csr_der() }).unwrap();
            framer.write_frame(&csr_bytes).await.unwrap();

            let _install_raw = framer.read_frame().await.unwrap();
            let ack_header = FrameHeader {
                message_id: 2,
                op: OpCode::CertRenewalAck,
                endpoint_id: 0,
                feature_id: 0,
            };
            let ack_bytes = cbor_encode_envelope(&ack_header, &CertRenewalAck { status: true, active_sequence: 1 }).unwrap();
            framer.write_frame(&ack_bytes).await.unwrap();
        });
        Connection::attach(Box::new(controller_side), ConnectionState::TlsConnected)
    }

    /// With no `reusable_zone_ca` supplied, `cert_exchange` always generates a
    /// fresh Zone CA keyed to the new zone rather than leaving crypto empty.
    #[tokio::test]
    async fn cert_exchange_generates_a_fresh_zone_ca_when_none_is_reusable() {
        let dialer = Dialer::new(false).unwrap();
        let fsm = CommissioningFsm::new(&dialer, &NoopPase);
        let mut conn = spawn_cert_exchange_device();
        let zone_id = ZoneId::derive(&[7u8; 32]);
        let inputs = CommissioningInputs {
            target: "127.0.0.1:1".parse().unwrap(),
            setup_code: "00112233".into(),
            zone_type: ZoneType::Local,
            controller_id: "controller-under-test".into(),
            existing_connection: None,
            reusable_zone_ca: None,
            timeout: Duration::from_secs(10),
        };

        let crypto = fsm.cert_exchange(&mut conn, &zone_id, ZoneType::Local, &inputs).await.unwrap();
        assert!(crypto.zone_ca.is_some());
        assert_eq!(crypto.zone_ca_pool.len(), 1);
    }

    /// A supplied `reusable_zone_ca` is installed verbatim rather than a fresh
    /// one being generated (spec.md §4.5.3 "generates (or reuses)").
    #[tokio::test]
    async fn cert_exchange_reuses_a_supplied_zone_ca_instead_of_generating_one() {
        let dialer = Dialer::new(false).unwrap();
        let fsm = CommissioningFsm::new(&dialer, &NoopPase);
        let mut conn = spawn_cert_exchange_device();
        let zone_id = ZoneId::derive(&[8u8; 32]);
        let existing = crypto::generate_zone_ca(&zone_id, ZoneType::Test).unwrap();
        let existing_der = existing.cert_der.clone();
        let inputs = CommissioningInputs {
            target: "127.0.0.1:1".parse().unwrap(),
            setup_code: "00112233".into(),
            zone_type: ZoneType::Test,
            controller_id: "controller-under-test".into(),
            existing_connection: None,
            reusable_zone_ca: Some(existing),
            timeout: Duration::from_secs(10),
        };

        let crypto_out = fsm.cert_exchange(&mut conn, &zone_id, ZoneType::Test, &inputs).await.unwrap();
        assert_eq!(crypto_out.zone_ca.unwrap().cert_der.as_ref(), existing_der.as_ref());
    }

    /// spec.md §4.5.2's classification table: a cooldown marker in the error
    /// text is `Cooldown`, regardless of the error code.
    #[test]
    fn classifies_a_cooldown_marker_even_without_the_busy_code() {
        let err = DeviceError { code: 0, message: "cooldown active (300ms remaining)".into() };
        match classify_device_rejection(&err) {
            PaseRejectionClass::Cooldown(wait) => assert_eq!(wait, Duration::from_millis(500)),
            _ => panic!("expected Cooldown"),
        }
    }

    /// Code 5 (busy) with no cooldown marker is `StaleSession`, per the same table.
    #[test]
    fn classifies_busy_without_a_marker_as_stale_session() {
        let err = DeviceError { code: DEVICE_ERROR_CODE_BUSY, message: "busy, try again".into() };
        assert!(matches!(classify_device_rejection(&err), PaseRejectionClass::StaleSession));
    }

    /// Any other code/text combination is a plain rejection, not retried.
    #[test]
    fn classifies_anything_else_as_a_plain_rejection() {
        let err = DeviceError { code: 42, message: "unsupported operation".into() };
        assert!(matches!(classify_device_rejection(&err), PaseRejectionClass::Rejection));
    }
}
