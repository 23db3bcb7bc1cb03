//! TLS config construction for commissioning and operational modes, and
//! chain verification against the Zone CA pool (spec.md §4.7).
//!
//! Grounded in `mongodb-mongo-rust-driver`'s `runtime::tls_rustls` (rustls
//! `ClientConfig` construction, `dangerous().set_certificate_verifier`) and
//! in `hlieu5402-collab-spark2026`'s `spark-transport-tls` acceptor (modern
//! rustls 0.23 danger-verifier shape).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::warn;

use crate::connection::AsyncDuplex;
use crate::crypto::{fingerprint, CryptoState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneType {
    Grid,
    Local,
    /// Reserved zone type for the suite zone; devices don't count it against
    /// `MaxZones` (spec.md §4.8).
    Test,
}

#[derive(Debug, Error)]
pub enum DialerError {
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid server name for {0}")]
    InvalidServerName(SocketAddr),
    #[error("dial did not succeed after {0} attempts")]
    ExhaustedRetries(u8),
}

/// The two fixed curves commissioning and operational TLS are restricted to
/// (spec.md §4.5.1, §4.5.4).
const ALLOWED_KX_GROUPS: &[rustls::NamedGroup] = &[rustls::NamedGroup::X25519, rustls::NamedGroup::secp256r1];

const COMMISSIONING_ALPN: &[u8] = b"mash-commissioning/1";

/// Builds TLS client configs and performs the dials described in spec.md §4.7.
pub struct Dialer {
    /// `RunnerConfig::insecure_skip_verify` (spec.md §6): when set, the
    /// commissioning verifier accepts the peer certificate without even
    /// checking it parses as well-formed X.509. Never affects the operational
    /// verifier, which always checks the chain against `ZoneCaPool`.
    insecure_skip_verify: bool,
}

impl Dialer {
    pub fn new(insecure_skip_verify: bool) -> Result<Self, DialerError> {
        Ok(Self { insecure_skip_verify })
    }

    /// Opens a TCP+TLS connection using the commissioning profile: TLS 1.3,
    /// fixed ALPN, explicit curve list, peer verification deferred to PASE
    /// (spec.md §4.5.1).
    ///
    /// Also returns the peer's leaf certificate, captured by the accepting
    /// verifier, so a failed cert exchange can fall back to pinning it
    /// (spec.md §4.5.3).
    pub async fn dial_commissioning(
        &self,
        target: SocketAddr,
    ) -> Result<(Box<dyn AsyncDuplex>, CertificateDer<'static>), DialerError> {
        let captured = Arc::new(std::sync::Mutex::new(None));
        let config = build_commissioning_config(captured.clone(), self.insecure_skip_verify)?;
        let tcp = TcpStream::connect(target).await?;
        tcp.set_nodelay(true).ok();
        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::IpAddress(target.ip().into());
        let stream = connector.connect(name, tcp).await?;
        let peer_cert = captured
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DialerError::Tls(rustls::Error::General("no peer certificate observed".into())))?;
        Ok((Box::new(stream), peer_cert))
    }

    /// Redials with the operational profile: presents the controller cert,
    /// verifies the peer chain against `ZoneCAPool` with hostname checking
    /// disabled (peers are identified by device-ID in CN, not DNS). Retries
    /// up to 3 times spaced >=50ms (spec.md §4.5.4).
    pub async fn dial_operational(
        &self,
        target: SocketAddr,
        crypto: &CryptoState,
    ) -> Result<Box<dyn AsyncDuplex>, DialerError> {
        let config = build_operational_config(crypto)?;
        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::IpAddress(target.ip().into());

        let mut last_err = None;
        for attempt in 1..=3u8 {
            match TcpStream::connect(target).await {
                Ok(tcp) => {
                    tcp.set_nodelay(true).ok();
                    match connector.connect(name.clone(), tcp).await {
                        Ok(stream) => return Ok(Box::new(stream)),
                        Err(e) => {
                            warn!(target: "mash::dialer", attempt, error = %e, "operational dial failed");
                            last_err = Some(DialerError::Io(e));
                        }
                    }
                }
                Err(e) => last_err = Some(DialerError::Io(e)),
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Err(last_err.unwrap_or(DialerError::ExhaustedRetries(3)))
    }
}

/// A provider restricted to the two curves the commissioning and operational
/// profiles are fixed to (spec.md §4.5.1, §4.5.4).
fn fixed_curve_provider() -> Arc<rustls::crypto::CryptoProvider> {
    let base = rustls::crypto::ring::default_provider();
    let kx_groups = base
        .kx_groups
        .iter()
        .copied()
        .filter(|group| ALLOWED_KX_GROUPS.contains(&group.name()))
        .collect();
    Arc::new(rustls::crypto::CryptoProvider {
        kx_groups,
        ..base
    })
}

fn build_commissioning_config(
    captured: Arc<std::sync::Mutex<Option<CertificateDer<'static>>>>,
    insecure_skip_verify: bool,
) -> Result<rustls::ClientConfig, DialerError> {
    let mut config = rustls::ClientConfig::builder_with_provider(fixed_curve_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(DialerError::Tls)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyVerifier { captured, insecure_skip_verify }))
        .with_no_client_auth();
    config.alpn_protocols = vec![COMMISSIONING_ALPN.to_vec()];
    Ok(config)
}

fn build_operational_config(crypto: &CryptoState) -> Result<rustls::ClientConfig, DialerError> {
    let verifier = Arc::new(ZonePoolVerifier {
        pool: crypto.zone_ca_pool.clone(),
    });
    let builder = rustls::ClientConfig::builder_with_provider(fixed_curve_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(DialerError::Tls)?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match crypto.controller_cert.as_ref() {
        Some(cert) => builder
            .with_client_auth_cert(
                vec![cert.cert_der.clone()],
                cert.key_der.clone_key(),
            )
            .map_err(DialerError::Tls)?,
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// Commissioning-stage verifier: peer verification is deferred to the PASE
/// step (spec.md §4.5.1), so this accepts anything and lets PASE authenticate
/// the channel. Captures the leaf certificate it observed so a failed cert
/// exchange can later pin it into the trust pool (spec.md §4.5.3).
///
/// `insecure_skip_verify = false` (the default) still rejects a leaf that
/// doesn't even parse as well-formed X.509, since that's cheap to catch here
/// and never defers to PASE for "is this even a certificate"; `true` skips
/// that parse too, for devices whose test rigs present malformed certs.
#[derive(Debug)]
struct AcceptAnyVerifier {
    captured: Arc<std::sync::Mutex<Option<CertificateDer<'static>>>>,
    insecure_skip_verify: bool,
}

impl ServerCertVerifier for AcceptAnyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if !self.insecure_skip_verify {
            x509_parser::parse_x509_certificate(end_entity.as_ref())
                .map_err(|e| rustls::Error::General(format!("commissioning peer certificate is malformed: {e}")))?;
        }
        *self.captured.lock().unwrap() = Some(end_entity.clone().into_owned());
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Operational verifier: checks the peer chain against the accumulated
/// `ZoneCAPool`, never checking hostname (spec.md §4.5.4, §4.7). On failure,
/// logs leaf CN, leaf/issuer fingerprints, and the pool identity to aid
/// multi-zone debugging.
#[derive(Debug)]
struct ZonePoolVerifier {
    pool: crate::crypto::ZoneCaPool,
}

impl ServerCertVerifier for ZonePoolVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let root_store = self.pool.to_root_store();
        let verifier = rustls::client::WebPkiServerVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| rustls::Error::General(e.to_string()))?;

        // Hostname is meaningless here (peers are identified by device-ID in
        // CN, not DNS), so we verify the chain against an arbitrary but fixed
        // name and never surface a name-mismatch failure to the caller.
        let placeholder = ServerName::try_from("mash-operational-peer")
            .expect("static placeholder is a valid DNS name");
        match verifier.verify_server_cert(end_entity, intermediates, &placeholder, &[], now) {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => {
                let leaf_cn = crate::crypto::extract_device_id(end_entity.as_ref())
                    .unwrap_or_else(|_| "<unparseable>".to_string());
                warn!(
                    target: "mash::dialer",
                    leaf_cn,
                    leaf_fp = ?fingerprint(end_entity.as_ref()),
                    pool_size = self.pool.len(),
                    error = %e,
                    "operational chain verification failed"
                );
                Err(e)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_kx_groups_are_the_two_fixed_curves() {
        assert_eq!(ALLOWED_KX_GROUPS.len(), 2);
        assert!(ALLOWED_KX_GROUPS.contains(&rustls::NamedGroup::X25519));
        assert!(ALLOWED_KX_GROUPS.contains(&rustls::NamedGroup::secp256r1));
    }

    #[test]
    fn commissioning_config_builds() {
        let dialer = Dialer::new(false);
        assert!(dialer.is_ok());
        let captured = Arc::new(std::sync::Mutex::new(None));
        assert!(build_commissioning_config(captured, false).is_ok());
    }

    /// spec.md §6: `insecure_skip_verify` never affects the operational
    /// verifier -- it always checks the peer's chain against `ZoneCaPool`,
    /// with no variant that accepts an unparseable or unsigned leaf.
    #[test]
    fn operational_config_ignores_insecure_skip_verify() {
        let crypto = CryptoState::default();
        assert!(build_operational_config(&crypto).is_ok());
    }
}
