//! Crypto material bundle and the additive Zone CA trust pool (spec.md §3 "CryptoState", §4.7).

use std::sync::Arc;

use rcgen::{Certificate as GeneratedCert, CertificateParams, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::dialer::ZoneType;
use crate::ids::ZoneId;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("certificate generation failed: {0}")]
    Generation(String),
    #[error("certificate signing failed: {0}")]
    Signing(String),
    #[error("certificate parse failed: {0}")]
    Parse(String),
}

/// An issued X.509 certificate plus its private key, owned together (spec.md
/// §3 "ZoneCA: certificate + private key for signing").
#[derive(Clone)]
pub struct IssuedCert {
    pub cert_der: CertificateDer<'static>,
    pub key_der: Arc<PrivateKeyDer<'static>>,
}

impl std::fmt::Debug for IssuedCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCert")
            .field("cert_len", &self.cert_der.len())
            .finish()
    }
}

/// An operational certificate with no private key held locally (e.g. the
/// device's own cert after we sign its CSR: spec.md §3 "IssuedDeviceCert").
#[derive(Clone, Debug)]
pub struct PeerCert {
    pub cert_der: CertificateDer<'static>,
}

/// Verification roots. May accumulate multiple zones' CAs (spec.md §3
/// invariants); additive only -- shrunk solely by explicit teardown.
#[derive(Clone, Default)]
pub struct ZoneCaPool {
    certs: Vec<CertificateDer<'static>>,
}

impl std::fmt::Debug for ZoneCaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneCaPool")
            .field("count", &self.certs.len())
            .finish()
    }
}

impl ZoneCaPool {
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// Additive mutation (Property P4): never replaces, only appends, and
    /// skips an already-present cert so repeated commissioning of the same
    /// zone doesn't grow the pool unboundedly.
    pub fn add_cert(&mut self, cert: CertificateDer<'static>) {
        if !self.certs.iter().any(|c| c.as_ref() == cert.as_ref()) {
            self.certs.push(cert);
        }
    }

    pub fn contains(&self, cert: &CertificateDer<'_>) -> bool {
        self.certs.iter().any(|c| c.as_ref() == cert.as_ref())
    }

    pub fn certs(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    /// Builds a `rustls::RootCertStore` snapshot for use by the operational verifier.
    pub fn to_root_store(&self) -> rustls::RootCertStore {
        let mut store = rustls::RootCertStore::empty();
        for cert in &self.certs {
            let _ = store.add(cert.clone());
        }
        store
    }

    /// Clears the pool. Only explicit teardown calls this (spec.md §4.6.5, §4.8).
    pub fn clear(&mut self) {
        self.certs.clear();
    }
}

/// The working crypto bundle the Coordinator owns, or the saved copy
/// [`crate::suite::SuiteSession`] owns -- crossing the boundary is always a
/// structured assignment of the whole bundle (spec.md §5 "Shared-resource policy").
#[derive(Clone, Debug, Default)]
pub struct CryptoState {
    pub zone_ca: Option<IssuedCert>,
    pub controller_cert: Option<IssuedCert>,
    pub zone_ca_pool: ZoneCaPool,
    pub issued_device_cert: Option<PeerCert>,
}

impl CryptoState {
    pub fn is_empty(&self) -> bool {
        self.zone_ca.is_none()
            && self.controller_cert.is_none()
            && self.zone_ca_pool.is_empty()
            && self.issued_device_cert.is_none()
    }

    /// Clears the whole working bundle, including the accumulated
    /// `ZoneCAPool` (spec.md §4.6.5, scenario S3: tearing down with no suite
    /// zone active leaves `ZoneCAPool = ∅`). The suite zone's own saved copy
    /// in [`crate::suite::SuiteSession`] is a separate bundle entirely and is
    /// untouched by this call.
    pub fn clear_working_material(&mut self) {
        self.zone_ca = None;
        self.controller_cert = None;
        self.issued_device_cert = None;
        self.zone_ca_pool.clear();
    }
}

/// Generates a self-signed Zone CA keyed to `(zone_id, zone_type)` (spec.md §4.5.3 step 3).
pub fn generate_zone_ca(zone_id: &ZoneId, zone_type: ZoneType) -> Result<IssuedCert, CryptoError> {
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| CryptoError::Generation(e.to_string()))?;
    params.distinguished_name = {
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(
            rcgen::DnType::CommonName,
            format!("mash-zone-ca-{}-{:?}", zone_id, zone_type),
        );
        dn
    };
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let key_pair = KeyPair::generate().map_err(|e| CryptoError::Generation(e.to_string()))?;
    let cert: GeneratedCert = params
        .self_signed(&key_pair)
        .map_err(|e| CryptoError::Generation(e.to_string()))?;
    Ok(IssuedCert {
        cert_der: cert.der().clone(),
        key_der: Arc::new(PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|e| {
            CryptoError::Generation(e.to_string())
        })?),
    })
}

/// Generates the controller's own operational cert, signed by the Zone CA
/// (spec.md §4.5.3: "A fresh controller operational cert is always generated
/// from the fresh Zone CA").
pub fn generate_controller_operational_cert(
    zone_ca: &IssuedCert,
    controller_id: &str,
) -> Result<IssuedCert, CryptoError> {
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| CryptoError::Generation(e.to_string()))?;
    params.distinguished_name = {
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, controller_id.to_string());
        dn
    };
    let key_pair = KeyPair::generate().map_err(|e| CryptoError::Generation(e.to_string()))?;

    let ca_key = rcgen::KeyPair::from_der_and_sign_algo(
        &rcgen::PrivatePkcs8KeyDer::from(zone_ca.key_der.secret_der().to_vec()),
        &rcgen::PKCS_ECDSA_P256_SHA256,
    )
    .map_err(|e| CryptoError::Signing(e.to_string()))?;
    let ca_params = CertificateParams::from_ca_cert_der(&zone_ca.cert_der)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;

    let cert = params
        .signed_by(&key_pair, &ca_cert, &ca_key)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;

    Ok(IssuedCert {
        cert_der: cert.der().clone(),
        key_der: Arc::new(
            PrivateKeyDer::try_from(key_pair.serialize_der())
                .map_err(|e| CryptoError::Generation(e.to_string()))?,
        ),
    })
}

/// Signs a device-presented CSR with the Zone CA (spec.md §4.5.3 step 3).
pub fn sign_csr(zone_ca: &IssuedCert, csr_der: &[u8]) -> Result<PeerCert, CryptoError> {
    let csr = rcgen::CertificateSigningRequestParams::from_der(csr_der)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    let ca_key = rcgen::KeyPair::from_der_and_sign_algo(
        &rcgen::PrivatePkcs8KeyDer::from(zone_ca.key_der.secret_der().to_vec()),
        &rcgen::PKCS_ECDSA_P256_SHA256,
    )
    .map_err(|e| CryptoError::Signing(e.to_string()))?;
    let ca_params = CertificateParams::from_ca_cert_der(&zone_ca.cert_der)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    let signed = csr
        .signed_by(&ca_cert, &ca_key)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    Ok(PeerCert {
        cert_der: signed.der().clone(),
    })
}

/// Extracts the device ID from a leaf cert's Common Name (spec.md §6 "ExtractDeviceID(cert)").
pub fn extract_device_id(cert_der: &[u8]) -> Result<String, CryptoError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| CryptoError::Parse(e.to_string()))?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| CryptoError::Parse("certificate has no CN".into()))
}

/// First 4 bytes of the SHA-256 digest, used in dialer debug logging (spec.md §4.7).
pub fn fingerprint(cert_der: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(cert_der);
    [digest[0], digest[1], digest[2], digest[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_pool_add_is_additive_and_deduplicating() {
        let mut pool = ZoneCaPool::default();
        let cert = CertificateDer::from(vec![1, 2, 3]);
        pool.add_cert(cert.clone());
        pool.add_cert(cert.clone());
        assert_eq!(pool.len(), 1);
        pool.add_cert(CertificateDer::from(vec![4, 5, 6]));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn fingerprint_is_four_bytes() {
        let fp = fingerprint(b"some certificate bytes");
        assert_eq!(fp.len(), 4);
    }

    /// Property P4: the pool after a second zone's commissioning contains
    /// every CA the first zone contributed, plus the new one -- additive,
    /// never substituted.
    #[test]
    fn zone_ca_pool_is_additive_across_successive_zone_commissions() {
        let mut pool = ZoneCaPool::default();
        let zone_a_ca = CertificateDer::from(vec![0xA, 0xA, 0xA]);
        pool.add_cert(zone_a_ca.clone());

        let zone_b_ca = CertificateDer::from(vec![0xB, 0xB, 0xB]);
        pool.add_cert(zone_b_ca.clone());

        assert!(pool.contains(&zone_a_ca), "zone A's CA must survive zone B's commissioning");
        assert!(pool.contains(&zone_b_ca));
        assert_eq!(pool.len(), 2);
    }

    /// Scenario S3: tearing down working material with no suite zone active
    /// must leave `ZoneCAPool = ∅`, not just the single-cert fields.
    #[test]
    fn clear_working_material_also_empties_the_zone_ca_pool() {
        let mut crypto = CryptoState::default();
        crypto.zone_ca_pool.add_cert(CertificateDer::from(vec![9, 9, 9]));
        crypto.clear_working_material();
        assert!(crypto.zone_ca_pool.is_empty());
        assert!(crypto.is_empty());
    }
}
