//! On-wire message shapes (spec.md §6 "On-wire protocol framing").
//!
//! Every frame shares a header with `message_id` (0 = notification), an
//! opcode, endpoint/feature addressing, and an optional CBOR payload. The
//! byte-level codec itself is a leaf (`crate::framer`); this module only
//! describes the decoded shapes the core inspects.

use serde::{Deserialize, Serialize};

/// Opcode carried on every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    Read,
    Write,
    Subscribe,
    Unsubscribe,
    Invoke,
    Discover,
    CertRenewalRequest,
    CertRenewalCsr,
    CertRenewalInstall,
    CertRenewalAck,
    RemoveZone,
    ResetTestState,
    Notify,
    Error,
}

/// Decoded response/notification header, shared by every frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// 0 means "notification"; otherwise correlates with a prior request.
    pub message_id: u32,
    pub op: OpCode,
    pub endpoint_id: u16,
    pub feature_id: u16,
}

/// A fully decoded response frame (header + optional CBOR payload bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub header: FrameHeader,
    pub payload: Option<Vec<u8>>,
}

/// Structured device-side protocol error, used for `ProtocolReject` (spec.md §7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceError {
    pub code: u32,
    pub message: String,
}

/// PASE error code reserved for "busy" (spec.md §4.5.2).
pub const DEVICE_ERROR_CODE_BUSY: u32 = 5;

/// Envelope combining a header with an already-CBOR-encoded payload, the
/// shape actually carried inside one length-prefixed frame body.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    header: FrameHeader,
    payload: Option<serde_cbor::Value>,
}

/// Default CBOR envelope codec for the message shapes this module owns.
/// The general feature read/write payload codec used by action handlers is
/// out of scope (spec.md §1); this one only needs to round-trip the header
/// and the cert-exchange/readiness-probe structs defined here.
pub fn cbor_encode_envelope<T: Serialize>(header: &FrameHeader, payload: &T) -> Result<Vec<u8>, String> {
    let payload_value = serde_cbor::value::to_value(payload).map_err(|e| e.to_string())?;
    let envelope = WireEnvelope {
        header: header.clone(),
        payload: Some(payload_value),
    };
    serde_cbor::to_vec(&envelope).map_err(|e| e.to_string())
}

pub fn cbor_encode_header_only(header: &FrameHeader) -> Result<Vec<u8>, String> {
    let envelope = WireEnvelope {
        header: header.clone(),
        payload: None,
    };
    serde_cbor::to_vec(&envelope).map_err(|e| e.to_string())
}

/// Decodes a raw frame body into a [`ResponseFrame`], leaving the payload as
/// raw CBOR bytes for the caller to further decode into a concrete type.
pub fn cbor_decode_frame(raw: &[u8]) -> Result<ResponseFrame, String> {
    let envelope: WireEnvelope = serde_cbor::from_slice(raw).map_err(|e| e.to_string())?;
    let payload = match envelope.payload {
        Some(value) => Some(serde_cbor::to_vec(&value).map_err(|e| e.to_string())?),
        None => None,
    };
    Ok(ResponseFrame {
        header: envelope.header,
        payload,
    })
}

/// Decodes a response's payload bytes into a concrete message type.
pub fn cbor_decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, String> {
    serde_cbor::from_slice(payload).map_err(|e| e.to_string())
}

/// Controller -> device: begins certificate renewal/exchange (spec.md §4.5.3 step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRenewalRequest {
    pub nonce: [u8; 32],
}

/// Device -> controller: presents a CSR for signing (spec.md §4.5.3 step 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRenewalCsr {
    pub csr_der: Vec<u8>,
}

/// Controller -> device: installs the signed operational certificate (spec.md §4.5.3 step 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRenewalInstall {
    pub cert_der: Vec<u8>,
    pub sequence: u64,
}

/// Device -> controller: acknowledges installation (spec.md §4.5.3 step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRenewalAck {
    pub status: bool,
    pub active_sequence: u64,
}

/// Controller -> device: best-effort wire unsubscribe for a previously issued
/// subscription ID (spec.md §4.3 "unsubscribe_all(conn)", §4.6.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub subscription_id: u32,
}
