//! Main + zone-keyed connection map, msgID counter, request multiplexer,
//! notification buffer, subscription registry (spec.md §4.3).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use thiserror::Error;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionError, ConnectionState};
use crate::ids::ZoneId;
use crate::messages::{FrameHeader, ResponseFrame};

/// Bound on interleaved non-matching frames per `send_request` call
/// (spec.md §4.3.1). A safety ceiling, not a protocol-mandated value;
/// implementations keep it configurable but default to 20.
pub const DEFAULT_MAX_INTERLEAVED_FRAMES: u32 = 20;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("response header decode failed: {0}")]
    Decode(String),
    #[error("too many interleaved frames")]
    TooManyInterleavedFrames,
    #[error("no connection tracked under zone key {0:?}")]
    UnknownZone(String),
}

/// A tracked zone connection (spec.md §3 "ConnPool.zones").
pub struct ZoneEntry {
    pub conn: Connection,
    pub zone_id: ZoneId,
}

/// Decodes a raw frame into header + payload. This is the boundary with the
/// byte-level CBOR codec, which is a leaf (spec.md §1); callers supply the
/// decode function so this crate never depends on a concrete wire codec.
pub type DecodeFn = fn(&[u8]) -> Result<ResponseFrame, String>;

/// Per-zone close hook invoked before the TCP close during cleanup, given the
/// zone's own live connection so it can write a protocol-level `RemoveZone`
/// onto it before the socket goes away (spec.md §4.3.2).
pub type CloseHook<'a> = dyn FnMut(&str, &mut Connection) + 'a;

pub struct ConnPool {
    main: Connection,
    zones: Mutex<HashMap<String, ZoneEntry>>,
    message_id: AtomicU32,
    subscriptions: Mutex<Vec<u32>>,
    pending_notifications: Mutex<VecDeque<Vec<u8>>>,
    decode: DecodeFn,
    max_interleaved_frames: u32,
}

impl ConnPool {
    pub fn new(decode: DecodeFn) -> Self {
        Self {
            main: Connection::empty(),
            zones: Mutex::new(HashMap::new()),
            // Starts at 1 on first call to next_message_id; 0 is never returned.
            message_id: AtomicU32::new(1),
            subscriptions: Mutex::new(Vec::new()),
            pending_notifications: Mutex::new(VecDeque::new()),
            decode,
            max_interleaved_frames: DEFAULT_MAX_INTERLEAVED_FRAMES,
        }
    }

    pub fn with_max_interleaved_frames(mut self, max: u32) -> Self {
        self.max_interleaved_frames = max;
        self
    }

    pub fn main(&self) -> &Connection {
        &self.main
    }

    pub fn main_mut(&mut self) -> &mut Connection {
        &mut self.main
    }

    pub fn set_main(&mut self, conn: Connection) {
        self.main = conn;
    }

    pub fn take_main(&mut self) -> Connection {
        std::mem::replace(&mut self.main, Connection::empty())
    }

    /// Atomic, monotonically increasing, never returns 0 (Property P1).
    pub fn next_message_id(&self) -> u32 {
        // fetch_add never returns 0 because the counter starts at 1 and only
        // increases; wraparound isn't a concern within a single test suite
        // (spec.md §5 "Ordering guarantees").
        self.message_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Request/response multiplexer (spec.md §4.3.1, the algorithmic core).
    ///
    /// Writes `frame_bytes` on `main`, then reads up to `max_interleaved_frames`
    /// frames looking for one whose `message_id` matches `expected_id`.
    /// Frames with `message_id = 0` are buffered as notifications; any other
    /// mismatch is logged and discarded as an orphan (Property P2).
    pub async fn send_request(
        &mut self,
        frame_bytes: &[u8],
        op_label: &str,
        expected_id: u32,
        deadline: Option<TokioInstant>,
    ) -> Result<ResponseFrame, PoolError> {
        self.main.write_frame(frame_bytes).await?;

        let previous_deadline = self.main.set_read_deadline_from(deadline);
        let result = self.read_until_match(op_label, expected_id).await;
        self.main.set_read_deadline_from(previous_deadline);
        result
    }

    async fn read_until_match(
        &mut self,
        op_label: &str,
        expected_id: u32,
    ) -> Result<ResponseFrame, PoolError> {
        for _ in 0..self.max_interleaved_frames {
            let raw = self.main.read_frame().await?;
            let frame = (self.decode)(&raw).map_err(PoolError::Decode)?;

            if frame.header.message_id == 0 {
                self.append_notification(raw);
                continue;
            }
            if frame.header.message_id != expected_id {
                warn!(
                    target: "mash::pool",
                    op = op_label,
                    expected = expected_id,
                    got = frame.header.message_id,
                    "orphaned response discarded"
                );
                continue;
            }
            return Ok(frame);
        }
        Err(PoolError::TooManyInterleavedFrames)
    }

    pub fn append_notification(&self, bytes: Vec<u8>) {
        self.pending_notifications.lock().unwrap().push_back(bytes);
    }

    pub fn shift_notification(&self) -> Option<Vec<u8>> {
        self.pending_notifications.lock().unwrap().pop_front()
    }

    pub fn pending_notifications(&self) -> Vec<Vec<u8>> {
        self.pending_notifications.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear_notifications(&self) {
        self.pending_notifications.lock().unwrap().clear();
    }

    pub fn track_zone(&self, key: impl Into<String>, conn: Connection, zone_id: ZoneId) {
        self.zones.lock().unwrap().insert(key.into(), ZoneEntry { conn, zone_id });
    }

    pub fn untrack_zone(&self, key: &str) -> Option<ZoneEntry> {
        self.zones.lock().unwrap().remove(key)
    }

    /// Read-only zone accessor (spec.md §4.3 "zone(key)"): the tracked
    /// zone's ID and whether its connection is still live.
    pub fn zone(&self, key: &str) -> Option<(ZoneId, bool)> {
        self.zones
            .lock()
            .unwrap()
            .get(key)
            .map(|entry| (entry.zone_id.clone(), entry.conn.is_connected()))
    }

    pub fn zone_ids(&self) -> Vec<String> {
        self.zones.lock().unwrap().keys().cloned().collect()
    }

    pub fn track_subscription(&self, id: u32) {
        let mut subs = self.subscriptions.lock().unwrap();
        if !subs.contains(&id) {
            subs.push(id);
        }
    }

    pub fn remove_subscription(&self, id: u32) {
        self.subscriptions.lock().unwrap().retain(|&s| s != id);
    }

    pub fn subscriptions(&self) -> Vec<u32> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Best-effort wire unsubscribe for every tracked subscription, written
    /// over `main` (spec.md §4.3 "unsubscribe_all(conn)", §4.6.7 teardown).
    /// Each unsubscribe is written without waiting for or correlating a
    /// reply -- a device that never acks one is not retried, since teardown
    /// must proceed regardless. Clears the subscription list unconditionally
    /// once every write has been attempted.
    pub async fn unsubscribe_all(&mut self) {
        let ids = self.subscriptions();
        for id in ids {
            let message_id = self.next_message_id();
            let header = FrameHeader {
                message_id,
                op: crate::messages::OpCode::Unsubscribe,
                endpoint_id: 0,
                feature_id: 0,
            };
            let encoded = crate::messages::cbor_encode_envelope(
                &header,
                &crate::messages::UnsubscribeRequest { subscription_id: id },
            );
            if let Ok(bytes) = encoded {
                if let Err(e) = self.main.write_frame(&bytes).await {
                    debug!(target: "mash::pool", subscription = id, error = %e, "best-effort unsubscribe write failed");
                }
            }
        }
        self.subscriptions.lock().unwrap().clear();
    }

    /// Closes every tracked zone connection except `except_key`, invoking
    /// `close_hook` per zone before dropping it, and returns the wall-clock
    /// time of the final close (spec.md §4.3.2).
    pub fn zones_except(&self, except_key: &str, close_hook: &mut CloseHook<'_>) -> Option<SystemTime> {
        let mut zones = self.zones.lock().unwrap();
        let keys_to_close: Vec<String> = zones
            .keys()
            .filter(|k| k.as_str() != except_key)
            .cloned()
            .collect();

        let mut last_close = None;
        for key in keys_to_close {
            if let Some(mut entry) = zones.remove(&key) {
                close_hook(&key, &mut entry.conn);
                entry.conn.transition_to(ConnectionState::Disconnected);
                last_close = Some(SystemTime::now());
                debug!(target: "mash::pool", zone = %key, "zone closed");
            }
        }
        last_close
    }

    pub fn close_all_zones(&self, close_hook: &mut CloseHook<'_>) {
        let keys: Vec<String> = self.zones.lock().unwrap().keys().cloned().collect();
        for key in keys {
            if let Some(mut entry) = self.zones.lock().unwrap().remove(&key) {
                close_hook(&key, &mut entry.conn);
                entry.conn.transition_to(ConnectionState::Disconnected);
            }
        }
    }
}

impl Default for ConnPool {
    fn default() -> Self {
        Self::new(crate::messages::cbor_decode_frame)
    }
}
