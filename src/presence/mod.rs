//! Reading presence: records, the shared table and the per-room sync loop
//!
//! A presence record says where one session currently is in one room's
//! content, as a read percentage. Records arrive three ways: snapshots fetched
//! from the gateway, deltas pushed over the transport, and local samples.

pub mod store;
pub mod sync;
pub mod table;

use crate::bus::EventBus;
use crate::error::{PresenceError, Result};
use crate::event::{EMIT_PRESENCE_SNAPSHOT, EMIT_UPDATE_PRESENCE, PRESENCE_SNAPSHOT};
use crate::transport::TransportProxy;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace};

pub use store::PresenceStore;
pub use sync::{FormFactor, LoopConfig, LoopContext, LoopPhase, PresenceLoopHandle, activate};
pub use table::{MergeOutcome, PresenceTable, RoomSnapshot};

/// Clamp any sampled or received position into `0..=100`.
pub fn clamp_position(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as u8
}

fn de_position<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    Ok(clamp_position(raw))
}

/// Where one session is in one room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub identity: String,
    pub room_name: String,
    /// Read percentage, always within `0..=100`
    #[serde(deserialize_with = "de_position")]
    pub position: u8,
    /// Milliseconds since the Unix epoch
    pub connected_at: i64,
    /// Milliseconds since the Unix epoch; last write wins
    pub operation_time: i64,
}

impl PresenceRecord {
    /// Total order used for last-write-wins.
    ///
    /// `operation_time` decides; the remaining fields only break exact ties so
    /// that merging is commutative.
    fn lww_key(&self) -> (i64, u8, &str, i64) {
        (
            self.operation_time,
            self.position,
            self.room_name.as_str(),
            self.connected_at,
        )
    }

    /// Milliseconds this session has been reading.
    pub fn reading_duration_ms(&self) -> i64 {
        (self.operation_time - self.connected_at).max(0)
    }
}

/// A session left a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceLeave {
    pub identity: String,
    pub room_name: String,
}

/// Body of a presence push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub identity: String,
    pub position: u8,
    pub sid: String,
    pub room_name: String,
}

/// Remote presence service
///
/// `push` is fire-and-forget and must not wait; `fetch_snapshot` may take as
/// long as the implementation's own timeout allows.
pub trait PresenceApi: Send + Sync + 'static {
    fn fetch_snapshot(
        &self,
        room: &str,
    ) -> impl Future<Output = Result<Vec<PresenceRecord>>> + Send;

    fn push(&self, update: PushRequest) -> Result<()>;
}

/// Presence API spoken over the push transport itself.
///
/// Snapshots are requested with an emit and answered by a
/// `PRESENCE_SNAPSHOT` event for the same room.
#[derive(Debug, Clone)]
pub struct GatewayPresenceApi {
    proxy: TransportProxy,
    bus: EventBus,
    timeout: Duration,
}

impl GatewayPresenceApi {
    pub fn new(proxy: TransportProxy, bus: EventBus, timeout: Duration) -> Self {
        Self {
            proxy,
            bus,
            timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotReply {
    room_name: String,
    #[serde(default)]
    records: Vec<PresenceRecord>,
}

impl PresenceApi for GatewayPresenceApi {
    async fn fetch_snapshot(&self, room: &str) -> Result<Vec<PresenceRecord>> {
        let failed = |reason: String| PresenceError::SnapshotFetchFailed {
            room: room.to_string(),
            reason,
        };

        // Subscribe before asking so the reply cannot slip past.
        let mut events = self.bus.subscribe();
        self.proxy
            .send(EMIT_PRESENCE_SNAPSHOT, json!({ "roomName": room }))
            .map_err(|e| failed(e.to_string()))?;

        let wait = async {
            while let Some(event) = events.recv().await {
                if !event.is(PRESENCE_SNAPSHOT) {
                    continue;
                }
                match serde_json::from_value::<SnapshotReply>(event.payload) {
                    Ok(reply) if reply.room_name == room => return Ok(reply.records),
                    Ok(reply) => trace!(room = %reply.room_name, "snapshot for another room"),
                    Err(e) => return Err(failed(format!("bad snapshot: {e}"))),
                }
            }
            Err(failed("event bus closed".into()))
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(failed(format!("no reply within {:?}", self.timeout))),
        }
    }

    fn push(&self, update: PushRequest) -> Result<()> {
        debug!(room = %update.room_name, position = update.position, "push presence");
        let payload = serde_json::to_value(&update).unwrap_or(Value::Null);
        self.proxy.send(EMIT_UPDATE_PRESENCE, payload)
    }
}
