//! Reference presence gateway
//!
//! Listens on a TCP address or Unix socket for newline-delimited JSON links.
//! Each link is one session: it is greeted with `connect(sid)`, may emit
//! `update_presence` and `presence_snapshot`, and has its records removed
//! (with a leave broadcast) when it goes away.

use crate::error::Result;
use crate::event::{
    ACTIVITY_LEAVE_PRESENCE, ACTIVITY_UPDATE_PRESENCE, EMIT_PRESENCE_SNAPSHOT,
    EMIT_UPDATE_PRESENCE, EmitFrame, PRESENCE_SNAPSHOT, WireMessage,
};
use crate::presence::{PresenceRecord, PresenceTable, PushRequest};
use crate::time::now_millis;
use crate::transport::link::{Endpoint, LinkStream};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Presence record as the gateway writes it: snake_case keys
#[derive(Debug, Clone, Serialize)]
struct WireRecord<'a> {
    identity: &'a str,
    room_name: &'a str,
    position: u8,
    connected_at: i64,
    operation_time: i64,
}

impl<'a> From<&'a PresenceRecord> for WireRecord<'a> {
    fn from(r: &'a PresenceRecord) -> Self {
        Self {
            identity: &r.identity,
            room_name: &r.room_name,
            position: r.position,
            connected_at: r.connected_at,
            operation_time: r.operation_time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRequest {
    room_name: String,
}

struct Session {
    tx: mpsc::UnboundedSender<String>,
    /// Identities this session has written, with their first write time
    identities: HashMap<String, i64>,
}

#[derive(Default)]
struct GatewayState {
    table: PresenceTable,
    sessions: HashMap<String, Session>,
}

/// Shared gateway state
#[derive(Clone, Default)]
pub struct Gateway {
    state: Arc<Mutex<GatewayState>>,
    next_session: Arc<AtomicU64>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = self.state.lock().map(|s| s.sessions.len()).unwrap_or(0);
        f.debug_struct("Gateway").field("sessions", &sessions).finish()
    }
}

/// Bound listener, ready to serve
pub enum GatewayListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl std::fmt::Debug for GatewayListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.local_endpoint() {
            Some(ep) => write!(f, "GatewayListener({ep})"),
            None => f.write_str("GatewayListener"),
        }
    }
}

/// Bind the gateway to `endpoint`.
///
/// A stale socket file at a Unix endpoint is removed first.
pub async fn bind(endpoint: &Endpoint) -> Result<GatewayListener> {
    match endpoint {
        Endpoint::Tcp(addr) => Ok(GatewayListener::Tcp(TcpListener::bind(addr.as_str()).await?)),
        Endpoint::Unix(path) => {
            if path.exists() {
                std::fs::remove_file(path)?;
                debug!(path = %path.display(), "removed stale socket");
            }
            Ok(GatewayListener::Unix(UnixListener::bind(path)?))
        }
    }
}

/// Bind and serve until the process exits.
pub async fn start(endpoint: &Endpoint) -> Result<()> {
    let listener = bind(endpoint).await?;
    info!(endpoint = %endpoint, "presence gateway listening");
    Gateway::default().serve(listener).await;
    Ok(())
}

impl GatewayListener {
    /// Actual address, useful after binding port 0.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        match self {
            Self::Tcp(l) => l.local_addr().ok().map(Endpoint::from),
            Self::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| Endpoint::Unix(p.to_path_buf()))),
        }
    }

    async fn accept(&self) -> std::io::Result<Box<dyn LinkStream>> {
        match self {
            Self::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Self::Unix(l) => Ok(Box::new(l.accept().await?.0)),
        }
    }
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept links forever.
    pub async fn serve(self, listener: GatewayListener) {
        loop {
            match listener.accept().await {
                Ok(stream) => {
                    let gateway = self.clone();
                    tokio::spawn(async move { gateway.handle_link(stream).await });
                }
                Err(e) => warn!(error = %e, "failed to accept gateway connection"),
            }
        }
    }

    /// Number of live records across all rooms
    pub fn record_count(&self) -> usize {
        self.state.lock().map(|s| s.table.len()).unwrap_or(0)
    }

    fn new_session_id(&self) -> String {
        let n = self.next_session.fetch_add(1, Ordering::Relaxed);
        format!("{:x}{:04x}", now_millis(), n & 0xffff)
    }

    async fn handle_link(self, stream: Box<dyn LinkStream>) {
        let (reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(mut line) = rx.recv().await {
                line.push('\n');
                if writer.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
            }
        });

        let sid = self.new_session_id();
        if let Ok(mut state) = self.state.lock() {
            state.sessions.insert(
                sid.clone(),
                Session {
                    tx: tx.clone(),
                    identities: HashMap::new(),
                },
            );
        }
        send(&tx, &WireMessage::Connect(sid.clone()));
        info!(%sid, "session opened");

        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EmitFrame>(&line) {
                Ok(frame) => self.handle_frame(&sid, frame),
                Err(e) => trace!(error = %e, %line, "dropping unparsable gateway frame"),
            }
        }

        self.close_session(&sid);
    }

    fn handle_frame(&self, sid: &str, frame: EmitFrame) {
        match frame.kind.as_str() {
            EMIT_UPDATE_PRESENCE => match serde_json::from_value::<PushRequest>(frame.payload) {
                Ok(update) => self.update_presence(sid, update),
                Err(e) => debug!(%sid, error = %e, "bad presence update"),
            },
            EMIT_PRESENCE_SNAPSHOT => match serde_json::from_value::<SnapshotRequest>(frame.payload) {
                Ok(req) => self.reply_snapshot(sid, &req.room_name),
                Err(e) => debug!(%sid, error = %e, "bad snapshot request"),
            },
            other => trace!(%sid, kind = other, "ignoring emit"),
        }
    }

    fn update_presence(&self, sid: &str, update: PushRequest) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let now = now_millis();
        let Some(session) = state.sessions.get_mut(sid) else {
            return;
        };
        let connected_at = *session
            .identities
            .entry(update.identity.clone())
            .or_insert(now);

        let record = PresenceRecord {
            identity: update.identity,
            room_name: update.room_name,
            position: update.position.min(100),
            connected_at,
            operation_time: now,
        };
        if !state.table.merge(record.clone()).changed() {
            return;
        }
        let line = encoded_message(ACTIVITY_UPDATE_PRESENCE, json!(WireRecord::from(&record)));
        broadcast(&mut state, &line);
    }

    fn reply_snapshot(&self, sid: &str, room: &str) {
        let Ok(state) = self.state.lock() else {
            return;
        };
        let snapshot = state.table.snapshot(room);
        let records: Vec<WireRecord<'_>> = snapshot.records.iter().map(WireRecord::from).collect();
        let reply = WireMessage::Message(json!({
            "type": PRESENCE_SNAPSHOT,
            "data": { "room_name": room, "records": records },
        }));
        if let Some(session) = state.sessions.get(sid) {
            send(&session.tx, &reply);
        }
        debug!(%sid, %room, records = snapshot.records.len(), "snapshot served");
    }

    fn close_session(&self, sid: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let Some(session) = state.sessions.remove(sid) else {
            return;
        };

        for identity in session.identities.keys() {
            let Some(room) = state.table.get(identity).map(|r| r.room_name.clone()) else {
                continue;
            };
            if state.table.remove(&room, identity) {
                let line = encoded_message(
                    ACTIVITY_LEAVE_PRESENCE,
                    json!({ "identity": identity, "room_name": room }),
                );
                broadcast(&mut state, &line);
            }
        }
        info!(%sid, "session closed");
    }
}

/// `message` frame whose payload is the string-encoded `{type, data}`.
fn encoded_message(kind: &str, data: Value) -> WireMessage {
    WireMessage::Message(Value::String(json!({ "type": kind, "data": data }).to_string()))
}

fn send(tx: &mpsc::UnboundedSender<String>, msg: &WireMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(line) => tx.send(line).is_ok(),
        Err(_) => false,
    }
}

fn broadcast(state: &mut GatewayState, msg: &WireMessage) {
    let gone: HashSet<String> = state
        .sessions
        .iter()
        .filter(|(_, s)| !send(&s.tx, msg))
        .map(|(sid, _)| sid.clone())
        .collect();
    for sid in gone {
        state.sessions.remove(&sid);
    }
}
