//! Transport proxy
//!
//! Each consumer context holds a [`TransportProxy`]. The proxy attaches to the
//! device-wide shared connection, answers its liveness pings, tracks the
//! session id and connection state, and turns `message` frames into canonical
//! events on the [`EventBus`].
//!
//! Built without a tokio runtime, the proxy is inert: every operation is a
//! no-op and the session id stays `None`.

pub mod link;
pub mod shared;

use self::shared::{PortRx, PortTx, SharedConnectionHandle};
use crate::bus::EventBus;
use crate::codec;
use crate::error::{PresenceError, Result};
use crate::event::{
    CanonicalEvent, ControlMessage, SOCKET_CONNECTED, SOCKET_DISCONNECTED, WireMessage,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Connection lifecycle as seen by one consumer context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

struct Shared {
    sid: watch::Sender<Option<String>>,
    state: watch::Sender<ConnectionState>,
}

struct Inner {
    port: PortTx,
    shared: Arc<Shared>,
    inbound: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Dropping the port receiver detaches this context.
        self.inbound.abort();
    }
}

#[derive(Clone)]
pub struct TransportProxy {
    inner: Option<Arc<Inner>>,
}

impl std::fmt::Debug for TransportProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportProxy")
            .field("inert", &self.inner.is_none())
            .field("session_id", &self.session_id())
            .field("state", &self.connection_state())
            .finish()
    }
}

impl TransportProxy {
    /// Attach to the shared connection, point it at `url` and ask it to
    /// connect.
    pub fn new(shared: &SharedConnectionHandle, bus: EventBus, url: &str) -> Self {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(rt) => rt,
            Err(e) => {
                let err = PresenceError::TransportUnavailable(e.to_string());
                warn!(error = %err, "transport proxy is inert");
                return Self::inert();
            }
        };

        let (port, rx) = shared.attach();
        let state = Arc::new(Shared {
            sid: watch::Sender::new(None),
            state: watch::Sender::new(ConnectionState::Disconnected),
        });

        let inbound = runtime.spawn(run_inbound(rx, port.clone(), Arc::clone(&state), bus));
        let proxy = Self {
            inner: Some(Arc::new(Inner {
                port,
                shared: state,
                inbound,
            })),
        };
        proxy.configure(url);
        proxy.init();
        proxy
    }

    /// A proxy that does nothing.
    pub fn inert() -> Self {
        Self { inner: None }
    }

    pub fn is_inert(&self) -> bool {
        self.inner.is_none()
    }

    /// Tell the shared connection which gateway to use. Idempotent.
    pub fn configure(&self, url: &str) {
        if let Some(inner) = &self.inner {
            inner.port.post(ControlMessage::Config {
                url: link::normalize_url(url),
            });
        }
    }

    fn init(&self) {
        if let Some(inner) = &self.inner {
            inner.shared.state.send_if_modified(|s| {
                if *s == ConnectionState::Disconnected {
                    *s = ConnectionState::Connecting;
                    return true;
                }
                false
            });
            inner.port.post(ControlMessage::Init);
        }
    }

    /// Last session id announced by the gateway.
    pub fn session_id(&self) -> Option<String> {
        self.inner
            .as_ref()
            .and_then(|inner| inner.shared.sid.borrow().clone())
    }

    /// Follow session id changes.
    pub fn watch_session(&self) -> watch::Receiver<Option<String>> {
        match &self.inner {
            Some(inner) => inner.shared.sid.subscribe(),
            None => watch::channel(None).1,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner
            .as_ref()
            .map(|inner| *inner.shared.state.borrow())
            .unwrap_or_default()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        match &self.inner {
            Some(inner) => inner.shared.state.subscribe(),
            None => watch::channel(ConnectionState::Disconnected).1,
        }
    }

    /// Queue an outbound event. Best effort; never waits.
    pub fn send(&self, kind: &str, payload: Value) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Err(PresenceError::TransportUnavailable("inert proxy".into()));
        };
        let frame = codec::encode(CanonicalEvent::new(kind, payload));
        if inner.port.post(ControlMessage::Emit(frame)) {
            Ok(())
        } else {
            Err(PresenceError::PushFailed("shared connection stopped".into()))
        }
    }

    /// Ask the shared connection to re-establish the link. No-op while
    /// connected.
    pub fn reconnect(&self) {
        if let Some(inner) = &self.inner {
            debug!("reconnect requested");
            inner.shared.state.send_if_modified(|s| {
                if *s == ConnectionState::Disconnected {
                    *s = ConnectionState::Connecting;
                    return true;
                }
                false
            });
            inner.port.post(ControlMessage::Reconnect);
        }
    }
}

async fn run_inbound(mut rx: PortRx, port: PortTx, shared: Arc<Shared>, bus: EventBus) {
    while let Some(msg) = rx.recv().await {
        handle_inbound(msg, &port, &shared, &bus);
    }
    debug!(port = rx.id(), "shared connection closed the port");
    if *shared.state.borrow() != ConnectionState::Disconnected {
        shared.state.send_replace(ConnectionState::Disconnected);
        bus.dispatch(SOCKET_DISCONNECTED, Value::Null);
    }
}

fn handle_inbound(msg: WireMessage, port: &PortTx, shared: &Shared, bus: &EventBus) {
    match msg {
        WireMessage::Ping => {
            trace!(port = port.id(), "pong");
            port.post(ControlMessage::Pong);
        }
        WireMessage::Connect(sid) => {
            info!(%sid, "transport connected");
            shared.sid.send_replace(Some(sid.clone()));
            shared.state.send_replace(ConnectionState::Connected);
            bus.dispatch(SOCKET_CONNECTED, json!({ "sid": sid }));
        }
        WireMessage::Sid(sid) => {
            shared.sid.send_replace(Some(sid));
        }
        WireMessage::Disconnect => {
            info!("transport disconnected");
            shared.state.send_replace(ConnectionState::Disconnected);
            bus.dispatch(SOCKET_DISCONNECTED, Value::Null);
        }
        WireMessage::Message(payload) => match codec::decode(&payload) {
            Ok(event) => {
                debug!(kind = %event.kind, payload = %event.payload, "inbound event");
                bus.dispatch(&event.kind, event.payload);
            }
            Err(e) => debug!(error = %e, "dropping malformed message"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ACTIVITY_UPDATE_PRESENCE;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn inert_outside_runtime() {
        let proxy = TransportProxy::inert();
        assert!(proxy.is_inert());
        assert!(proxy.session_id().is_none());
        assert_eq!(proxy.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(
            proxy.send("x", Value::Null),
            Err(PresenceError::TransportUnavailable(_))
        ));
        proxy.reconnect();
        proxy.configure("tcp://127.0.0.1:1");
    }

    #[test]
    fn new_without_runtime_is_inert() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let shared = rt.block_on(async { shared::spawn() });
        let proxy = TransportProxy::new(&shared, EventBus::new(), "tcp://127.0.0.1:1");
        assert!(proxy.is_inert());
    }

    #[tokio::test]
    async fn connect_message_disconnect_cycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("tcp://{}/", listener.local_addr().unwrap());

        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let shared = shared::spawn();
        let proxy = TransportProxy::new(&shared, bus.clone(), &url);
        assert_eq!(proxy.connection_state(), ConnectionState::Connecting);

        let (mut sock, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        sock.write_all(
            concat!(
                "{\"type\":\"connect\",\"payload\":\"abc\"}\n",
                "{\"type\":\"message\",\"payload\":\"{not json\"}\n",
                "{\"type\":\"message\",\"payload\":{\"type\":\"ACTIVITY_UPDATE_PRESENCE\",\"data\":{\"room_name\":\"r\"}}}\n",
            )
            .as_bytes(),
        )
        .await
        .unwrap();

        let ev = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(ev.kind, SOCKET_CONNECTED);
        assert_eq!(ev.payload, json!({"sid": "abc"}));
        assert_eq!(proxy.session_id().as_deref(), Some("abc"));
        assert_eq!(proxy.connection_state(), ConnectionState::Connected);

        // The malformed payload is skipped; the next good one arrives.
        let ev = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(ev.kind, ACTIVITY_UPDATE_PRESENCE);
        assert_eq!(ev.payload, json!({"roomName": "r"}));

        drop(sock);
        let ev = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(ev.kind, SOCKET_DISCONNECTED);
        assert_eq!(proxy.connection_state(), ConnectionState::Disconnected);
        // The identity is kept until the next connect announces a new one.
        assert_eq!(proxy.session_id().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn send_reaches_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("tcp://{}", listener.local_addr().unwrap());

        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let shared = shared::spawn();
        let proxy = TransportProxy::new(&shared, bus, &url);

        let (mut sock, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        sock.write_all(b"{\"type\":\"connect\",\"payload\":\"abc\"}\n")
            .await
            .unwrap();
        timeout(WAIT, events.recv()).await.unwrap().unwrap();

        proxy.send("update_presence", json!({"position": 12})).unwrap();

        let mut lines = tokio::io::BufReader::new(&mut sock).lines();
        let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap();
        let frame: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            frame,
            json!({"type": "update_presence", "payload": {"position": 12}})
        );
    }

    #[tokio::test]
    async fn two_proxies_share_one_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("tcp://{}", listener.local_addr().unwrap());

        let shared = shared::spawn();
        let bus_a = EventBus::new();
        let bus_b = EventBus::new();
        let mut ev_a = bus_a.subscribe();
        let mut ev_b = bus_b.subscribe();
        let a = TransportProxy::new(&shared, bus_a, &url);
        let b = TransportProxy::new(&shared, bus_b, &url);

        let (mut sock, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        sock.write_all(b"{\"type\":\"connect\",\"payload\":\"dev-1\"}\n")
            .await
            .unwrap();

        assert_eq!(timeout(WAIT, ev_a.recv()).await.unwrap().unwrap().kind, SOCKET_CONNECTED);
        assert_eq!(timeout(WAIT, ev_b.recv()).await.unwrap().unwrap().kind, SOCKET_CONNECTED);
        assert_eq!(a.session_id(), b.session_id());
    }
}
