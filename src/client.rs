//! One consumer context (a tab): proxy, bus, presence store and API wired
//! together on top of a device-wide shared connection.

use crate::bus::EventBus;
use crate::config::Config;
use crate::presence::{
    FormFactor, GatewayPresenceApi, LoopConfig, LoopContext, PresenceLoopHandle, PresenceStore,
    RoomSnapshot, activate,
};
use crate::transport::shared::{self, SharedConnectionHandle};
use crate::transport::{ConnectionState, TransportProxy};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PresenceClient {
    bus: EventBus,
    proxy: TransportProxy,
    store: PresenceStore,
    api: Arc<GatewayPresenceApi>,
    loop_config: LoopConfig,
}

impl PresenceClient {
    /// Start a shared connection and attach one context to it.
    pub fn connect(config: &Config) -> (SharedConnectionHandle, Self) {
        let shared = shared::spawn();
        let client = Self::attach(&shared, config);
        (shared, client)
    }

    /// Attach another context to an existing shared connection.
    pub fn attach(shared: &SharedConnectionHandle, config: &Config) -> Self {
        let bus = EventBus::new();
        let proxy = TransportProxy::new(shared, bus.clone(), &config.gateway_url);
        let api = GatewayPresenceApi::new(proxy.clone(), bus.clone(), config.snapshot_timeout());
        Self {
            bus,
            proxy,
            store: PresenceStore::new(),
            api: Arc::new(api),
            loop_config: LoopConfig::from(config),
        }
    }

    /// Start presence for a room. `None` on compact devices.
    pub fn join(&self, room: &str, form_factor: FormFactor) -> Option<PresenceLoopHandle> {
        let ctx = LoopContext {
            api: Arc::clone(&self.api),
            bus: self.bus.clone(),
            store: self.store.clone(),
            session: self.proxy.watch_session(),
        };
        activate(room, form_factor, ctx, self.loop_config.clone())
    }

    /// Wait until the gateway has announced a session, up to `limit`.
    pub async fn wait_connected(&self, limit: Duration) -> Option<String> {
        let mut state = self.proxy.watch_connection();
        let connected = tokio::time::timeout(limit, async {
            state
                .wait_for(|s| *s == ConnectionState::Connected)
                .await
                .is_ok()
        })
        .await;
        match connected {
            Ok(true) => self.proxy.session_id(),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.proxy.session_id()
    }

    pub fn snapshot(&self, room: &str) -> RoomSnapshot {
        self.store.snapshot(room)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn proxy(&self) -> &TransportProxy {
        &self.proxy
    }

    pub fn store(&self) -> &PresenceStore {
        &self.store
    }
}
