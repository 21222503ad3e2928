//! Per-room presence synchronization loop
//!
//! One task per active room. It installs snapshots, merges deltas from the
//! event bus, and pushes the local read position through a trailing debounce.
//! Both timers live inside the task, so stopping the task cancels them.

use super::{
    PresenceApi, PresenceLeave, PresenceRecord, PresenceStore, PushRequest, clamp_position,
};
use crate::bus::{EventBus, EventRx};
use crate::config::Config;
use crate::error::Result;
use crate::event::{
    ACTIVITY_LEAVE_PRESENCE, ACTIVITY_UPDATE_PRESENCE, CanonicalEvent, SOCKET_CONNECTED,
};
use crate::time::MonotonicClock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Trailing debounce for outbound position pushes
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);
/// Snapshot refresh cadence; the self-healing path for lost deltas
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Device class; presence only runs on desktop-class devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormFactor {
    #[default]
    Desktop,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    #[default]
    Idle,
    Syncing,
    Live,
}

/// Loop timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub debounce: Duration,
    pub refresh_interval: Duration,
    /// Remote records older than this are evicted on refresh
    pub eviction_ttl: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            eviction_ttl: DEFAULT_REFRESH_INTERVAL * 2,
        }
    }
}

impl From<&Config> for LoopConfig {
    fn from(config: &Config) -> Self {
        let refresh_interval = Duration::from_secs(config.refresh_interval_secs.max(1));
        Self {
            debounce: Duration::from_millis(config.debounce_ms),
            refresh_interval,
            eviction_ttl: refresh_interval * 2,
        }
    }
}

/// What a loop needs from the rest of the client
#[derive(Debug)]
pub struct LoopContext<A> {
    pub api: Arc<A>,
    pub bus: EventBus,
    pub store: PresenceStore,
    /// Current session id, as tracked by the transport proxy
    pub session: watch::Receiver<Option<String>>,
}

impl<A> Clone for LoopContext<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            bus: self.bus.clone(),
            store: self.store.clone(),
            session: self.session.clone(),
        }
    }
}

/// Owner handle of a running loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct PresenceLoopHandle {
    room: String,
    position: watch::Sender<u8>,
    phase: watch::Receiver<LoopPhase>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PresenceLoopHandle {
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Record a new local read percentage. Out-of-range values are clamped.
    pub fn sample(&self, percent: f64) {
        let position = clamp_position(percent);
        self.position.send_if_modified(|current| {
            if *current == position {
                return false;
            }
            *current = position;
            true
        });
    }

    /// Latest local read percentage
    pub fn position(&self) -> u8 {
        *self.position.borrow()
    }

    pub fn phase(&self) -> LoopPhase {
        *self.phase.borrow()
    }

    /// Stop the loop, cancelling any pending push and the refresh timer.
    pub async fn deactivate(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!(room = %self.room, "presence deactivated");
    }
}

impl Drop for PresenceLoopHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start presence for `room`.
///
/// Returns `None` on compact devices, where presence is switched off.
pub fn activate<A: PresenceApi>(
    room: &str,
    form_factor: FormFactor,
    ctx: LoopContext<A>,
    config: LoopConfig,
) -> Option<PresenceLoopHandle> {
    if form_factor == FormFactor::Compact {
        debug!(%room, "presence suppressed on compact form factor");
        return None;
    }

    let (position_tx, position_rx) = watch::channel(0u8);
    let (phase_tx, phase_rx) = watch::channel(LoopPhase::Idle);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    // Subscribe now so no delta dispatched before the task starts is lost.
    let events = ctx.bus.subscribe();

    let sync = RoomSync {
        room: room.to_string(),
        api: ctx.api,
        store: ctx.store,
        session: ctx.session,
        position: position_rx,
        phase: phase_tx,
        config,
        clock: MonotonicClock::new(),
        connected_at: None,
    };
    info!(%room, "presence activated");
    let task = tokio::spawn(sync.run(events, shutdown_rx));

    Some(PresenceLoopHandle {
        room: room.to_string(),
        position: position_tx,
        phase: phase_rx,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    })
}

type SnapshotFetch = Pin<Box<dyn Future<Output = Result<Vec<PresenceRecord>>> + Send>>;

async fn poll_fetch(fetch: &mut Option<SnapshotFetch>) -> Result<Vec<PresenceRecord>> {
    match fetch.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

struct RoomSync<A> {
    room: String,
    api: Arc<A>,
    store: PresenceStore,
    session: watch::Receiver<Option<String>>,
    position: watch::Receiver<u8>,
    phase: watch::Sender<LoopPhase>,
    config: LoopConfig,
    clock: MonotonicClock,
    /// Session the local record was first pushed under, and when
    connected_at: Option<(String, i64)>,
}

impl<A: PresenceApi> RoomSync<A> {
    async fn run(mut self, mut events: EventRx, mut shutdown: oneshot::Receiver<()>) {
        self.phase.send_replace(LoopPhase::Syncing);
        // At most one snapshot fetch in flight. It is polled alongside the
        // other branches so pushes, deltas and shutdown never wait on it.
        let mut fetch: Option<SnapshotFetch> = Some(self.start_fetch());

        let period = self.config.refresh_interval;
        let mut refresh = tokio::time::interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The position at activation goes out like any other sample.
        let mut pending: Option<Instant> = Some(Instant::now() + self.config.debounce);

        loop {
            let deadline = pending.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = &mut shutdown => break,
                changed = self.position.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    trace!(room = %self.room, position = *self.position.borrow(), "position sampled");
                    pending = Some(Instant::now() + self.config.debounce);
                }
                _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                    pending = None;
                    self.push_current();
                }
                result = poll_fetch(&mut fetch), if fetch.is_some() => {
                    fetch = None;
                    self.install(result);
                    self.phase.send_if_modified(|phase| {
                        if *phase == LoopPhase::Syncing {
                            *phase = LoopPhase::Live;
                            return true;
                        }
                        false
                    });
                }
                _ = refresh.tick() => {
                    self.evict_expired();
                    if fetch.is_none() {
                        fetch = Some(self.start_fetch());
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if event.is(SOCKET_CONNECTED) {
                        // Re-announce right away, then resync. A pending
                        // debounced push would only repeat this one.
                        pending = None;
                        self.push_current();
                        fetch = Some(self.start_fetch());
                    } else {
                        self.apply_event(event);
                    }
                }
            }
        }

        self.phase.send_replace(LoopPhase::Idle);
        debug!(room = %self.room, "presence loop stopped");
    }

    fn start_fetch(&self) -> SnapshotFetch {
        let api = Arc::clone(&self.api);
        let room = self.room.clone();
        Box::pin(async move { api.fetch_snapshot(&room).await })
    }

    fn install(&mut self, result: Result<Vec<PresenceRecord>>) {
        match result {
            Ok(records) => {
                let room = self.room.clone();
                self.store
                    .update(|t| t.install_snapshot(&room, records));
            }
            Err(e) => warn!(room = %self.room, error = %e, "presence snapshot failed"),
        }
    }

    fn evict_expired(&mut self) {
        let ttl = i64::try_from(self.config.eviction_ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now().saturating_sub(ttl);
        let local = self.session.borrow().clone();
        let room = self.room.clone();
        self.store
            .update(|t| t.evict_older_than(&room, cutoff, local.as_deref()));
    }

    fn apply_event(&mut self, event: CanonicalEvent) {
        match event.kind.as_str() {
            ACTIVITY_UPDATE_PRESENCE => {
                match serde_json::from_value::<PresenceRecord>(event.payload) {
                    Ok(record) if record.room_name == self.room => {
                        self.store.update(|t| t.merge(record));
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "ignoring malformed presence delta"),
                }
            }
            ACTIVITY_LEAVE_PRESENCE => match serde_json::from_value::<PresenceLeave>(event.payload) {
                Ok(leave) if leave.room_name == self.room => {
                    self.store
                        .update(|t| t.remove(&leave.room_name, &leave.identity));
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "ignoring malformed presence leave"),
            },
            _ => {}
        }
    }

    /// Write the local record and push it. Skipped until a session exists.
    fn push_current(&mut self) {
        let Some(sid) = self.session.borrow().clone() else {
            debug!(room = %self.room, "push skipped: no session yet");
            return;
        };
        let position = *self.position.borrow();
        let now = self.clock.now();
        let connected_at = match &self.connected_at {
            Some((owner, at)) if *owner == sid => *at,
            _ => {
                self.connected_at = Some((sid.clone(), now));
                now
            }
        };

        let record = PresenceRecord {
            identity: sid.clone(),
            room_name: self.room.clone(),
            position,
            connected_at,
            operation_time: now,
        };
        self.store.update(|t| t.merge(record));

        let update = PushRequest {
            identity: sid.clone(),
            position,
            sid,
            room_name: self.room.clone(),
        };
        if let Err(e) = self.api.push(update) {
            debug!(room = %self.room, error = %e, "presence push dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PresenceError, Result};
    use crate::time::now_millis;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeApi {
        snapshot: Mutex<Vec<PresenceRecord>>,
        fetches: AtomicUsize,
        pushes: Mutex<Vec<PushRequest>>,
        fail_fetch: AtomicBool,
        fetch_delay: Duration,
    }

    impl FakeApi {
        fn pushed_positions(&self) -> Vec<u8> {
            self.pushes.lock().unwrap().iter().map(|p| p.position).collect()
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl PresenceApi for FakeApi {
        async fn fetch_snapshot(&self, room: &str) -> Result<Vec<PresenceRecord>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.fetch_delay.is_zero() {
                tokio::time::sleep(self.fetch_delay).await;
            }
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(PresenceError::SnapshotFetchFailed {
                    room: room.to_string(),
                    reason: "offline".into(),
                });
            }
            Ok(self.snapshot.lock().unwrap().clone())
        }

        fn push(&self, update: PushRequest) -> Result<()> {
            self.pushes.lock().unwrap().push(update);
            Ok(())
        }
    }

    struct Harness {
        api: Arc<FakeApi>,
        bus: EventBus,
        store: PresenceStore,
        session: watch::Sender<Option<String>>,
    }

    impl Harness {
        fn new(sid: Option<&str>) -> Self {
            Self::with_api(sid, FakeApi::default())
        }

        fn with_api(sid: Option<&str>, api: FakeApi) -> Self {
            Self {
                api: Arc::new(api),
                bus: EventBus::new(),
                store: PresenceStore::new(),
                session: watch::Sender::new(sid.map(String::from)),
            }
        }

        fn ctx(&self) -> LoopContext<FakeApi> {
            LoopContext {
                api: Arc::clone(&self.api),
                bus: self.bus.clone(),
                store: self.store.clone(),
                session: self.session.subscribe(),
            }
        }

        fn activate(&self, room: &str) -> PresenceLoopHandle {
            activate(room, FormFactor::Desktop, self.ctx(), LoopConfig::default()).unwrap()
        }
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn remote(identity: &str, room: &str, position: u8, op: i64) -> PresenceRecord {
        PresenceRecord {
            identity: identity.into(),
            room_name: room.into(),
            position,
            connected_at: op,
            operation_time: op,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn compact_devices_get_no_loop() {
        let h = Harness::new(Some("me"));
        assert!(activate("x", FormFactor::Compact, h.ctx(), LoopConfig::default()).is_none());
        advance(5_000).await;
        assert_eq!(h.api.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn activation_syncs_then_goes_live() {
        let h = Harness::new(Some("me"));
        h.api.snapshot.lock().unwrap().push(remote("a", "x", 40, now_millis()));

        let handle = h.activate("x");
        advance(10).await;

        assert_eq!(handle.phase(), LoopPhase::Live);
        assert_eq!(h.api.fetch_count(), 1);
        assert_eq!(h.store.snapshot("x").get("a").map(|r| r.position), Some(40));
    }

    #[tokio::test(start_paused = true)]
    async fn only_last_sample_in_window_is_pushed() {
        let h = Harness::new(Some("me"));
        let handle = h.activate("x");
        advance(10).await;

        handle.sample(10.0);
        advance(300).await;
        handle.sample(20.0);
        advance(300).await;
        handle.sample(30.0);
        advance(999).await;
        assert!(h.api.pushed_positions().is_empty());

        advance(2).await;
        assert_eq!(h.api.pushed_positions(), vec![30]);

        // The local record is written alongside the push.
        assert_eq!(h.store.snapshot("x").get("me").map(|r| r.position), Some(30));
    }

    #[tokio::test(start_paused = true)]
    async fn samples_are_clamped() {
        let h = Harness::new(Some("me"));
        let handle = h.activate("x");

        handle.sample(250.0);
        assert_eq!(handle.position(), 100);
        advance(1_500).await;
        handle.sample(-10.0);
        assert_eq!(handle.position(), 0);
        advance(1_500).await;

        assert_eq!(h.api.pushed_positions(), vec![100, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_forces_one_fetch_and_one_push() {
        let h = Harness::new(Some("me"));
        let handle = h.activate("x");
        advance(1_500).await;
        assert_eq!(h.api.fetch_count(), 1);
        assert_eq!(h.api.pushed_positions(), vec![0]);

        handle.sample(55.0);
        advance(100).await;
        h.bus.dispatch(SOCKET_CONNECTED, json!({"sid": "me"}));
        advance(1).await;

        assert_eq!(h.api.fetch_count(), 2);
        assert_eq!(h.api.pushed_positions(), vec![0, 55]);

        // The pending debounced push was folded into the immediate one.
        advance(3_000).await;
        assert_eq!(h.api.pushed_positions(), vec![0, 55]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_snapshot_does_not_hold_back_the_loop() {
        let api = FakeApi {
            fetch_delay: Duration::from_secs(5),
            ..FakeApi::default()
        };
        let h = Harness::with_api(Some("me"), api);
        let handle = h.activate("x");

        // The debounced push goes out while the first fetch is in flight.
        advance(1_500).await;
        assert_eq!(h.api.pushed_positions(), vec![0]);
        assert_eq!(handle.phase(), LoopPhase::Syncing);

        handle.sample(55.0);
        advance(10).await;
        h.bus.dispatch(SOCKET_CONNECTED, json!({"sid": "me"}));
        advance(1).await;
        assert_eq!(h.api.pushed_positions(), vec![0, 55]);
        assert_eq!(h.api.fetch_count(), 2);

        h.bus.dispatch(
            ACTIVITY_UPDATE_PRESENCE,
            serde_json::to_value(remote("a", "x", 40, now_millis())).unwrap(),
        );
        advance(1).await;
        assert!(h.store.snapshot("x").get("a").is_some());

        advance(5_000).await;
        assert_eq!(handle.phase(), LoopPhase::Live);

        h.bus.dispatch(SOCKET_CONNECTED, json!({"sid": "me"}));
        advance(1).await;
        // Shutdown is not held up by the fetch that just started.
        tokio::time::timeout(Duration::from_millis(1), handle.deactivate())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deltas_merge_into_the_room() {
        let h = Harness::new(Some("me"));
        let _handle = h.activate("x");
        advance(10).await;

        h.bus.dispatch(
            ACTIVITY_UPDATE_PRESENCE,
            serde_json::to_value(remote("a", "x", 40, 100)).unwrap(),
        );
        h.bus.dispatch(
            ACTIVITY_UPDATE_PRESENCE,
            serde_json::to_value(remote("b", "other", 10, 100)).unwrap(),
        );
        // Stale echo loses to the newer record.
        h.bus.dispatch(
            ACTIVITY_UPDATE_PRESENCE,
            serde_json::to_value(remote("a", "x", 5, 50)).unwrap(),
        );
        h.bus.dispatch(ACTIVITY_UPDATE_PRESENCE, json!({"garbage": true}));
        advance(1).await;

        let snap = h.store.snapshot("x");
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.get("a").unwrap().position, 40);
        assert!(h.store.snapshot("other").records.is_empty());

        h.bus.dispatch(
            ACTIVITY_LEAVE_PRESENCE,
            json!({"identity": "a", "roomName": "x"}),
        );
        advance(1).await;
        assert!(h.store.snapshot("x").get("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_cancels_pending_push_and_refresh() {
        let h = Harness::new(Some("me"));
        let handle = h.activate("x");
        advance(10).await;
        handle.sample(70.0);
        advance(100).await;

        handle.deactivate().await;
        advance(120_000).await;

        assert!(h.api.pushed_positions().is_empty());
        assert_eq!(h.api.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_the_loop() {
        let h = Harness::new(Some("me"));
        let handle = h.activate("x");
        advance(10).await;
        drop(handle);
        advance(120_000).await;
        assert_eq!(h.api.fetch_count(), 1);
        assert!(h.api.pushed_positions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_refresh_and_eviction() {
        let h = Harness::new(Some("me"));
        let _handle = h.activate("x");
        advance(10).await;

        let stale = now_millis() - 10 * 60 * 1000;
        h.store.update(|t| t.merge(remote("ghost", "x", 20, stale)));
        h.bus.dispatch(
            ACTIVITY_UPDATE_PRESENCE,
            serde_json::to_value(remote("fresh", "x", 20, now_millis())).unwrap(),
        );

        advance(30_000).await;
        assert_eq!(h.api.fetch_count(), 2);
        let snap = h.store.snapshot("x");
        assert!(snap.get("ghost").is_none());
        assert!(snap.get("fresh").is_some());
        // The local record is never expired.
        assert!(snap.get("me").is_some());

        advance(30_000).await;
        assert_eq!(h.api.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_snapshot_keeps_the_loop_alive() {
        let h = Harness::new(Some("me"));
        h.api.fail_fetch.store(true, Ordering::SeqCst);
        let handle = h.activate("x");
        advance(10).await;
        assert_eq!(handle.phase(), LoopPhase::Live);

        handle.sample(12.0);
        advance(1_100).await;
        assert_eq!(h.api.pushed_positions(), vec![12]);

        h.api.fail_fetch.store(false, Ordering::SeqCst);
        h.api.snapshot.lock().unwrap().push(remote("a", "x", 9, now_millis()));
        advance(30_000).await;
        assert!(h.store.snapshot("x").get("a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn no_push_before_session_exists() {
        let h = Harness::new(None);
        let handle = h.activate("x");
        handle.sample(33.0);
        advance(2_000).await;
        assert!(h.api.pushed_positions().is_empty());

        h.session.send_replace(Some("late".into()));
        h.bus.dispatch(SOCKET_CONNECTED, json!({"sid": "late"}));
        advance(1).await;
        assert_eq!(h.api.pushed_positions(), vec![33]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_with_new_identity_keeps_old_record() {
        let h = Harness::new(Some("first"));
        let handle = h.activate("x");
        handle.sample(40.0);
        advance(1_500).await;

        h.session.send_replace(Some("second".into()));
        h.bus.dispatch(SOCKET_CONNECTED, json!({"sid": "second"}));
        advance(1).await;

        let pushes = h.api.pushes.lock().unwrap().clone();
        assert_eq!(pushes.last().unwrap().identity, "second");
        assert_eq!(pushes.last().unwrap().sid, "second");

        let snap = h.store.snapshot("x");
        assert!(snap.get("first").is_some());
        assert_eq!(snap.get("second").unwrap().position, 40);
    }
}
