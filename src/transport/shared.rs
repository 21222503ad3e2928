//! Device-wide shared connection
//!
//! One actor task owns the single physical link to the gateway. Every local
//! consumer context (tab) attaches a port ([`PortTx`] / [`PortRx`]) and talks
//! to the actor through it; the actor fans inbound frames out to every port.
//!
//! Ports are sent `ping` on a fixed cadence and pruned when they stop
//! answering, since a consumer can vanish without detaching.

use super::link::{Endpoint, normalize_url};
use crate::event::{ControlMessage, EmitFrame, WireMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// How often attached ports are pinged
pub const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Missed pings before a port is pruned
const PING_GRACE: u32 = 3;
/// Delay before re-dialing a lost link
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub type PortId = u64;

enum Command {
    Attach {
        id: PortId,
        tx: mpsc::UnboundedSender<WireMessage>,
    },
    Detach(PortId),
    Control(PortId, ControlMessage),
}

enum LinkEvent {
    Opened {
        epoch: u64,
        writer: mpsc::UnboundedSender<String>,
    },
    Line {
        epoch: u64,
        line: String,
    },
    Closed {
        epoch: u64,
        reason: String,
    },
    Retry {
        epoch: u64,
    },
}

/// Handle to the shared connection actor
#[derive(Debug, Clone)]
pub struct SharedConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_port: Arc<AtomicU64>,
}

/// Sending half of a port
#[derive(Debug, Clone)]
pub struct PortTx {
    id: PortId,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

/// Receiving half of a port. Dropping it detaches the port.
#[derive(Debug)]
pub struct PortRx {
    id: PortId,
    rx: mpsc::UnboundedReceiver<WireMessage>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attach { id, .. } => write!(f, "Attach({id})"),
            Self::Detach(id) => write!(f, "Detach({id})"),
            Self::Control(id, msg) => write!(f, "Control({id}, {msg:?})"),
        }
    }
}

impl SharedConnectionHandle {
    /// Attach a new consumer context.
    pub fn attach(&self) -> (PortTx, PortRx) {
        let id = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.cmd_tx.send(Command::Attach { id, tx });
        (
            PortTx {
                id,
                cmd_tx: self.cmd_tx.clone(),
            },
            PortRx {
                id,
                rx,
                cmd_tx: self.cmd_tx.clone(),
            },
        )
    }
}

impl PortTx {
    pub fn id(&self) -> PortId {
        self.id
    }

    /// Post a control message. Returns `false` once the actor is gone.
    pub fn post(&self, msg: ControlMessage) -> bool {
        self.cmd_tx.send(Command::Control(self.id, msg)).is_ok()
    }
}

impl PortRx {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }
}

impl Drop for PortRx {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Detach(self.id));
    }
}

/// Spawn the shared connection actor on the current runtime.
pub fn spawn() -> SharedConnectionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let actor = Actor {
        url: None,
        ports: HashMap::new(),
        link: LinkState::Idle,
        epoch: 0,
        sid: None,
        link_tx,
    };
    tokio::spawn(actor.run(cmd_rx, link_rx));
    SharedConnectionHandle {
        cmd_tx,
        next_port: Arc::new(AtomicU64::new(1)),
    }
}

struct PortEntry {
    tx: mpsc::UnboundedSender<WireMessage>,
    last_pong: Instant,
}

enum LinkState {
    Idle,
    Connecting,
    Open { writer: mpsc::UnboundedSender<String> },
}

struct Actor {
    url: Option<String>,
    ports: HashMap<PortId, PortEntry>,
    link: LinkState,
    /// Bumped on every dial; events from older dials are ignored
    epoch: u64,
    /// Set once the gateway announced the session; cleared on loss
    sid: Option<String>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("shared connection: all handles dropped, stopping");
                        return;
                    };
                    self.handle_command(cmd);
                }
                Some(event) = link_rx.recv() => self.handle_link_event(event),
                _ = ping.tick() => self.ping_ports(),
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        trace!(?cmd, "shared connection command");
        match cmd {
            Command::Attach { id, tx } => {
                self.ports.insert(
                    id,
                    PortEntry {
                        tx,
                        last_pong: Instant::now(),
                    },
                );
                debug!(port = id, ports = self.ports.len(), "port attached");
            }
            Command::Detach(id) => {
                if self.ports.remove(&id).is_some() {
                    debug!(port = id, ports = self.ports.len(), "port detached");
                }
            }
            Command::Control(id, msg) => self.handle_control(id, msg),
        }
    }

    fn handle_control(&mut self, id: PortId, msg: ControlMessage) {
        match msg {
            ControlMessage::Config { url } => {
                let url = normalize_url(&url);
                if self.url.as_deref() == Some(url.as_str()) {
                    return;
                }
                info!(%url, "gateway url configured");
                let had_link = !matches!(self.link, LinkState::Idle);
                self.url = Some(url);
                if had_link {
                    self.drop_link("gateway url changed");
                    self.dial();
                }
            }
            ControlMessage::Init => match (&self.link, &self.sid) {
                (LinkState::Open { .. }, Some(sid)) => {
                    let msg = WireMessage::Connect(sid.clone());
                    self.send_to(id, msg);
                }
                (LinkState::Idle, _) => self.dial(),
                _ => {}
            },
            ControlMessage::Reconnect => {
                if matches!(self.link, LinkState::Idle) {
                    self.dial();
                }
            }
            ControlMessage::Emit(frame) => self.emit(frame),
            ControlMessage::Pong => {
                if let Some(port) = self.ports.get_mut(&id) {
                    port.last_pong = Instant::now();
                }
            }
        }
    }

    fn emit(&mut self, frame: EmitFrame) {
        let LinkState::Open { writer } = &self.link else {
            debug!(kind = %frame.kind, "emit dropped: link not open");
            return;
        };
        match serde_json::to_string(&frame) {
            Ok(line) => {
                if writer.send(line).is_err() {
                    debug!(kind = %frame.kind, "emit dropped: writer gone");
                }
            }
            Err(e) => warn!(kind = %frame.kind, error = %e, "failed to encode emit"),
        }
    }

    fn dial(&mut self) {
        let Some(url) = self.url.clone() else {
            debug!("dial skipped: no gateway url configured");
            return;
        };
        let endpoint = match Endpoint::parse(&url) {
            Ok(e) => e,
            Err(e) => {
                warn!(%url, error = %e, "cannot dial gateway");
                return;
            }
        };

        self.epoch += 1;
        self.link = LinkState::Connecting;
        let epoch = self.epoch;
        let events = self.link_tx.clone();
        debug!(%endpoint, epoch, "dialing gateway");
        tokio::spawn(run_link(endpoint, epoch, events));
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened { epoch, writer } => {
                if epoch != self.epoch {
                    return;
                }
                info!(epoch, "gateway link open");
                self.link = LinkState::Open { writer };
            }
            LinkEvent::Line { epoch, line } => {
                if epoch != self.epoch {
                    return;
                }
                match serde_json::from_str::<WireMessage>(&line) {
                    Ok(msg) => self.handle_frame(msg),
                    Err(e) => trace!(error = %e, "dropping unparsable gateway frame"),
                }
            }
            LinkEvent::Closed { epoch, reason } => {
                if epoch != self.epoch {
                    return;
                }
                self.drop_link(&reason);
                self.schedule_retry();
            }
            LinkEvent::Retry { epoch } => {
                if epoch == self.epoch && matches!(self.link, LinkState::Idle) {
                    debug!(epoch, "retrying gateway link");
                    self.dial();
                }
            }
        }
    }

    fn handle_frame(&mut self, msg: WireMessage) {
        match msg {
            WireMessage::Connect(sid) => {
                info!(%sid, "session connected");
                self.sid = Some(sid.clone());
                self.broadcast(WireMessage::Connect(sid));
            }
            WireMessage::Sid(sid) => {
                self.sid = Some(sid.clone());
                self.broadcast(WireMessage::Sid(sid));
            }
            WireMessage::Message(payload) => self.broadcast(WireMessage::Message(payload)),
            WireMessage::Disconnect => {
                self.drop_link("gateway sent disconnect");
                self.schedule_retry();
            }
            WireMessage::Ping => trace!("ignoring gateway ping"),
        }
    }

    /// Tear down the current link and tell every port if a session was live.
    fn drop_link(&mut self, reason: &str) {
        // Stale reader events must not resurrect this link.
        self.epoch += 1;
        self.link = LinkState::Idle;
        if let Some(sid) = self.sid.take() {
            info!(%sid, %reason, "session disconnected");
            self.broadcast(WireMessage::Disconnect);
        } else {
            debug!(%reason, "gateway link closed");
        }
    }

    /// Re-dial after [`RECONNECT_DELAY`] unless another dial happens first.
    fn schedule_retry(&self) {
        let epoch = self.epoch;
        let events = self.link_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            let _ = events.send(LinkEvent::Retry { epoch });
        });
    }

    fn send_to(&mut self, id: PortId, msg: WireMessage) {
        if let Some(port) = self.ports.get(&id)
            && port.tx.send(msg).is_err()
        {
            self.ports.remove(&id);
        }
    }

    fn broadcast(&mut self, msg: WireMessage) {
        self.ports.retain(|id, port| {
            let alive = port.tx.send(msg.clone()).is_ok();
            if !alive {
                debug!(port = *id, "pruning closed port");
            }
            alive
        });
    }

    fn ping_ports(&mut self) {
        let now = Instant::now();
        let deadline = PING_INTERVAL * PING_GRACE;
        self.ports.retain(|id, port| {
            if now.duration_since(port.last_pong) > deadline {
                debug!(port = *id, "pruning unresponsive port");
                return false;
            }
            port.tx.send(WireMessage::Ping).is_ok()
        });
    }
}

/// Dial, then pump lines both ways until the link dies.
async fn run_link(endpoint: Endpoint, epoch: u64, events: mpsc::UnboundedSender<LinkEvent>) {
    let stream = match endpoint.connect().await {
        Ok(s) => s,
        Err(e) => {
            let _ = events.send(LinkEvent::Closed {
                epoch,
                reason: e.to_string(),
            });
            return;
        }
    };

    let (reader, mut writer) = tokio::io::split(stream);
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(mut line) = line_rx.recv().await {
            line.push('\n');
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                debug!(error = %e, "gateway write failed");
                return;
            }
        }
        // Writer dropped: the link was abandoned. Half-close so the gateway
        // sees EOF and the reader below winds down.
        let _ = writer.shutdown().await;
    });

    if events
        .send(LinkEvent::Opened {
            epoch,
            writer: line_tx,
        })
        .is_err()
    {
        return;
    }

    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if events.send(LinkEvent::Line { epoch, line }).is_err() {
                    return;
                }
            }
            Ok(None) => break "gateway closed the link".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    let _ = events.send(LinkEvent::Closed { epoch, reason });
}
