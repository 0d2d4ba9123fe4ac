//! The master: session frontend and replication coordinator.
//!
//! The coordinator owns everything: the client listener, the session map, and
//! the two peer slots. One event loop selects across the session mux, both
//! peer connections, client accepts, the wait-for-backup handshake, and a
//! tick. Peers are health-checked with `SYN:STAT` heartbeats; a primary that
//! closes its connection or misses the ack deadline is replaced by promoting
//! the backup, and a lost backup is replaced by waiting for a new node on the
//! server port.
//!
//! Each peer slot moves through a fixed set of states: absent (no slot,
//! wait-for-backup outstanding), handshaking (inside `adopt_*`, a `SYN` sent
//! and its ack pending), healthy, and suspect (heartbeat sent, ack pending).
//! `ACK`/`ERR` traffic clears suspect back to healthy; a close or an ack
//! outstanding past `DEADLINE` fails the peer.

use std::collections::HashMap;
use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{MasterConfig, DEADLINE, TICK_INTERVAL, WAIT_PERIOD};
use crate::framing::{self, Wire};
use crate::protocol::{Ack, Fault, Message, Syn, REFUSED};
use crate::session::{self, SessionEvent};

/// Capacity of the funnel all sessions share.
const MUX_BUFFER: usize = 256;

/// What a client sees when the node behind the master refuses its request.
const NOT_READY: &str = "server not ready, please retry";

pub struct Master {
    config: MasterConfig,
    client_listener: TcpListener,
    server_listener: Arc<TcpListener>,
}

impl Master {
    /// Binds the client and server listeners. Failing to get either socket is
    /// fatal for the process.
    pub async fn bind(config: MasterConfig) -> Result<Self> {
        let client_listener = TcpListener::bind(config.client_listen)
            .await
            .with_context(|| format!("unable to bind client port {}", config.client_listen))?;
        let server_listener = TcpListener::bind(config.server_listen)
            .await
            .with_context(|| format!("unable to bind server port {}", config.server_listen))?;
        Ok(Self {
            config,
            client_listener,
            server_listener: Arc::new(server_listener),
        })
    }

    pub fn client_addr(&self) -> io::Result<SocketAddr> {
        self.client_listener.local_addr()
    }

    pub fn server_addr(&self) -> io::Result<SocketAddr> {
        self.server_listener.local_addr()
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// Adopts a primary and a backup, then serves clients until `shutdown`
    /// resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Master {
            config,
            client_listener,
            server_listener,
        } = self;
        tokio::pin!(shutdown);

        info!("waiting for server connections...");
        let primary_wire = tokio::select! {
            wire = adopt_primary(&server_listener) => wire,
            _ = &mut shutdown => return Ok(()),
        };
        let primary = PeerSlot {
            wire: primary_wire,
            addr: config.primary_peer,
            state: PeerState::Healthy,
        };
        info!(addr = %primary.addr, "primary is running");

        let backup_wire = tokio::select! {
            wire = adopt_backup(&server_listener, primary.addr) => wire,
            _ = &mut shutdown => return Ok(()),
        };
        let backup = PeerSlot {
            wire: backup_wire,
            addr: config.backup_peer,
            state: PeerState::Healthy,
        };
        info!(addr = %backup.addr, "backup is running");

        let (mux_tx, mux_rx) = mpsc::channel(MUX_BUFFER);
        let coordinator = Coordinator {
            client_listener,
            server_listener,
            node_addrs: [config.primary_peer, config.backup_peer],
            primary,
            backup: Some(backup),
            backup_waiter: None,
            sessions: HashMap::new(),
            next_session: 0,
            mux_tx,
            mux_rx,
            last_heartbeat: Instant::now(),
        };
        coordinator.run(&mut shutdown).await
    }
}

struct PeerSlot {
    wire: Wire,
    /// Peer-port address advertised to a joining backup in `SYN:PRIM`.
    addr: SocketAddr,
    state: PeerState,
}

#[derive(Debug, Clone, Copy)]
enum PeerState {
    Healthy,
    /// Heartbeat sent, ack outstanding since the given instant.
    Suspect(Instant),
}

struct Coordinator {
    client_listener: TcpListener,
    server_listener: Arc<TcpListener>,
    /// The two configured node peer addresses.
    node_addrs: [SocketAddr; 2],
    primary: PeerSlot,
    backup: Option<PeerSlot>,
    backup_waiter: Option<(JoinHandle<()>, oneshot::Receiver<Wire>)>,
    sessions: HashMap<u64, mpsc::Sender<String>>,
    next_session: u64,
    mux_tx: mpsc::Sender<SessionEvent>,
    mux_rx: mpsc::Receiver<SessionEvent>,
    last_heartbeat: Instant,
}

impl Coordinator {
    async fn run<F>(mut self, mut shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Unpin,
    {
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down");
                    break;
                }
                event = self.mux_rx.recv() => {
                    // The coordinator holds a sender, so the mux never closes.
                    if let Some(event) = event {
                        self.handle_session_event(event).await;
                    }
                }
                line = self.primary.wire.incoming.recv() => {
                    match line {
                        Some(line) => self.handle_primary_line(line).await,
                        None => {
                            warn!("primary connection closed");
                            self.failover().await;
                        }
                    }
                }
                line = backup_recv(&mut self.backup) => {
                    match line {
                        Some(line) => self.handle_backup_line(line).await,
                        None => {
                            warn!("backup connection closed");
                            self.backup = None;
                            self.spawn_backup_waiter();
                        }
                    }
                }
                adopted = waiter_recv(&mut self.backup_waiter) => {
                    self.backup_waiter = None;
                    match adopted {
                        Ok(wire) => {
                            let addr = self.replacement_addr();
                            info!(addr = %addr, "backup is running");
                            self.backup = Some(PeerSlot {
                                wire,
                                addr,
                                state: PeerState::Healthy,
                            });
                        }
                        Err(_) => {
                            warn!("backup waiter died, restarting it");
                            self.spawn_backup_waiter();
                        }
                    }
                }
                conn = self.client_listener.accept() => {
                    match conn {
                        Ok((stream, _)) => self.accept_session(stream),
                        Err(err) => warn!(error = ?err, "failed to accept client"),
                    }
                }
                _ = sleep(TICK_INTERVAL) => {}
            }
            self.tick().await;
        }
        Ok(())
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Request { id, body } => {
                let request = Message::Client { session: id, body };
                if self
                    .primary
                    .wire
                    .outgoing
                    .send(request.to_string())
                    .await
                    .is_err()
                {
                    debug!(session = id, "primary writer gone, dropping request");
                }
            }
            SessionEvent::Closed { id } => {
                self.sessions.remove(&id);
                debug!(session = id, "forgot session");
            }
        }
    }

    async fn handle_primary_line(&mut self, line: String) {
        let message = match line.parse::<Message>() {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, line = %line, "malformed message from primary");
                self.send_primary(Message::Fault(Fault::Invalid)).await;
                return;
            }
        };
        match message {
            Message::Client { session, body } => {
                // A node that is not (yet) primary refuses tagged requests;
                // clients get readable text, not protocol internals.
                let body = if body == REFUSED {
                    NOT_READY.to_string()
                } else {
                    body
                };
                match self.sessions.get(&session) {
                    Some(outbox) => {
                        let _ = outbox.send(body).await;
                    }
                    None => debug!(session, "reply for an unknown session"),
                }
            }
            Message::Ack(_) | Message::Fault(_) => {
                if matches!(self.primary.state, PeerState::Suspect(_)) {
                    self.primary.state = PeerState::Healthy;
                    debug!("primary heartbeat acknowledged");
                } else {
                    debug!(line = %line, "unexpected reply from primary");
                }
            }
            Message::Syn(_) => {
                warn!(line = %line, "unexpected request from primary");
                self.send_primary(Message::Fault(Fault::Unknown)).await;
            }
        }
    }

    async fn handle_backup_line(&mut self, line: String) {
        let message = match line.parse::<Message>() {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, line = %line, "malformed message from backup");
                self.send_backup(Message::Fault(Fault::Invalid)).await;
                return;
            }
        };
        match message {
            Message::Ack(_) | Message::Fault(_) => {
                if let Some(slot) = &mut self.backup {
                    if matches!(slot.state, PeerState::Suspect(_)) {
                        slot.state = PeerState::Healthy;
                        debug!("backup heartbeat acknowledged");
                    } else {
                        debug!(line = %line, "unexpected reply from backup");
                    }
                }
            }
            Message::Syn(_) | Message::Client { .. } => {
                warn!(line = %line, "unexpected request from backup");
                self.send_backup(Message::Fault(Fault::Unknown)).await;
            }
        }
    }

    fn accept_session(&mut self, stream: TcpStream) {
        let id = self.next_session;
        self.next_session += 1;
        let handle = session::spawn(stream, id, self.mux_tx.clone());
        self.sessions.insert(handle.id, handle.outbox);
    }

    /// Heartbeats and deadline checks, run after every handled event. If both
    /// peers fail in the same tick the primary is replaced first, so a live
    /// backup can serve immediately.
    async fn tick(&mut self) {
        let now = Instant::now();
        if let PeerState::Suspect(since) = self.primary.state {
            if now.duration_since(since) > DEADLINE {
                warn!("primary heartbeat deadline exceeded");
                self.failover().await;
            }
        }
        if let Some(slot) = &self.backup {
            if let PeerState::Suspect(since) = slot.state {
                if now.duration_since(since) > DEADLINE {
                    warn!("backup heartbeat deadline exceeded");
                    self.backup = None;
                    self.spawn_backup_waiter();
                }
            }
        }
        if self.last_heartbeat.elapsed() > WAIT_PERIOD {
            self.last_heartbeat = Instant::now();
            self.ping_peers().await;
        }
    }

    async fn ping_peers(&mut self) {
        let ping = Message::Syn(Syn::Status).to_string();
        if matches!(self.primary.state, PeerState::Healthy)
            && self
                .primary
                .wire
                .outgoing
                .send(ping.clone())
                .await
                .is_ok()
        {
            self.primary.state = PeerState::Suspect(Instant::now());
        }
        if let Some(slot) = &mut self.backup {
            if matches!(slot.state, PeerState::Healthy)
                && slot.wire.outgoing.send(ping).await.is_ok()
            {
                slot.state = PeerState::Suspect(Instant::now());
            }
        }
    }

    /// Replaces a failed primary: promote the backup if there is one,
    /// otherwise fall back to a blocking accept on the server port. Either
    /// way a wait for a replacement backup is started afterwards.
    async fn failover(&mut self) {
        warn!("starting failover");
        let promoted = match self.backup.take() {
            Some(mut slot) => {
                if handshake(&mut slot.wire, Message::Syn(Syn::Promote)).await {
                    info!(addr = %slot.addr, "backup promoted to primary");
                    slot.state = PeerState::Healthy;
                    self.primary = slot;
                    true
                } else {
                    warn!("backup refused promotion or went away");
                    false
                }
            }
            None => false,
        };
        if !promoted {
            self.adopt_primary_blocking().await;
        }
        self.spawn_backup_waiter();
    }

    async fn adopt_primary_blocking(&mut self) {
        if let Some((waiter, _)) = self.backup_waiter.take() {
            waiter.abort();
        }
        let wire = adopt_primary(&self.server_listener).await;
        // With both nodes gone there is nothing identifying the reconnecting
        // node, so the slot keeps its previous advertised address.
        let addr = self.primary.addr;
        info!(addr = %addr, "primary is running");
        self.primary = PeerSlot {
            wire,
            addr,
            state: PeerState::Healthy,
        };
    }

    fn spawn_backup_waiter(&mut self) {
        if self.backup.is_some() || self.backup_waiter.is_some() {
            return;
        }
        let listener = self.server_listener.clone();
        let primary_addr = self.primary.addr;
        let (tx, rx) = oneshot::channel();
        let waiter = tokio::spawn(async move {
            let wire = adopt_backup(&listener, primary_addr).await;
            let _ = tx.send(wire);
        });
        self.backup_waiter = Some((waiter, rx));
        info!("waiting for a backup node");
    }

    /// The configured node address not currently serving as primary.
    fn replacement_addr(&self) -> SocketAddr {
        self.node_addrs
            .iter()
            .copied()
            .find(|addr| *addr != self.primary.addr)
            .unwrap_or(self.node_addrs[1])
    }

    async fn send_primary(&self, message: Message) {
        if self
            .primary
            .wire
            .outgoing
            .send(message.to_string())
            .await
            .is_err()
        {
            debug!("primary writer closed");
        }
    }

    async fn send_backup(&self, message: Message) {
        if let Some(slot) = &self.backup {
            if slot.wire.outgoing.send(message.to_string()).await.is_err() {
                debug!("backup writer closed");
            }
        }
    }
}

/// Accepts connections on the server port until one completes the
/// `SYN:PROM` / `ACK:OK` promotion handshake.
async fn adopt_primary(listener: &TcpListener) -> Wire {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = ?err, "failed to accept node");
                continue;
            }
        };
        info!(peer = %peer, "node connected, promoting");
        let mut wire = framing::pump(stream, "primary");
        if handshake(&mut wire, Message::Syn(Syn::Promote)).await {
            return wire;
        }
        warn!(peer = %peer, "promotion handshake failed");
    }
}

/// Accepts connections on the server port until one completes the
/// `SYN:STAT` handshake and acknowledges `SYN:PRIM=<addr>`, at which point it
/// has dialed the primary and is replicating.
async fn adopt_backup(listener: &TcpListener, primary_addr: SocketAddr) -> Wire {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = ?err, "failed to accept node");
                continue;
            }
        };
        info!(peer = %peer, "node connected, checking status");
        let mut wire = framing::pump(stream, "backup");
        if !handshake(&mut wire, Message::Syn(Syn::Status)).await {
            warn!(peer = %peer, "status handshake failed");
            continue;
        }
        if !handshake(&mut wire, Message::Syn(Syn::Primary(primary_addr.to_string()))).await {
            warn!(peer = %peer, "backup could not reach the primary");
            continue;
        }
        return wire;
    }
}

/// Sends one `SYN` and waits up to `DEADLINE` for `ACK:OK`.
async fn handshake(wire: &mut Wire, syn: Message) -> bool {
    if wire.outgoing.send(syn.to_string()).await.is_err() {
        return false;
    }
    match timeout(DEADLINE, wire.incoming.recv()).await {
        Ok(Some(line)) => matches!(line.parse::<Message>(), Ok(Message::Ack(Ack::Ok))),
        _ => false,
    }
}

async fn backup_recv(backup: &mut Option<PeerSlot>) -> Option<String> {
    match backup {
        Some(slot) => slot.wire.incoming.recv().await,
        None => future::pending().await,
    }
}

async fn waiter_recv(
    waiter: &mut Option<(JoinHandle<()>, oneshot::Receiver<Wire>)>,
) -> Result<Wire, oneshot::error::RecvError> {
    match waiter {
        Some((_, rx)) => rx.await,
        None => future::pending().await,
    }
}
