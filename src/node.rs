//! The data node: a store plus the serving loop that speaks to the master
//! and to its peer node.
//!
//! A node starts life role-less: it dials the master and waits to be told
//! `SYN:PROM` (become primary) or `SYN:STAT` (stay backup). The primary
//! executes tagged client requests from the master and streams every
//! successful mutation to its backup as `SYN:DIFF=<request>` messages, one at
//! a time, retransmitting the head of the queue until it is acknowledged.
//! The backup applies diffs in arrival order, which is primary execution
//! order, so the two stores converge once the queue drains.

use std::collections::VecDeque;
use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{self, NodeConfig, DIAL_TIMEOUT, PEER_PORT};
use crate::framing::{self, Wire};
use crate::protocol::{Ack, Fault, Message, Syn, REFUSED};
use crate::store::Store;

pub struct Node {
    config: NodeConfig,
    store: Arc<Store>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let store = Arc::new(Store::open(&config.data_dir));
        Self { config, store }
    }

    /// Handle on this node's store, shared so callers can inspect state.
    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Dials the master and serves until it disconnects or `shutdown`
    /// resolves. The store is flushed on the way out.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Node { config, store } = self;

        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(config.master))
            .await
            .context("timed out dialing master")?
            .with_context(|| format!("failed to connect to master at {}", config.master))?;
        info!(master = %config.master, "connected to master");

        let mut serving = Serving {
            store: store.clone(),
            peer_listen: config.peer_listen,
            master: framing::pump(stream, "master"),
            is_primary: false,
            pending: VecDeque::new(),
            diff_in_flight: false,
            peer: None,
            peer_listener: None,
        };

        tokio::pin!(shutdown);
        loop {
            let want_backup = serving.is_primary && serving.peer.is_none();
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, flushing buffers to disk");
                    break;
                }
                line = serving.master.incoming.recv() => {
                    match line {
                        Some(line) => serving.handle_master_line(line).await?,
                        None => {
                            warn!("master connection closed, shutting down");
                            break;
                        }
                    }
                }
                line = peer_recv(&mut serving.peer) => {
                    match line {
                        Some(line) => serving.handle_peer_line(line).await,
                        None => serving.handle_peer_loss(),
                    }
                }
                conn = peer_accept(serving.peer_listener.as_ref(), want_backup) => {
                    match conn {
                        Ok((stream, peer)) => {
                            info!(peer = %peer, "backup connected");
                            serving.peer = Some(framing::pump(stream, "peer"));
                            serving.diff_in_flight = false;
                        }
                        Err(err) => warn!(error = ?err, "failed to accept backup"),
                    }
                }
            }
            serving.maybe_send_diff().await;
        }

        store.flush().context("failed to flush store")?;
        info!("store flushed, goodbye");
        Ok(())
    }
}

/// Loop state for one serving node. Owned by a single task; the peer link and
/// the diff queue never need a lock.
struct Serving {
    store: Arc<Store>,
    peer_listen: SocketAddr,
    master: Wire,
    is_primary: bool,
    /// Mutations awaiting acknowledgement from the backup, oldest first.
    pending: VecDeque<String>,
    /// Whether the head of `pending` has been sent and not yet acknowledged.
    diff_in_flight: bool,
    peer: Option<Wire>,
    peer_listener: Option<TcpListener>,
}

impl Serving {
    async fn handle_master_line(&mut self, line: String) -> Result<()> {
        let message = match line.parse::<Message>() {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, line = %line, "malformed message from master");
                self.send_master(Message::Fault(Fault::Invalid)).await;
                return Ok(());
            }
        };
        match message {
            Message::Syn(Syn::Promote) => {
                if self.is_primary {
                    self.send_master(Message::Ack(Ack::Neg)).await;
                } else {
                    self.become_primary().await?;
                    self.send_master(Message::Ack(Ack::Ok)).await;
                }
            }
            Message::Syn(Syn::Status) => self.send_master(Message::Ack(Ack::Ok)).await,
            Message::Syn(Syn::Primary(addr)) => match self.dial_primary(&addr).await {
                Ok(wire) => {
                    self.peer = Some(wire);
                    self.send_master(Message::Ack(Ack::Ok)).await;
                }
                Err(err) => {
                    warn!(error = %err, "cannot reach primary");
                    self.send_master(Message::Ack(Ack::Neg)).await;
                }
            },
            Message::Syn(Syn::Diff(_)) => {
                self.send_master(Message::Fault(Fault::Unknown)).await;
            }
            Message::Client { session, body } => self.handle_client_request(session, body).await,
            Message::Ack(_) | Message::Fault(_) => {
                debug!(line = %line, "ignoring stray reply from master");
            }
        }
        Ok(())
    }

    async fn handle_client_request(&mut self, session: u64, body: String) {
        if !self.is_primary {
            self.send_master(Message::client(session, REFUSED)).await;
            return;
        }
        let (reply, mutated) = self.store.execute_tracked(&body);
        // The diff is queued before the reply leaves, so replication order
        // matches execution order.
        if mutated {
            self.pending.push_back(body);
        }
        self.send_master(Message::Client {
            session,
            body: reply,
        })
        .await;
    }

    async fn handle_peer_line(&mut self, line: String) {
        let message = match line.parse::<Message>() {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, line = %line, "malformed message from peer");
                self.send_peer(Message::Fault(Fault::Invalid)).await;
                return;
            }
        };
        if self.is_primary {
            match message {
                Message::Ack(Ack::Ok) => {
                    self.pending.pop_front();
                    self.diff_in_flight = false;
                }
                Message::Ack(Ack::Neg) | Message::Fault(_) => {
                    warn!("backup rejected diff, retransmitting");
                    self.diff_in_flight = false;
                }
                other => {
                    debug!(message = %other, "unexpected message from backup");
                    self.send_peer(Message::Fault(Fault::Unknown)).await;
                }
            }
        } else {
            match message {
                Message::Syn(Syn::Diff(request)) => {
                    let _ = self.store.execute(&request);
                    self.send_peer(Message::Ack(Ack::Ok)).await;
                }
                other => {
                    debug!(message = %other, "unexpected message from primary");
                    self.send_peer(Message::Fault(Fault::Unknown)).await;
                }
            }
        }
    }

    fn handle_peer_loss(&mut self) {
        self.peer = None;
        self.diff_in_flight = false;
        if self.is_primary {
            warn!("backup disconnected, diffs queue until a replacement joins");
        } else {
            warn!("primary disconnected");
        }
    }

    /// Sends the head of the pending queue when nothing is in flight. Called
    /// after every handled event.
    async fn maybe_send_diff(&mut self) {
        if !self.is_primary || self.diff_in_flight {
            return;
        }
        let (Some(peer), Some(head)) = (self.peer.as_ref(), self.pending.front()) else {
            return;
        };
        let diff = Message::Syn(Syn::Diff(head.clone()));
        if peer.outgoing.send(diff.to_string()).await.is_ok() {
            self.diff_in_flight = true;
        }
    }

    async fn become_primary(&mut self) -> Result<()> {
        let listener = TcpListener::bind(self.peer_listen)
            .await
            .with_context(|| format!("failed to bind peer port {}", self.peer_listen))?;
        info!(peer_listen = %self.peer_listen, "promoted to primary");
        self.is_primary = true;
        self.peer_listener = Some(listener);
        self.peer = None;
        self.diff_in_flight = false;
        Ok(())
    }

    async fn dial_primary(&self, addr: &str) -> Result<Wire> {
        let addr = config::socket_addr(addr, PEER_PORT)?;
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .context("timed out dialing primary")?
            .with_context(|| format!("failed to connect to primary at {addr}"))?;
        info!(primary = %addr, "connected to primary");
        Ok(framing::pump(stream, "peer"))
    }

    async fn send_master(&self, message: Message) {
        if self.master.outgoing.send(message.to_string()).await.is_err() {
            debug!("master writer closed");
        }
    }

    async fn send_peer(&self, message: Message) {
        if let Some(peer) = &self.peer {
            if peer.outgoing.send(message.to_string()).await.is_err() {
                debug!("peer writer closed");
            }
        }
    }
}

async fn peer_recv(peer: &mut Option<Wire>) -> Option<String> {
    match peer {
        Some(wire) => wire.incoming.recv().await,
        None => future::pending().await,
    }
}

async fn peer_accept(
    listener: Option<&TcpListener>,
    want: bool,
) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) if want => listener.accept().await,
        _ => future::pending().await,
    }
}
