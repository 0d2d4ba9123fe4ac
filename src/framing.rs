//! Line framing and per-connection I/O pumps.
//!
//! Every TCP connection in the cluster is wrapped in two background tasks: an
//! inbound pump that reads newline-delimited UTF-8 lines into a channel, and
//! an outbound pump that writes queued lines back with a trailing newline.
//! This is the only module that touches byte-level socket I/O; everything
//! else exchanges plain `String` lines over the returned channels.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Per-direction channel capacity; senders back-pressure when a peer stalls.
pub const LINE_BUFFER: usize = 64;

/// A connection viewed as a pair of line streams.
///
/// The inbound stream closes on EOF or read error. Dropping the outbound
/// sender shuts the socket down, which is how connections are closed
/// everywhere in this crate.
pub struct Wire {
    pub incoming: mpsc::Receiver<String>,
    pub outgoing: mpsc::Sender<String>,
    pub peer: SocketAddr,
}

/// Spawns the two pump tasks for `stream` and returns its line streams.
/// `label` names the remote end in logs (`"master"`, `"client"`, ...).
pub fn pump(stream: TcpStream, label: &'static str) -> Wire {
    let peer = stream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
    let (read, mut write) = stream.into_split();
    let (in_tx, incoming) = mpsc::channel(LINE_BUFFER);
    let (outgoing, mut out_rx) = mpsc::channel::<String>(LINE_BUFFER);

    tokio::spawn(async move {
        let mut reader = BufReader::new(read);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if in_tx.send(trimmed.to_string()).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(label, peer = %peer, error = ?err, "read failed");
                    break;
                }
            }
        }
        info!(label, peer = %peer, "disconnected");
    });

    tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if write.write_all(line.as_bytes()).await.is_err()
                || write.write_all(b"\n").await.is_err()
                || write.flush().await.is_err()
            {
                break;
            }
        }
        let _ = write.shutdown().await;
        debug!(label, peer = %peer, "writer closed");
    });

    Wire {
        incoming,
        outgoing,
        peer,
    }
}
