//! Client sessions on the master.
//!
//! Each accepted client connection becomes a session: a task that tags every
//! inbound line with the session id and funnels it into the coordinator's mux
//! channel, plus an outbox the coordinator uses to write replies back. On
//! client EOF or error the session posts a `Closed` event so the coordinator
//! forgets it. Session ids count up monotonically and are never reused
//! within a master process.

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::framing;

/// Events flowing from sessions into the coordinator; the in-process form of
/// the `CLIENT<N>:<request>` / `CLIENT<N>:CLOS` wire convention.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Request { id: u64, body: String },
    Closed { id: u64 },
}

pub struct SessionHandle {
    pub id: u64,
    pub outbox: mpsc::Sender<String>,
}

/// Starts the session task for an accepted client connection.
pub fn spawn(stream: TcpStream, id: u64, mux: mpsc::Sender<SessionEvent>) -> SessionHandle {
    let wire = framing::pump(stream, "client");
    info!(peer = %wire.peer, session = id, "client connected");

    let mut incoming = wire.incoming;
    tokio::spawn(async move {
        while let Some(line) = incoming.recv().await {
            if mux.send(SessionEvent::Request { id, body: line }).await.is_err() {
                return;
            }
        }
        let _ = mux.send(SessionEvent::Closed { id }).await;
        debug!(session = id, "session closed");
    });

    SessionHandle {
        id,
        outbox: wire.outgoing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn sessions_tag_requests_and_report_closure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (mux_tx, mut mux_rx) = mpsc::channel(8);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let handle = spawn(accepted, 4, mux_tx);

        client.write_all(b"GET \"x\"\n").await.unwrap();
        assert_eq!(
            mux_rx.recv().await.unwrap(),
            SessionEvent::Request {
                id: 4,
                body: "GET \"x\"".to_string()
            }
        );

        handle.outbox.send("<nil>".to_string()).await.unwrap();
        let mut reader = BufReader::new(&mut client);
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "<nil>\n");

        drop(client);
        assert_eq!(mux_rx.recv().await.unwrap(), SessionEvent::Closed { id: 4 });
    }
}
