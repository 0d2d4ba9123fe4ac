//! Interactive command-line client loop.
//!
//! Reads command lines from stdin, ships them to the master, and prints each
//! reply line, re-issuing the `> ` prompt after every exchange.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::select;
use tracing::warn;

use crate::framing;

pub async fn run(server: SocketAddr) -> Result<()> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    println!("Connected to server {server}");
    let mut wire = framing::pump(stream, "server");

    let mut stdin = BufReader::new(io::stdin());
    let mut input = String::new();
    prompt().await?;

    loop {
        input.clear();
        select! {
            reply = wire.incoming.recv() => {
                match reply {
                    Some(line) => {
                        if !line.is_empty() {
                            write_stdout(&line).await?;
                        }
                        prompt().await?;
                    }
                    None => {
                        write_stdout("server closed the connection").await?;
                        break;
                    }
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                let text = input.trim_end();
                if wire.outgoing.send(text.to_string()).await.is_err() {
                    write_stdout("server closed the connection").await?;
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn prompt() -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(b"> ").await?;
    stdout.flush().await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
