use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;

use failover_kv::{client, init_tracing};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address of the master to connect to.
    #[arg(long, default_value = "127.0.0.1:8000")]
    server: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    client::run(cli.server).await
}
