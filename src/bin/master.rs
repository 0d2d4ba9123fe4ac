use std::path::Path;

use anyhow::Result;
use tracing::info;

use failover_kv::config::{MasterConfig, CONFIG_FILE};
use failover_kv::coordinator::Master;
use failover_kv::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = MasterConfig::load(Path::new(CONFIG_FILE))?;
    let master = Master::bind(config).await?;
    info!(
        clients = %master.client_addr()?,
        nodes = %master.server_addr()?,
        "master listening; connect with `cli` in another window"
    );
    master.run_until_ctrl_c().await
}
