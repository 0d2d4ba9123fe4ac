use std::path::Path;

use anyhow::Result;
use tracing::warn;

use failover_kv::config::{NodeConfig, CONFIG_FILE};
use failover_kv::init_tracing;
use failover_kv::node::Node;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = NodeConfig::load(Path::new(CONFIG_FILE))?;
    let node = Node::new(config);
    node.run_until(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
        }
    })
    .await
}
