//! Replicated in-memory key-value store with primary/backup failover.
//!
//! The cluster has three roles: one **master** that owns all client sessions
//! and coordinates failover, and two data **nodes**, of which one is promoted
//! to primary and the other replicates its mutations as a backup. Clients
//! speak a newline-delimited text protocol (GET/SET/INCR/…); the master tags
//! every client line with a session id and funnels all sessions into a single
//! channel to the primary, which executes commands against its in-memory
//! store and streams successful mutations to the backup. When the primary
//! dies, the master promotes the backup and waits for a replacement.
//!
//! # Modules
//!
//! - [`framing`]: line framing and the per-connection I/O pump tasks
//! - [`protocol`]: the `HEADER:BODY` cluster wire messages
//! - [`store`]: the key-value engine, command dispatcher, and persistence
//! - [`node`]: the primary/backup data node
//! - [`session`]: per-client session tasks on the master
//! - [`coordinator`]: the master's heartbeat/promotion event loop
//! - [`config`]: the `servers` file and cluster-wide constants
//! - [`client`]: the interactive command-line client loop

pub mod client;
pub mod config;
pub mod coordinator;
pub mod framing;
pub mod node;
pub mod protocol;
pub mod session;
pub mod store;

pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
