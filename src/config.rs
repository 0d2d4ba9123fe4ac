//! Cluster configuration: the `servers` file and shared timing constants.
//!
//! Every process reads the same `servers` file at startup. Each line is
//! `ROLE ADDRESS` (`#` introduces a comment): `primary` and `backup` name the
//! two data nodes' peer addresses and are used by the master, `master` names
//! the master's server port and is used by nodes, `self` is a node's own peer
//! listen address, and `dir PATH` sets the directory holding the `log` and
//! `dump` files. A bare IP address gets the role's default port.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Port clients connect to on the master.
pub const CLIENT_PORT: u16 = 8000;
/// Port nodes dial on the master for control traffic.
pub const SERVER_PORT: u16 = 8080;
/// Port the primary listens on for its backup.
pub const PEER_PORT: u16 = 9000;

/// Interval between heartbeat rounds.
pub const WAIT_PERIOD: Duration = Duration::from_secs(15);
/// How long a peer may leave a heartbeat unacknowledged before it is
/// considered dead.
pub const DEADLINE: Duration = Duration::from_secs(5);
/// Connect timeout for every outbound dial.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Coordinator tick granularity.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Default configuration file, resolved against the working directory.
pub const CONFIG_FILE: &str = "servers";

/// Settings the master needs: where to listen and where the two data nodes
/// will be reachable for peer traffic.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub client_listen: SocketAddr,
    pub server_listen: SocketAddr,
    pub primary_peer: SocketAddr,
    pub backup_peer: SocketAddr,
}

/// Settings a data node needs: the master to dial, its own peer listen
/// address, and where to keep the `log` and `dump` files.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub master: SocketAddr,
    pub peer_listen: SocketAddr,
    pub data_dir: PathBuf,
}

impl MasterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = RawConfig::load(path)?;
        Ok(Self {
            client_listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), CLIENT_PORT),
            server_listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), SERVER_PORT),
            primary_peer: raw.require(raw.primary, "primary", path)?,
            backup_peer: raw.require(raw.backup, "backup", path)?,
        })
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = RawConfig::load(path)?;
        Ok(Self {
            master: raw.require(raw.master, "master", path)?,
            peer_listen: raw.require(raw.self_peer, "self", path)?,
            data_dir: raw.dir.unwrap_or_else(|| PathBuf::from(".")),
        })
    }
}

#[derive(Debug, Default)]
struct RawConfig {
    master: Option<SocketAddr>,
    primary: Option<SocketAddr>,
    backup: Option<SocketAddr>,
    self_peer: Option<SocketAddr>,
    dir: Option<PathBuf>,
}

impl RawConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    fn parse(text: &str) -> Result<Self> {
        let mut raw = RawConfig::default();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((role, value)) = line.split_once(char::is_whitespace) else {
                bail!("line {}: expected `ROLE ADDRESS`, got {line:?}", index + 1);
            };
            let value = value.trim();
            match role {
                "master" => raw.master = Some(socket_addr(value, SERVER_PORT)?),
                "primary" => raw.primary = Some(socket_addr(value, PEER_PORT)?),
                "backup" => raw.backup = Some(socket_addr(value, PEER_PORT)?),
                "self" => raw.self_peer = Some(socket_addr(value, PEER_PORT)?),
                "dir" => raw.dir = Some(PathBuf::from(value)),
                other => bail!("line {}: unknown role {other:?}", index + 1),
            }
        }
        Ok(raw)
    }

    fn require(&self, entry: Option<SocketAddr>, role: &str, path: &Path) -> Result<SocketAddr> {
        entry.with_context(|| format!("missing {role:?} entry in {}", path.display()))
    }
}

/// Parses `ip:port`, falling back to `default_port` when only an IP is given.
pub fn socket_addr(text: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = text.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip = text
        .parse::<IpAddr>()
        .with_context(|| format!("invalid address {text:?}"))?;
    Ok(SocketAddr::new(ip, default_port))
}
