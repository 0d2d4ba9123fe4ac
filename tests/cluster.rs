//! End-to-end scenarios against an in-process cluster: one master and two
//! data nodes on fixed localhost ports, driven through real client sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use failover_kv::config::{MasterConfig, NodeConfig};
use failover_kv::coordinator::Master;
use failover_kv::node::Node;
use failover_kv::store::Store;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

struct TestCluster {
    client_addr: SocketAddr,
    primary_task: JoinHandle<()>,
    backup_store: Arc<Store>,
    shutdowns: Vec<oneshot::Sender<()>>,
    _dirs: Vec<TempDir>,
}

impl TestCluster {
    /// Starts a master and two nodes on four sequential ports at `base_port`.
    /// The first node becomes primary, the second backup.
    async fn spawn(base_port: u16) -> Result<Self> {
        let addr = |offset: u16| -> SocketAddr {
            format!("127.0.0.1:{}", base_port + offset).parse().unwrap()
        };
        let client_addr = addr(0);
        let server_addr = addr(1);
        let primary_peer = addr(2);
        let backup_peer = addr(3);

        let master = Master::bind(MasterConfig {
            client_listen: client_addr,
            server_listen: server_addr,
            primary_peer,
            backup_peer,
        })
        .await?;
        let (master_shutdown, master_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = master
                .run_until(async {
                    let _ = master_rx.await;
                })
                .await;
        });

        let mut dirs = Vec::new();
        let mut shutdowns = vec![master_shutdown];
        let mut spawn_node = |peer_listen: SocketAddr| -> Result<(JoinHandle<()>, Arc<Store>)> {
            let dir = TempDir::new()?;
            let node = Node::new(NodeConfig {
                master: server_addr,
                peer_listen,
                data_dir: dir.path().to_path_buf(),
            });
            let store = node.store();
            let (shutdown, rx) = oneshot::channel::<()>();
            let task = tokio::spawn(async move {
                let _ = node
                    .run_until(async {
                        let _ = rx.await;
                    })
                    .await;
            });
            dirs.push(dir);
            shutdowns.push(shutdown);
            Ok((task, store))
        };

        let (primary_task, _primary_store) = spawn_node(primary_peer)?;
        // Let the first node win the promotion handshake before the second
        // node dials in.
        sleep(Duration::from_millis(200)).await;
        let (_backup_task, backup_store) = spawn_node(backup_peer)?;
        sleep(Duration::from_millis(300)).await;

        Ok(Self {
            client_addr,
            primary_task,
            backup_store,
            shutdowns,
            _dirs: dirs,
        })
    }

    async fn client(&self) -> Result<TestClient> {
        TestClient::connect(self.client_addr).await
    }

    fn shutdown(self) {
        for tx in self.shutdowns {
            let _ = tx.send(());
        }
    }
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to master at {addr}"))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn send(&mut self, request: &str) -> Result<String> {
        self.writer.write_all(request.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut reply = String::new();
        let bytes = timeout(REPLY_TIMEOUT, self.reader.read_line(&mut reply))
            .await
            .map_err(|_| anyhow!("timed out waiting for a reply to '{request}'"))??;
        if bytes == 0 {
            return Err(anyhow!("connection closed while waiting for '{request}'"));
        }
        Ok(reply.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[tokio::test]
async fn string_round_trip() -> Result<()> {
    let cluster = TestCluster::spawn(18100).await?;
    let mut client = cluster.client().await?;

    assert_eq!(client.send("SET \"x\" \"hello\"").await?, "OK");
    assert_eq!(client.send("GET \"x\"").await?, "\"hello\"");
    assert_eq!(client.send("DEL \"x\"").await?, "OK");
    assert_eq!(client.send("GET \"x\"").await?, "<nil>");

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn counter_overflow_is_reported_and_state_preserved() -> Result<()> {
    let cluster = TestCluster::spawn(18200).await?;
    let mut client = cluster.client().await?;

    assert_eq!(client.send("SET \"c\" \"9223372036854775806\"").await?, "OK");
    assert_eq!(client.send("INCR \"c\"").await?, "(int) 9223372036854775807");
    assert_eq!(
        client.send("INCR \"c\"").await?,
        "unable to \"INCR\", integer overflow"
    );
    assert_eq!(client.send("GET \"c\"").await?, "\"9223372036854775807\"");

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn list_semantics_end_to_end() -> Result<()> {
    let cluster = TestCluster::spawn(18300).await?;
    let mut client = cluster.client().await?;

    assert_eq!(client.send("RPUSH l a").await?, "(int) 1");
    assert_eq!(client.send("RPUSH l b").await?, "(int) 2");
    assert_eq!(client.send("LPUSH l z").await?, "(int) 3");
    assert_eq!(client.send("LRANGE l 0 -1").await?, "\"z\", \"a\", \"b\"");
    assert_eq!(client.send("RPOP l").await?, "\"b\"");
    assert_eq!(client.send("LLEN l").await?, "(int) 2");
    assert_eq!(client.send("LPOP l").await?, "\"z\"");
    assert_eq!(client.send("RPOP l").await?, "\"a\"");
    assert_eq!(client.send("LLEN l").await?, "(int) 0");

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn hash_new_versus_update() -> Result<()> {
    let cluster = TestCluster::spawn(18400).await?;
    let mut client = cluster.client().await?;

    assert_eq!(client.send("HSET h f1 v1").await?, "(int) 1");
    assert_eq!(client.send("HSET h f1 v2").await?, "(int) 0");
    assert_eq!(client.send("HGET h f1").await?, "\"v2\"");
    assert_eq!(client.send("HLEN h").await?, "1");

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn mutations_replicate_to_the_backup() -> Result<()> {
    let cluster = TestCluster::spawn(18500).await?;
    let mut client = cluster.client().await?;

    assert_eq!(client.send("SET x hello").await?, "OK");
    assert_eq!(client.send("SET y 1").await?, "OK");
    assert_eq!(client.send("INCR y").await?, "(int) 2");
    assert_eq!(client.send("GET x").await?, "\"hello\"");

    let converged = eventually(
        || cluster.backup_store.execute("GET y") == "\"2\"",
        Duration::from_secs(3),
    )
    .await;
    assert!(converged, "backup never converged");
    assert_eq!(cluster.backup_store.execute("GET x"), "\"hello\"");

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn failover_promotes_the_backup() -> Result<()> {
    let cluster = TestCluster::spawn(18600).await?;
    let mut client = cluster.client().await?;

    assert_eq!(client.send("SET \"k\" \"1\"").await?, "OK");
    let converged = eventually(
        || cluster.backup_store.execute("GET k") == "\"1\"",
        Duration::from_secs(3),
    )
    .await;
    assert!(converged, "backup never received the diff");

    // Kill the primary; the master notices the closed connection and
    // promotes the backup.
    cluster.primary_task.abort();
    sleep(Duration::from_millis(500)).await;

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let mut session = cluster.client().await?;
        match session.send("GET \"k\"").await {
            Ok(reply) if reply == "\"1\"" => break,
            Ok(_) | Err(_) if Instant::now() < deadline => {
                sleep(Duration::from_millis(200)).await;
            }
            Ok(reply) => panic!("promoted backup served {reply:?} instead of \"1\""),
            Err(err) => return Err(err.context("promoted backup never served the key")),
        }
    }

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn concurrent_sessions_share_one_counter() -> Result<()> {
    let cluster = TestCluster::spawn(18700).await?;
    let mut client = cluster.client().await?;
    assert_eq!(client.send("SET \"c\" \"0\"").await?, "OK");

    let mut workers = Vec::new();
    for _ in 0..10 {
        let addr = cluster.client_addr;
        workers.push(tokio::spawn(async move {
            let mut session = TestClient::connect(addr).await?;
            for _ in 0..100 {
                let reply = session.send("INCR \"c\"").await?;
                if !reply.starts_with("(int) ") {
                    return Err(anyhow!("unexpected INCR reply {reply:?}"));
                }
            }
            Ok::<(), anyhow::Error>(())
        }));
    }
    for worker in workers {
        worker.await??;
    }

    assert_eq!(client.send("GET \"c\"").await?, "\"1000\"");

    cluster.shutdown();
    Ok(())
}

async fn eventually<F>(mut check: F, limit: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < limit {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    check()
}
