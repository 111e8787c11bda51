//! Shared end-to-end test harness: spin up N in-process `xpnd` servers over
//! real loopback TCP sockets (an in-memory backend by default, a disk-backed
//! one on request) and hand back an [`xpn_client::XpnClient`] wired to talk
//! to all of them, exercising the same wire path a real deployment uses.

use std::sync::Arc;
use tokio::sync::broadcast;
use xpn_common::config::{EnvOverrides, Partition, ServerUrl};
use xpn_worker::{WorkerMode, Workpool};
use xpnd::backend::disk::DiskBackend;
use xpnd::backend::mem::MemBackend;
use xpnd::backend::Backend;
use xpnd::state::ServerState;
use xpn_client::XpnClient;
use xpn_transport::socket::SocketTransport;
use xpn_transport::Transport;

/// One running server plus the shutdown handle that tears it down when the
/// test ends.
pub struct TestServer {
    pub addr: std::net::SocketAddr,
    shutdown: broadcast::Sender<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

async fn spawn_server(backend: Arc<dyn Backend>) -> TestServer {
    let workpool = Workpool::new(WorkerMode::ThreadPool, 4);
    let state = Arc::new(ServerState::new(backend, workpool, true));
    let (listener, addr) = xpnd::bind("127.0.0.1", 0).await.expect("bind ephemeral port");
    let (tx, mut rx) = broadcast::channel(1);
    tokio::spawn(async move {
        xpnd::accept_until_shutdown(state, listener, &mut rx).await;
    });
    TestServer { addr, shutdown: tx }
}

/// A whole partition of `n` in-memory servers plus the client connected to
/// all of them, at the given block size and replication level.
pub struct TestPartition {
    pub servers: Vec<TestServer>,
    pub client: XpnClient,
}

pub async fn start_memory_partition(n: u32, block_size: u64, replication_level: u32) -> TestPartition {
    let mut servers = Vec::with_capacity(n as usize);
    for _ in 0..n {
        servers.push(spawn_server(Arc::new(MemBackend::new())).await);
    }
    build_client(servers, block_size, replication_level)
}

/// Same as [`start_memory_partition`] but backed by real files under a fresh
/// temp directory per server, so the on-disk byte layout can be inspected.
pub struct TestDiskPartition {
    pub servers: Vec<TestServer>,
    pub roots: Vec<tempfile::TempDir>,
    pub client: XpnClient,
}

pub async fn start_disk_partition(n: u32, block_size: u64, replication_level: u32) -> TestDiskPartition {
    let mut servers = Vec::with_capacity(n as usize);
    let mut roots = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = DiskBackend::new(dir.path()).expect("disk backend");
        servers.push(spawn_server(Arc::new(backend)).await);
        roots.push(dir);
    }
    let TestPartition { servers, client } = build_client(servers, block_size, replication_level);
    TestDiskPartition { servers, roots, client }
}

fn build_client(servers: Vec<TestServer>, block_size: u64, replication_level: u32) -> TestPartition {
    let server_urls: Vec<ServerUrl> = servers
        .iter()
        .map(|s| ServerUrl {
            protocol: xpn_common::config::Protocol::Sck,
            host: s.addr.ip().to_string(),
            port: Some(s.addr.port()),
            path: "/".to_string(),
        })
        .collect();
    let partition = Partition {
        name: "test".to_string(),
        controller_url: None,
        block_size,
        replication_level,
        servers: server_urls,
    };
    let transport: Arc<dyn Transport> = Arc::new(SocketTransport::new(2000));
    let overrides = EnvOverrides::default();
    let client = XpnClient::connect(partition, transport, &overrides);
    TestPartition { servers, client }
}
