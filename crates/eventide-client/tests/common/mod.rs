//! Scripted in-process server speaking the Eventide wire format.

// each test binary uses its own subset of this module
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use eventide_client::settings::{ClusterSettings, ConnectionSettings};
use eventide_client::Connection;
use eventide_wire::{FrameReassembler, Package, TcpCommand};

/// What the script does with one client request.
pub enum Reply {
    /// Write these packages back, in order.
    Packages(Vec<Package>),
    /// Drop the connection without responding.
    DropConnection,
}

pub type Script = Arc<dyn Fn(&Package) -> Reply + Send + Sync>;

/// A localhost server that frames, decodes, and scripts responses.
///
/// Heartbeat requests are answered automatically and counted separately;
/// everything else is recorded and handed to the script.
pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Package>>>,
    heartbeats: Arc<AtomicUsize>,
    _accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(script: Script) -> MockServer {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Arc<Mutex<Vec<Package>>> = Arc::new(Mutex::new(Vec::new()));
        let heartbeats = Arc::new(AtomicUsize::new(0));

        let accept_requests = Arc::clone(&requests);
        let accept_heartbeats = Arc::clone(&heartbeats);
        let accept = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&script),
                    Arc::clone(&accept_requests),
                    Arc::clone(&accept_heartbeats),
                ));
            }
        });

        MockServer {
            addr,
            requests,
            heartbeats,
            _accept: accept,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn requests(&self) -> Vec<Package> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, command: TcpCommand) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.command == command)
            .count()
    }

    pub fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::Relaxed)
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    script: Script,
    requests: Arc<Mutex<Vec<Package>>>,
    heartbeats: Arc<AtomicUsize>,
) {
    stream.set_nodelay(true).unwrap();
    let (mut read, mut write) = stream.into_split();
    let mut reassembler = FrameReassembler::default();
    let mut buf = [0u8; 8192];
    loop {
        let n = match read.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let mut frames = Vec::new();
        if reassembler
            .process(&buf[..n], &mut |frame| frames.push(frame))
            .is_err()
        {
            return;
        }
        for frame in frames {
            let package = Package::decode(&frame).unwrap();
            if package.command == TcpCommand::HeartbeatRequest {
                heartbeats.fetch_add(1, Ordering::Relaxed);
                let reply = Package::new(
                    TcpCommand::HeartbeatResponse,
                    package.correlation_id,
                    package.data.clone(),
                );
                if write.write_all(&reply.encode().unwrap()).await.is_err() {
                    return;
                }
                continue;
            }
            requests.lock().unwrap().push(package.clone());
            match script(&package) {
                Reply::Packages(packages) => {
                    for p in packages {
                        if write.write_all(&p.encode().unwrap()).await.is_err() {
                            return;
                        }
                    }
                    let _ = write.flush().await;
                }
                Reply::DropConnection => return,
            }
        }
    }
}

/// Installs the fmt subscriber once so RUST_LOG works in tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Settings tuned for fast test turnaround.
pub fn fast_settings() -> ConnectionSettings {
    ConnectionSettings {
        operation_timeout: Duration::from_millis(200),
        operation_timeout_check_period: Duration::from_millis(25),
        reconnection_delay: Duration::from_millis(50),
        ..ConnectionSettings::default()
    }
}

pub fn connect(server: &MockServer, settings: ConnectionSettings) -> Connection {
    Connection::connect(settings, ClusterSettings::single_node(server.addr())).unwrap()
}

/// Polls `condition` until it holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
