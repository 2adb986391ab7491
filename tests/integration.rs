//! Integration tests for the gateway
//!
//! Workers are stood in by an in-process launcher whose "processes" are
//! tokio tasks: each accepts the upgrade handshake on its assigned port and
//! echoes every byte back. The gateway itself runs against real sockets.

use poolgate::config::{ClassConfig, ClassDefaults};
use poolgate::launcher::WorkerLauncher;
use poolgate::registry::PoolRegistry;
use poolgate::router::GatewayServer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Handle to an in-process echo worker
struct EchoWorker {
    task: tokio::task::JoinHandle<()>,
}

/// Launcher test double: workers are echo servers on the assigned port
#[derive(Clone, Default)]
struct EchoLauncher {
    launches: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl WorkerLauncher for EchoLauncher {
    type Handle = EchoWorker;

    async fn launch(
        &self,
        _class: &str,
        _config: &ClassConfig,
        port: u16,
        _address_path: &str,
    ) -> anyhow::Result<EchoWorker> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        self.launches.fetch_add(1, Ordering::SeqCst);

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve_echo(stream));
            }
        });

        Ok(EchoWorker { task })
    }

    async fn release(&self, handle: EchoWorker) -> anyhow::Result<()> {
        handle.task.abort();
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Accept the upgrade handshake, then echo until the peer closes
async fn serve_echo(mut stream: TcpStream) {
    let mut buf = vec![0u8; 4096];
    let mut read = 0;
    loop {
        match stream.read(&mut buf[read..]).await {
            Ok(0) => return,
            Ok(n) => {
                read += n;
                if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
                if read == buf.len() {
                    return;
                }
            }
            Err(_) => return,
        }
    }

    let response =
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
    if stream.write_all(response).await.is_err() {
        return;
    }

    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

struct Gateway {
    port: u16,
    registry: Arc<PoolRegistry<EchoLauncher>>,
    launcher: EchoLauncher,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_gateway(classes: HashMap<String, ClassConfig>) -> Gateway {
    let launcher = EchoLauncher::default();
    let registry = PoolRegistry::new(classes, ClassDefaults::default(), launcher.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Grab a free port for the gateway listener
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let addr = format!("127.0.0.1:{}", port).parse().unwrap();
    let server = GatewayServer::new(addr, Arc::clone(&registry), shutdown_rx);
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    assert!(
        wait_for_port(port, Duration::from_secs(5)).await,
        "gateway did not start listening"
    );

    Gateway {
        port,
        registry,
        launcher,
        _shutdown_tx: shutdown_tx,
    }
}

async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Send a plain HTTP request and read the whole response
async fn http_get(port: u16, path: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

/// Send an upgrade request for `path` and read until `needle` appears
async fn upgrade_request(port: u16, path: &str, needle: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        path, port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_until_contains(&mut stream, needle).await;
    (stream, head)
}

async fn read_until_contains(stream: &mut TcpStream, needle: &str) -> String {
    let mut buf = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut chunk = [0u8; 1024];
        let n = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if String::from_utf8_lossy(&buf).contains(needle) {
            break;
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn echo_classes(base_port: u16) -> HashMap<String, ClassConfig> {
    HashMap::from([("echo".to_string(), ClassConfig::new("unused", base_port))])
}

#[tokio::test]
async fn test_health_endpoint() {
    let gateway = start_gateway(echo_classes(21100)).await;

    let response = http_get(gateway.port, "/health").await;
    assert!(response.contains("200 OK"));
    assert!(response.contains("\"status\":\"ok\""));
    assert!(response.contains("timestamp"));
}

#[tokio::test]
async fn test_stats_endpoint_starts_empty() {
    let gateway = start_gateway(echo_classes(21110)).await;

    let response = http_get(gateway.port, "/stats").await;
    assert!(response.contains("200 OK"));
    assert!(response.contains("\"total\": 0"));
}

#[tokio::test]
async fn test_unknown_path_returns_help() {
    let gateway = start_gateway(echo_classes(21120)).await;

    let response = http_get(gateway.port, "/something-else/entirely").await;
    assert!(response.contains("200 OK"));
    assert!(response.contains("Available endpoints"));
    assert!(response.contains("/<class>-<index>"));
}

#[tokio::test]
async fn test_malformed_address_rejected_without_side_effects() {
    let gateway = start_gateway(echo_classes(21130)).await;

    let (_stream, head) = upgrade_request(gateway.port, "/unknown", "MALFORMED_ADDRESS").await;
    assert!(head.contains("400 Bad Request"));
    assert!(head.contains("MALFORMED_ADDRESS"));

    assert!(gateway.registry.is_empty());
    assert_eq!(gateway.launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unconfigured_class_rejected_without_side_effects() {
    let gateway = start_gateway(echo_classes(21140)).await;

    let (_stream, head) = upgrade_request(gateway.port, "/gamma-0", "CLASS_DISABLED").await;
    assert!(head.contains("404 Not Found"));
    assert!(head.contains("CLASS_DISABLED"));

    assert!(gateway.registry.is_empty());
    assert_eq!(gateway.launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_tunnel_round_trip_and_worker_reuse() {
    let gateway = start_gateway(echo_classes(21200)).await;

    let (mut stream, head) = upgrade_request(gateway.port, "/echo-0", "\r\n\r\n").await;
    assert!(head.contains("101 Switching Protocols"));

    // Bytes flow both ways through the tunnel
    stream.write_all(b"hello tunnel").await.unwrap();
    let mut buf = [0u8; 12];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello tunnel");
    drop(stream);

    assert_eq!(gateway.launcher.launches.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.registry.len(), 1);

    // A second connection to the same address reuses the worker
    let (mut stream, head) = upgrade_request(gateway.port, "/echo-0", "\r\n\r\n").await;
    assert!(head.contains("101 Switching Protocols"));
    stream.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"again");

    assert_eq!(gateway.launcher.launches.load(Ordering::SeqCst), 1);

    let stats = http_get(gateway.port, "/stats").await;
    assert!(stats.contains("\"echo-0\""));
    assert!(stats.contains("\"port\": 21200"));
}

#[tokio::test]
async fn test_concurrent_connections_launch_one_worker() {
    let gateway = start_gateway(echo_classes(21300)).await;

    let mut handles = Vec::new();
    for i in 0..4u8 {
        let port = gateway.port;
        handles.push(tokio::spawn(async move {
            let (mut stream, head) = upgrade_request(port, "/echo-3", "\r\n\r\n").await;
            assert!(head.contains("101 Switching Protocols"));

            let payload = [i; 8];
            stream.write_all(&payload).await.unwrap();
            let mut buf = [0u8; 8];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, payload);
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(gateway.launcher.launches.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.registry.len(), 1);
}

#[tokio::test]
async fn test_teardown_releases_workers_and_blocks_creation() {
    let gateway = start_gateway(echo_classes(21400)).await;

    let (_stream, head) = upgrade_request(gateway.port, "/echo-0", "\r\n\r\n").await;
    assert!(head.contains("101 Switching Protocols"));
    assert_eq!(gateway.launcher.launches.load(Ordering::SeqCst), 1);

    gateway.registry.teardown_all().await;
    assert!(gateway.registry.is_empty());
    assert_eq!(gateway.launcher.releases.load(Ordering::SeqCst), 1);

    let (_stream, head) = upgrade_request(gateway.port, "/echo-1", "SHUTTING_DOWN").await;
    assert!(head.contains("503 Service Unavailable"));
    assert!(head.contains("SHUTTING_DOWN"));
}
