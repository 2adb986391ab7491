//! Inbound connection routing
//!
//! Upgrade requests are addressed as `/<class>-<index>` and routed to a
//! pooled worker: parse, resolve against the registry (creating the worker
//! on first reference), then hand the connection to the byte tunnel. Parsing
//! happens before any registry access, so malformed input causes no side
//! effects. Plain HTTP requests fall through to the status surface.

use crate::error::{json_error_response, GatewayError};
use crate::launcher::WorkerLauncher;
use crate::registry::PoolRegistry;
use crate::status;
use crate::tunnel;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The gateway's listener: accepts connections and serves them until the
/// shutdown channel fires.
pub struct GatewayServer<L: WorkerLauncher> {
    bind_addr: SocketAddr,
    registry: Arc<PoolRegistry<L>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<L: WorkerLauncher> GatewayServer<L> {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<PoolRegistry<L>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, registry).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<L: WorkerLauncher>(
    stream: tokio::net::TcpStream,
    _addr: SocketAddr,
    registry: Arc<PoolRegistry<L>>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        async move { handle_request(req, registry).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request<L: WorkerLauncher>(
    req: Request<Incoming>,
    registry: Arc<PoolRegistry<L>>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if is_upgrade_request(&req) {
        return handle_tunnel(req, registry).await;
    }

    Ok(status::handle(
        req.method(),
        req.uri().path(),
        registry.as_ref(),
    ))
}

async fn handle_tunnel<L: WorkerLauncher>(
    req: Request<Incoming>,
    registry: Arc<PoolRegistry<L>>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let connection_id = Uuid::new_v4().to_string();

    // Parse before touching the registry: malformed input must cause no
    // side effects
    let (class, index) = match parse_address(&path) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(path, connection_id, error = %e, "Rejecting connection");
            return Ok(json_error_response(&e));
        }
    };

    debug!(class, index, connection_id, "Incoming worker connection");

    let record = match registry.resolve(&class, Some(index)).await {
        Ok(record) => record,
        Err(e) => {
            error!(path, connection_id, error = %e, "Failed to resolve worker");
            return Ok(json_error_response(&e));
        }
    };

    // Worker is confirmed ready; only now does the connection change hands
    match tunnel::open(req, record.port, &connection_id).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(path, connection_id, port = record.port, error = %e, "Tunnel failed");
            Ok(json_error_response(&e))
        }
    }
}

/// Parse a request path against the `/<class>-<index>` grammar.
///
/// `index` is a base-10 non-negative integer with no extraneous characters.
/// Class names may themselves contain hyphens; the final hyphen separates
/// class from index.
pub fn parse_address(path: &str) -> Result<(String, u32), GatewayError> {
    let malformed = || GatewayError::MalformedAddress(path.to_string());

    let rest = path.strip_prefix('/').ok_or_else(malformed)?;
    if rest.contains('/') {
        return Err(malformed());
    }

    let (class, index) = rest.rsplit_once('-').ok_or_else(malformed)?;
    if class.is_empty() || index.is_empty() {
        return Err(malformed());
    }

    // Restricting the class charset keeps arbitrary request bytes out of
    // log fields and worker addresses
    if !class
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(malformed());
    }

    if !index.chars().all(|c| c.is_ascii_digit()) {
        return Err(malformed());
    }

    let index: u32 = index.parse().map_err(|_| malformed())?;
    Ok((class.to_string(), index))
}

/// Check if a request is an upgrade request (WebSocket or otherwise)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}
