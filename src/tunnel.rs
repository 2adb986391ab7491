//! Byte tunnel between a client connection and a resolved worker
//!
//! Trusted building block for the router: once a target worker is resolved,
//! [`open`] forwards the client's upgrade request to the worker, confirms the
//! worker accepted, and then relays bytes in both directions until either
//! side closes. The client connection is only taken over after the worker's
//! acceptance is confirmed; every earlier failure surfaces as an error with
//! the connection still whole for the caller to close.

use crate::error::GatewayError;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Open a tunnel for an upgrade request to the worker on `port`.
///
/// Returns the response to hand back to the client: the worker's `101
/// Switching Protocols` (with relaying running in the background), or the
/// worker's own rejection response passed through unchanged.
pub async fn open(
    req: Request<Incoming>,
    port: u16,
    connection_id: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, GatewayError> {
    let address_path = req.uri().path().to_string();
    let raw_request = build_upgrade_request(&req, port);

    let worker_addr = format!("127.0.0.1:{}", port);
    let mut worker_stream = TcpStream::connect(&worker_addr)
        .await
        .map_err(GatewayError::Transport)?;

    worker_stream
        .write_all(&raw_request)
        .await
        .map_err(GatewayError::Transport)?;

    // Read the worker's response to the upgrade
    let mut response_buf = vec![0u8; 4096];
    let n = worker_stream
        .read(&mut response_buf)
        .await
        .map_err(GatewayError::Transport)?;
    if n == 0 {
        return Err(GatewayError::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "worker closed connection before responding to upgrade",
        )));
    }

    let (status, response_headers) = parse_upgrade_response(&response_buf[..n]).ok_or_else(|| {
        GatewayError::Transport(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid upgrade response from worker",
        ))
    })?;

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(address_path, connection_id, status = %status, "Worker rejected upgrade request");
        // Pass the worker's non-101 response through as-is
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(address_path, connection_id, port, "Tunnel established");

    // Build the 101 response for the client
    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // Skip hop-by-hop headers that hyper handles
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    // Relay in the background once the client side finishes its upgrade
    let connection_id = connection_id.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                relay(upgraded, worker_stream, &address_path, &connection_id).await;
            }
            Err(e) => {
                error!(address_path, connection_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

/// Forward bytes bidirectionally until either side closes
async fn relay(client: Upgraded, worker: TcpStream, address_path: &str, connection_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut worker_io = worker;

    match tokio::io::copy_bidirectional(&mut client_io, &mut worker_io).await {
        Ok((client_to_worker, worker_to_client)) => {
            debug!(
                address_path,
                connection_id,
                client_to_worker,
                worker_to_client,
                "Tunnel closed normally"
            );
        }
        Err(e) => {
            debug!(address_path, connection_id, error = %e, "Tunnel closed with error");
        }
    }
}

/// Build the raw HTTP upgrade request to send to the worker
fn build_upgrade_request(req: &Request<Incoming>, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    // Host points at the worker
    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the worker's HTTP response head, looking for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}
