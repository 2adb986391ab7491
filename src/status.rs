//! Read-only status surface
//!
//! Serves the liveness probe, the pool statistics snapshot, and a plain-text
//! help page for everything else. No endpoint here mutates the registry.

use crate::launcher::WorkerLauncher;
use crate::registry::PoolRegistry;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Response, StatusCode};

const HELP_TEXT: &str = "Worker Pool Gateway\n\n\
    Available endpoints:\n\
    - GET /health - Health check\n\
    - GET /stats - Pool statistics\n\
    - Upgrade paths: /<class>-<index>\n";

/// Dispatch a plain (non-upgrade) request
pub fn handle<L: WorkerLauncher>(
    method: &Method,
    path: &str,
    registry: &PoolRegistry<L>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    match (method, path) {
        (&Method::GET, "/health") => health_response(),
        (&Method::GET, "/stats") => stats_response(registry),
        _ => help_response(),
    }
}

fn health_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
    .to_string();
    json_response(StatusCode::OK, body)
}

fn stats_response<L: WorkerLauncher>(
    registry: &PoolRegistry<L>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let stats = registry.statistics();
    match serde_json::to_string_pretty(&stats) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }).to_string(),
        ),
    }
}

fn help_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(
            Full::new(Bytes::from_static(HELP_TEXT.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}

fn json_response(status: StatusCode, body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}
