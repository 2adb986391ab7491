//! Error taxonomy and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors surfaced while routing a connection to a pooled worker.
///
/// Parse and validation failures are produced at the router boundary and
/// never reach the registry; launch failures propagate up from the launcher
/// through the registry.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request path does not match the `/<class>-<index>` grammar
    #[error("malformed worker address: {0}")]
    MalformedAddress(String),

    /// Requested worker class is not configured or not enabled
    #[error("worker class '{0}' is not enabled")]
    ClassDisabled(String),

    /// Computed port would exceed the valid port range
    #[error("index {index} is out of the port range of class '{class}'")]
    PortOutOfRange { class: String, index: u32 },

    /// Worker process creation failed; the key remains absent so a later
    /// request may retry
    #[error("worker launch failed: {0}")]
    Launch(anyhow::Error),

    /// Registry has been torn down and no longer creates workers
    #[error("registry is shutting down")]
    ShuttingDown,

    /// Post-handoff tunneling error
    #[error("tunnel to worker failed: {0}")]
    Transport(#[source] std::io::Error),
}

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MalformedAddress(_) => StatusCode::BAD_REQUEST,
            GatewayError::ClassDisabled(_) => StatusCode::NOT_FOUND,
            GatewayError::PortOutOfRange { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Launch(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MalformedAddress(_) => "MALFORMED_ADDRESS",
            GatewayError::ClassDisabled(_) => "CLASS_DISABLED",
            GatewayError::PortOutOfRange { .. } => "PORT_OUT_OF_RANGE",
            GatewayError::Launch(_) => "LAUNCH_FAILURE",
            GatewayError::ShuttingDown => "SHUTTING_DOWN",
            GatewayError::Transport(_) => "TRANSPORT_FAILURE",
        }
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(error: &GatewayError) -> Response<BoxBody<Bytes, hyper::Error>> {
    let status = error.status_code();
    let body = serde_json::json!({
        "code": error.code(),
        "message": error.to_string(),
        "status": status.as_u16(),
    })
    .to_string();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", error.code())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
