//! Error taxonomy and HTTP error/redirect responses for the gateway

use crate::engine::EngineError;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No free host port remained after the bounded probe attempts
    #[error("no free port available in the configured range")]
    PortExhausted,

    /// The container engine rejected the create/start call
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// The workspace never accepted a connection before the deadline
    #[error("workspace not ready after {elapsed:?}")]
    ReadinessTimeout { elapsed: Duration },

    /// The user has no entry in the directory file
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// The directory file could not be read or parsed
    #[error("directory error: {0}")]
    Directory(String),

    /// The gateway is draining; no new workspaces are provisioned
    #[error("gateway is shutting down")]
    Draining,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl GatewayError {
    /// The wire-level error code reported for this failure.
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            GatewayError::PortExhausted => GatewayErrorCode::PortExhausted,
            GatewayError::Provision(_) => GatewayErrorCode::ProvisionFailed,
            GatewayError::ReadinessTimeout { .. } => GatewayErrorCode::WorkspaceNotReady,
            GatewayError::UnknownUser(_) => GatewayErrorCode::UnknownUser,
            GatewayError::Directory(_) => GatewayErrorCode::ProvisionFailed,
            GatewayError::Draining => GatewayErrorCode::Draining,
            GatewayError::Engine(_) => GatewayErrorCode::ProvisionFailed,
        }
    }
}

/// Error codes exposed to clients in the X-Gateway-Error header.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Request carried no resolvable user identity
    IdentityRequired,
    /// The user is not present in the directory
    UnknownUser,
    /// No host port could be allocated
    PortExhausted,
    /// Container creation failed
    ProvisionFailed,
    /// The workspace did not become reachable in time
    WorkspaceNotReady,
    /// The gateway is draining and refuses new workspaces
    Draining,
    /// The workspace stopped answering mid-session
    UpstreamUnavailable,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::IdentityRequired => StatusCode::FORBIDDEN,
            GatewayErrorCode::UnknownUser => StatusCode::FORBIDDEN,
            GatewayErrorCode::PortExhausted => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ProvisionFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::WorkspaceNotReady => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::Draining => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::IdentityRequired => "IDENTITY_REQUIRED",
            GatewayErrorCode::UnknownUser => "UNKNOWN_USER",
            GatewayErrorCode::PortExhausted => "PORT_EXHAUSTED",
            GatewayErrorCode::ProvisionFailed => "PROVISION_FAILED",
            GatewayErrorCode::WorkspaceNotReady => "WORKSPACE_NOT_READY",
            GatewayErrorCode::Draining => "DRAINING",
            GatewayErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with an X-Gateway-Error header.
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Create a 303 redirect to the given location.
pub fn redirect_response(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(hyper::header::LOCATION, location)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with static redirect headers")
}
