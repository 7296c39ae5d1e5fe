//! Forwarder error taxonomy and its HTTP rendering.
//!
//! Each variant maps to exactly one caller-visible status code; bodies are
//! `{"detail": "..."}` JSON. Nothing here is retried internally.

use crate::control_plane::ControlPlaneError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use burrowproto::TunnelStatus;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Control Plane authoritatively does not know the slug.
    #[error("Slug not found")]
    UnknownSlug,

    /// Slug resolves, but the tunnel is expired/revoked.
    #[error("Tunnel {0}")]
    TunnelInactive(TunnelStatus),

    /// The tunnel lives on some other pod (or nowhere); no inter-pod
    /// forwarding, so fail fast.
    #[error("Tunnel not connected to this pod")]
    NotConnectedHere,

    #[error("Request payload too large for tunnel")]
    PayloadTooLarge,

    #[error("Failed to send to tunnel")]
    TunnelSend,

    /// The session tore down while we were waiting on its reply.
    #[error("Tunnel closed before responding")]
    TunnelClosed,

    #[error("Tunnel timeout")]
    TunnelTimeout,

    #[error("Control plane unavailable")]
    ControlPlane(#[source] ControlPlaneError),

    #[error("Missing Referer header - cannot determine tunnel")]
    MissingReferer,

    #[error("Cannot determine tunnel from referer")]
    RefererNotTunnel,
}

impl From<ControlPlaneError> for GatewayError {
    fn from(err: ControlPlaneError) -> Self {
        GatewayError::ControlPlane(err)
    }
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::UnknownSlug => StatusCode::NOT_FOUND,
            GatewayError::TunnelInactive(_) => StatusCode::GONE,
            GatewayError::NotConnectedHere => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::TunnelSend => StatusCode::BAD_GATEWAY,
            GatewayError::TunnelClosed => StatusCode::BAD_GATEWAY,
            GatewayError::TunnelTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ControlPlane(_) => StatusCode::BAD_GATEWAY,
            GatewayError::MissingReferer => StatusCode::BAD_REQUEST,
            GatewayError::RefererNotTunnel => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
