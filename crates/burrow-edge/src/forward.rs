//! Public HTTP forwarder.
//!
//! Resolves the slug (shared cache first, Control Plane on a miss), binds
//! the tunnel on this pod, relays the request as a text frame, and awaits
//! the correlated reply under the request deadline. Never retries; the
//! deadline is hard from the caller's point of view.

use crate::error::GatewayError;
use crate::server::AppState;
use crate::tunnels::TunnelManager;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{HeaderName, HeaderValue, REFERER};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use burrowproto::{RequestFrame, ResponseFrame, TunnelFrame};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};
use uuid::Uuid;

static REFERER_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/local_tunnel/([^/]+)").expect("static regex"));

/// `ANY /local_tunnel/{slug}` - forwarded with an empty path.
pub async fn forward_root(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    forward(&state, &slug, "", method, &headers, body).await
}

/// `ANY /local_tunnel/{slug}/{*path}`.
pub async fn forward_path(
    State(state): State<AppState>,
    Path((slug, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    forward(&state, &slug, &path, method, &headers, body).await
}

/// `GET /static/{*path}` - root-absolute asset requests from tunneled
/// pages. The slug is inferred from the Referer header; best effort.
pub async fn forward_static(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let referer = headers
        .get(REFERER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if referer.is_empty() {
        return Err(GatewayError::MissingReferer);
    }

    let slug = REFERER_SLUG
        .captures(referer)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(GatewayError::RefererNotTunnel)?;

    info!("static asset request for /{} via tunnel slug {}", path, slug);
    let path = format!("static/{path}");
    forward(&state, &slug, &path, Method::GET, &headers, Bytes::new()).await
}

async fn forward(
    state: &AppState,
    slug: &str,
    path: &str,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let tunnel_id = resolve_tunnel_id(state, slug).await?;

    // no inter-pod forwarding: a tunnel held elsewhere fails fast
    let tunnel = state
        .tunnels
        .get(&tunnel_id)
        .ok_or(GatewayError::NotConnectedHere)?;

    let request_id = Uuid::new_v4().to_string();
    let frame = TunnelFrame::Request(RequestFrame {
        request_id: request_id.clone(),
        method: method.to_string(),
        path: format!("/{path}"),
        headers: header_map(headers),
        body: if body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&body).into_owned())
        },
    });

    let payload = serde_json::to_string(&frame).map_err(|_| GatewayError::TunnelSend)?;
    if payload.len() > state.config.tunnel.max_ws_payload_bytes {
        return Err(GatewayError::PayloadTooLarge);
    }

    // correlate before send, so a near-instant reply always finds its slot
    let reply = state.tunnels.create_pending(&request_id, &tunnel_id);
    let _reaper = PendingGuard {
        tunnels: state.tunnels.clone(),
        request_id,
    };

    if tunnel.send_text(payload).await.is_err() {
        return Err(GatewayError::TunnelSend);
    }

    let response = match tokio::time::timeout(state.config.tunnel.request_timeout(), reply).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(_)) => return Err(GatewayError::TunnelClosed),
        Err(_) => return Err(GatewayError::TunnelTimeout),
    };

    Ok(render(response))
}

/// Reaps the pending entry on every exit path, including the handler
/// future being dropped by a client disconnect. Harmless after a normal
/// completion: resolution already removed the entry.
struct PendingGuard {
    tunnels: Arc<TunnelManager>,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.tunnels.drop_pending(&self.request_id);
    }
}

async fn resolve_tunnel_id(state: &AppState, slug: &str) -> Result<String, GatewayError> {
    match state.registry.cached_slug(slug).await {
        Ok(Some(tunnel_id)) => return Ok(tunnel_id),
        Ok(None) => {}
        // a cache fault is not an outage; the Control Plane still decides
        Err(err) => warn!("slug cache read failed for {}: {}", slug, err),
    }

    let resolution = state
        .control_plane
        .resolve_slug(slug)
        .await?
        .ok_or(GatewayError::UnknownSlug)?;

    if !resolution.status.is_active() {
        return Err(GatewayError::TunnelInactive(resolution.status));
    }

    if let Err(err) = state.registry.cache_slug(slug, &resolution.tunnel_id).await {
        warn!("slug cache write failed for {}: {}", slug, err);
    }

    Ok(resolution.tunnel_id)
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Turn the agent's reply into the outer HTTP response. Framing headers
/// are dropped; the HTTP layer recomputes them for the new body.
fn render(frame: ResponseFrame) -> Response {
    let status = StatusCode::from_u16(frame.status).unwrap_or(StatusCode::OK);

    let mut headers = HeaderMap::new();
    for (name, value) in &frame.headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!("dropping invalid response header name {:?}", name);
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            warn!("dropping unrepresentable value for response header {}", name);
            continue;
        };
        headers.append(name, value);
    }

    (status, headers, frame.body.unwrap_or_default()).into_response()
}
