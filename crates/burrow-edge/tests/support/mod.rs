//! Shared fixtures for the gateway integration tests: an in-process
//! gateway over a `MemoryStore`, a mock Control Plane speaking the real
//! contract, and WebSocket agents driven through tokio-tungstenite.

#![allow(dead_code)]

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use burrow_edge::control_plane::ControlPlaneClient;
use burrow_edge::registry::SharedRegistry;
use burrow_edge::server::{self, AppState};
use burrow_edge::store::{MemoryStore, Store};
use burrowconf::EdgeConfig;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const VALID_TOKEN: &str = "valid_token_123";
pub const TEST_TUNNEL: &str = "tunnel_test123";

/// Mock Control Plane with the canonical fixtures: `my-slug` routes to an
/// active tunnel, `expired-slug` to an expired one, `broken-slug` answers
/// 500, anything else 404.
pub async fn spawn_mock_control_plane() -> String {
    let router = Router::new()
        .route(
            "/api/tunnels/resolve/{slug}",
            get(|Path(slug): Path<String>| async move {
                let record = |tunnel_id: &str, status: &str| {
                    Json(json!({
                        "tunnel_id": tunnel_id,
                        "expires_at": "2026-08-02T00:00:00Z",
                        "status": status,
                    }))
                    .into_response()
                };
                match slug.as_str() {
                    "my-slug" => record(TEST_TUNNEL, "active"),
                    "test-slug" => record("tunnel_abc456", "active"),
                    "expired-slug" => record("tunnel_expired", "expired"),
                    "broken-slug" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                    _ => StatusCode::NOT_FOUND.into_response(),
                }
            }),
        )
        .route(
            "/api/tunnels/validate",
            post(|Json(body): Json<serde_json::Value>| async move {
                let tunnel_id = body["tunnel_id"].as_str().unwrap_or_default().to_string();
                let token = body["token"].as_str().unwrap_or_default();

                let expected = match tunnel_id.as_str() {
                    TEST_TUNNEL => Some(("valid_token_123", "active")),
                    "tunnel_abc456" => Some(("valid_token_456", "active")),
                    "tunnel_expired" => Some(("expired_token", "expired")),
                    "tunnel_revoked" => Some(("revoked_token", "revoked")),
                    _ => None,
                };

                let Some((expected_token, status)) = expected else {
                    return StatusCode::NOT_FOUND.into_response();
                };
                if token != expected_token {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
                Json(json!({
                    "valid": status == "active",
                    "tunnel_id": tunnel_id,
                    "status": status,
                    "expires_at": "2026-08-02T00:00:00Z",
                }))
                .into_response()
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

pub struct TestGateway {
    pub base: String,
    pub ws_base: String,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
}

/// Bring up a gateway on an ephemeral port, backed by a fresh
/// `MemoryStore` and the given Control Plane.
pub async fn spawn_gateway(
    control_plane_url: &str,
    tweak: impl FnOnce(&mut EdgeConfig),
) -> TestGateway {
    let mut config = EdgeConfig::default();
    config.control_plane.url = control_plane_url.to_string();
    config.control_plane.timeout_seconds = 2;
    tweak(&mut config);
    let config = Arc::new(config);

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(SharedRegistry::new(
        store.clone() as Arc<dyn Store>,
        "pod-test",
        config.tunnel.registry_ttl(),
        config.tunnel.slug_cache_ttl(),
    ));
    let control_plane = Arc::new(ControlPlaneClient::new(&config.control_plane).unwrap());
    let state = AppState::new(config, registry, control_plane);

    let router = server::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestGateway {
        base: format!("http://{addr}"),
        ws_base: format!("ws://{addr}"),
        state,
        store,
    }
}

pub type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open an agent WebSocket, optionally carrying a token header.
pub async fn connect_agent(
    gateway: &TestGateway,
    tunnel_id: &str,
    token: Option<&str>,
) -> AgentSocket {
    let url = format!("{}/ws/{}", gateway.ws_base, tunnel_id);
    let mut request = url.into_client_request().unwrap();
    if let Some(token) = token {
        request
            .headers_mut()
            .insert("X-Tunnel-Token", token.parse().unwrap());
    }
    let (socket, _response) = tokio_tungstenite::connect_async(request).await.unwrap();
    socket
}

/// Registration happens after the upgrade completes; wait for it.
pub async fn wait_for_tunnel(gateway: &TestGateway, tunnel_id: &str) {
    for _ in 0..200 {
        if gateway.state.tunnels.get(tunnel_id).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tunnel {tunnel_id} never registered");
}

/// A well-behaved agent: answers pings with pongs and echoes every request
/// as `echo:{method} {path}` with a deliberately stale Content-Length.
pub fn spawn_echo_agent(mut socket: AgentSocket) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Ok(message)) = socket.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(text.as_str()) else {
                continue;
            };
            let reply = match value["type"].as_str() {
                Some("request") => json!({
                    "type": "response",
                    "request_id": value["request_id"],
                    "status": 200,
                    "headers": {
                        "Content-Type": "text/plain",
                        "Content-Length": "9999",
                        "X-Agent": "echo",
                    },
                    "body": format!(
                        "echo:{} {}",
                        value["method"].as_str().unwrap_or_default(),
                        value["path"].as_str().unwrap_or_default(),
                    ),
                })
                .to_string(),
                Some("ping") => json!({"type": "pong"}).to_string(),
                _ => continue,
            };
            if socket.send(Message::Text(reply.into())).await.is_err() {
                break;
            }
        }
    })
}

/// An agent that never answers anything; counts request frames it saw.
pub fn spawn_silent_agent(
    mut socket: AgentSocket,
    requests_seen: Arc<AtomicUsize>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Ok(message)) = socket.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(text.as_str()) {
                if value["type"] == "request" {
                    requests_seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    })
}

/// Read frames until the server's close frame arrives.
pub async fn expect_close(socket: &mut AgentSocket) -> (u16, String) {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for close frame")
            .expect("socket ended without a close frame");
        match message {
            Ok(Message::Close(Some(frame))) => {
                return (u16::from(frame.code), frame.reason.to_string())
            }
            Ok(Message::Close(None)) => return (1005, String::new()),
            Ok(_) => continue,
            Err(err) => panic!("socket error while waiting for close: {err}"),
        }
    }
}
