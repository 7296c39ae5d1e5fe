//! WebSocket admission and per-session loops.
//!
//! Each accepted agent connection runs three cooperating tasks: the writer
//! (exclusive owner of the socket sink, fed by an mpsc queue), the
//! heartbeat, and the receive loop driven by the handler itself. All of
//! them observe one `CancellationToken`; whoever detects failure first
//! cancels it, the receive loop winds down, and cleanup unregisters the
//! tunnel from local and shared state.
//!
//! Admission rejections complete the WebSocket handshake and then close
//! with an application-level code rather than refusing the upgrade, so
//! agents can read the reason.

use crate::server::AppState;
use crate::tunnels::{Outbound, RegisterError, Tunnel};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use burrowproto::TunnelFrame;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Policy violation: missing/invalid token, inactive tunnel, duplicate.
pub const CLOSE_POLICY: u16 = 1008;
/// Inbound frame above the payload limit.
pub const CLOSE_TOO_BIG: u16 = 1009;
/// The gateway could not reach a dependency it needs to admit the agent.
pub const CLOSE_UPSTREAM: u16 = 1011;

const TOKEN_HEADER: &str = "x-tunnel-token";

pub async fn tunnel_socket(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| session(state, tunnel_id, token, socket))
}

async fn close(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn session(state: AppState, tunnel_id: String, token: Option<String>, mut socket: WebSocket) {
    let Some(token) = token else {
        warn!("tunnel {} rejected: missing token", tunnel_id);
        close(&mut socket, CLOSE_POLICY, "Missing X-Tunnel-Token header").await;
        return;
    };

    let validation = match state.control_plane.validate_tunnel(&tunnel_id, &token).await {
        Ok(validation) => validation,
        Err(err) => {
            warn!("tunnel {} validation unavailable: {}", tunnel_id, err);
            close(&mut socket, CLOSE_UPSTREAM, "Control Plane unavailable").await;
            return;
        }
    };

    if !validation.valid {
        warn!(
            "tunnel {} rejected: invalid credentials ({})",
            tunnel_id, validation.status
        );
        close(
            &mut socket,
            CLOSE_POLICY,
            &format!("Invalid tunnel credentials: {}", validation.status),
        )
        .await;
        return;
    }

    if !validation.status.is_active() {
        warn!(
            "tunnel {} rejected: status {}",
            tunnel_id, validation.status
        );
        close(
            &mut socket,
            CLOSE_POLICY,
            &format!("Tunnel status: {}", validation.status),
        )
        .await;
        return;
    }

    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(64);
    let writer = tokio::spawn(write_loop(sink, outbound_rx));

    let cancel = CancellationToken::new();
    let tunnel = match state
        .tunnels
        .register(&tunnel_id, outbound_tx.clone(), cancel.clone())
        .await
    {
        Ok(tunnel) => tunnel,
        Err(err) => {
            warn!("tunnel {} registration failed: {}", tunnel_id, err);
            let code = match err {
                RegisterError::AlreadyRegistered { .. } => CLOSE_POLICY,
                // admission fails closed when the store cannot take the claim
                RegisterError::Store(_) => CLOSE_UPSTREAM,
            };
            let _ = outbound_tx
                .send(Outbound::Close {
                    code,
                    reason: err.to_string(),
                })
                .await;
            let _ = writer.await;
            return;
        }
    };

    info!(
        "tunnel {} connected and validated (expires_at: {:?})",
        tunnel_id, validation.expires_at
    );

    let heartbeat = tokio::spawn(heartbeat_loop(state.clone(), tunnel.clone()));
    tunnel.set_heartbeat(heartbeat);

    receive_loop(&state, &tunnel, stream).await;

    if let Err(err) = state.tunnels.remove(&tunnel_id).await {
        warn!("store cleanup failed for tunnel {}: {}", tunnel_id, err);
    }
}

/// Drain the outbound queue into the socket sink. A close frame ends the
/// loop; so does the sink going away under us.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Outbound>) {
    while let Some(out) = outbound.recv().await {
        match out {
            Outbound::Text(text) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn receive_loop(state: &AppState, tunnel: &Arc<Tunnel>, mut stream: SplitStream<WebSocket>) {
    let cancel = tunnel.cancel_token();
    let max_bytes = state.config.tunnel.max_ws_payload_bytes;

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        let message = match message {
            None => {
                info!("tunnel {} disconnected", tunnel.tunnel_id());
                break;
            }
            Some(Err(err)) => {
                debug!("tunnel {} socket error: {}", tunnel.tunnel_id(), err);
                break;
            }
            Some(Ok(message)) => message,
        };

        match message {
            Message::Text(text) => {
                if text.len() > max_bytes {
                    warn!(
                        "tunnel {} frame too large ({} bytes), closing",
                        tunnel.tunnel_id(),
                        text.len()
                    );
                    let _ = tunnel
                        .send(Outbound::Close {
                            code: CLOSE_TOO_BIG,
                            reason: "Payload too large".to_string(),
                        })
                        .await;
                    break;
                }
                dispatch_frame(state, tunnel, text.as_str()).await;
            }
            Message::Close(_) => {
                info!("tunnel {} closed by agent", tunnel.tunnel_id());
                break;
            }
            // protocol-level ping/pong is answered by the library; binary
            // frames are not part of the envelope
            _ => {}
        }
    }
}

async fn dispatch_frame(state: &AppState, tunnel: &Arc<Tunnel>, text: &str) {
    let frame: TunnelFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("tunnel {} sent invalid JSON: {}", tunnel.tunnel_id(), err);
            return;
        }
    };

    match frame {
        TunnelFrame::Response(response) => {
            let request_id = response.request_id.clone();
            state.tunnels.resolve_pending(&request_id, response);
        }
        TunnelFrame::Pong => {
            state.tunnels.note_pong(tunnel.tunnel_id());
            // keep the fleet-wide ownership record alive while the agent is
            if let Err(err) = state.registry.refresh_ttl(tunnel.tunnel_id()).await {
                warn!(
                    "ttl refresh failed for tunnel {}: {}",
                    tunnel.tunnel_id(),
                    err
                );
            }
        }
        TunnelFrame::Ping => {
            if let Ok(pong) = serde_json::to_string(&TunnelFrame::Pong) {
                let _ = tunnel.send_text(pong).await;
            }
        }
        TunnelFrame::Request(_) | TunnelFrame::Unknown => {
            debug!(
                "tunnel {} sent unhandled frame type, ignoring",
                tunnel.tunnel_id()
            );
        }
    }
}

/// Application-level liveness probe.
///
/// Sends a ping every interval, then checks the pong deadline after the
/// grace period. The receive loop refreshes `last_pong` (and the shared
/// ownership TTL) when the pong arrives; this task only enforces the
/// deadline.
async fn heartbeat_loop(state: AppState, tunnel: Arc<Tunnel>) {
    let ping_interval = state.config.tunnel.ping_interval();
    let pong_timeout = state.config.tunnel.pong_timeout();
    let deadline = ping_interval + pong_timeout;
    let cancel = tunnel.cancel_token();

    let Ok(ping) = serde_json::to_string(&TunnelFrame::Ping) else {
        return;
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(ping_interval) => {}
        }

        if tunnel.send_text(ping.clone()).await.is_err() {
            warn!("tunnel {}: ping send failed, closing", tunnel.tunnel_id());
            cancel.cancel();
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(pong_timeout) => {}
        }

        if tunnel.last_pong().elapsed() > deadline {
            warn!("tunnel {}: pong timeout, closing", tunnel.tunnel_id());
            let _ = tunnel
                .send(Outbound::Close {
                    code: 1000,
                    reason: "pong timeout".to_string(),
                })
                .await;
            cancel.cancel();
            return;
        }
    }
}
