//! Router assembly and shared application state.
//!
//! The four long-lived services (config, registry, Control Plane client,
//! tunnel manager) are ordinary values owned by [`AppState`] and handed to
//! handlers by axum; there is no process-wide state.

use crate::control_plane::ControlPlaneClient;
use crate::registry::SharedRegistry;
use crate::tunnels::TunnelManager;
use crate::{forward, health, ws};
use axum::routing::get;
use axum::Router;
use burrowconf::EdgeConfig;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EdgeConfig>,
    pub registry: Arc<SharedRegistry>,
    pub control_plane: Arc<ControlPlaneClient>,
    pub tunnels: Arc<TunnelManager>,
}

impl AppState {
    pub fn new(
        config: Arc<EdgeConfig>,
        registry: Arc<SharedRegistry>,
        control_plane: Arc<ControlPlaneClient>,
    ) -> Self {
        let tunnels = Arc::new(TunnelManager::new(registry.clone()));
        Self {
            config,
            registry,
            control_plane,
            tunnels,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/ws/{tunnel_id}", get(ws::tunnel_socket))
        .route(
            "/local_tunnel/{slug}",
            get(forward::forward_root)
                .post(forward::forward_root)
                .put(forward::forward_root)
                .delete(forward::forward_root)
                .patch(forward::forward_root),
        )
        .route(
            "/local_tunnel/{slug}/{*path}",
            get(forward::forward_path)
                .post(forward::forward_path)
                .put(forward::forward_path)
                .delete(forward::forward_path)
                .patch(forward::forward_path),
        )
        .route("/static/{*path}", get(forward::forward_static))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
