//! Pod-local tunnel table and request/response correlator.
//!
//! `TunnelManager` owns two hot maps: `active` (tunnel_id -> live session)
//! read on every forwarded request, and `pending` (request_id -> one-shot
//! completion) bridging the HTTP forwarder to the WebSocket receive loop.
//! Structural changes to `active` go through one async mutex so a
//! registration's store claim and its local insert cannot interleave with
//! a concurrent removal; reads stay lock-free on the DashMaps.

use crate::registry::{Registration, SharedRegistry};
use crate::store::StoreError;
use burrowproto::ResponseFrame;
use dashmap::DashMap;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Traffic queued to a session's writer task, which exclusively owns the
/// socket sink.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// The queue to a session's writer is closed; the session is tearing down.
#[derive(Debug, Error)]
#[error("tunnel session is gone")]
pub struct SessionGone;

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("tunnel {tunnel_id} already registered (holder: {holder})")]
    AlreadyRegistered { tunnel_id: String, holder: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One live agent WebSocket session.
#[derive(Debug)]
pub struct Tunnel {
    tunnel_id: String,
    outbound: mpsc::Sender<Outbound>,
    last_pong: StdMutex<Instant>,
    cancel: CancellationToken,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// Token observed by the session's receive loop and heartbeat.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn send(&self, out: Outbound) -> Result<(), SessionGone> {
        self.outbound.send(out).await.map_err(|_| SessionGone)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionGone> {
        self.send(Outbound::Text(text.into())).await
    }

    pub fn touch_pong(&self) {
        *self.last_pong.lock().unwrap() = Instant::now();
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock().unwrap()
    }

    /// Attach the heartbeat task once it has been spawned. The manager
    /// aborts it on removal.
    pub fn set_heartbeat(&self, handle: JoinHandle<()>) {
        *self.heartbeat.lock().unwrap() = Some(handle);
    }

    fn shutdown(&self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
        self.cancel.cancel();
    }
}

struct PendingReply {
    tunnel_id: String,
    tx: oneshot::Sender<ResponseFrame>,
}

pub struct TunnelManager {
    registry: Arc<SharedRegistry>,
    active: DashMap<String, Arc<Tunnel>>,
    pending: DashMap<String, PendingReply>,
    registration: Mutex<()>,
}

impl TunnelManager {
    pub fn new(registry: Arc<SharedRegistry>) -> Self {
        Self {
            registry,
            active: DashMap::new(),
            pending: DashMap::new(),
            registration: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<SharedRegistry> {
        &self.registry
    }

    /// Register a session locally and claim ownership in the shared store.
    ///
    /// Refused when the tunnel_id is live anywhere: on this pod, or on
    /// another pod per the store's create-if-absent claim.
    pub async fn register(
        &self,
        tunnel_id: &str,
        outbound: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Result<Arc<Tunnel>, RegisterError> {
        let _guard = self.registration.lock().await;

        if self.active.contains_key(tunnel_id) {
            return Err(RegisterError::AlreadyRegistered {
                tunnel_id: tunnel_id.to_string(),
                holder: self.registry.pod_id().to_string(),
            });
        }

        match self.registry.register_tunnel(tunnel_id).await? {
            Registration::Registered => {}
            Registration::AlreadyOwned { pod_id } => {
                return Err(RegisterError::AlreadyRegistered {
                    tunnel_id: tunnel_id.to_string(),
                    holder: pod_id.unwrap_or_else(|| "unknown".to_string()),
                });
            }
        }

        let tunnel = Arc::new(Tunnel {
            tunnel_id: tunnel_id.to_string(),
            outbound,
            last_pong: StdMutex::new(Instant::now()),
            cancel,
            heartbeat: StdMutex::new(None),
        });
        self.active.insert(tunnel_id.to_string(), tunnel.clone());
        info!("tunnel {} active on this pod", tunnel_id);
        Ok(tunnel)
    }

    /// Tear a session down: cancel its tasks, wake every caller still
    /// waiting on it, release the shared-store claim. Idempotent.
    pub async fn remove(&self, tunnel_id: &str) -> Result<(), StoreError> {
        let _guard = self.registration.lock().await;

        if let Some((_, tunnel)) = self.active.remove(tunnel_id) {
            tunnel.shutdown();
            info!("tunnel {} removed from this pod", tunnel_id);
        }

        // Dropping the senders fails the waiters' receivers immediately
        self.pending.retain(|_, reply| reply.tunnel_id != tunnel_id);

        self.registry.remove_tunnel(tunnel_id).await
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.active.get(tunnel_id).map(|entry| entry.value().clone())
    }

    /// Create the completion slot for `request_id`. Must be called before
    /// the request frame is queued, so a fast agent reply always finds it.
    pub fn create_pending(
        &self,
        request_id: &str,
        tunnel_id: &str,
    ) -> oneshot::Receiver<ResponseFrame> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.to_string(),
            PendingReply {
                tunnel_id: tunnel_id.to_string(),
                tx,
            },
        );
        rx
    }

    /// Complete a pending request. Late or unknown replies are no-ops.
    pub fn resolve_pending(&self, request_id: &str, frame: ResponseFrame) {
        match self.pending.remove(request_id) {
            Some((_, reply)) => {
                // the waiter may have timed out already; that is fine
                let _ = reply.tx.send(frame);
            }
            None => debug!("discarding orphan response for request {}", request_id),
        }
    }

    /// Reap a pending entry on the failure paths (timeout, send failure,
    /// client disconnect).
    pub fn drop_pending(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    pub fn note_pong(&self, tunnel_id: &str) {
        if let Some(tunnel) = self.active.get(tunnel_id) {
            tunnel.touch_pong();
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
