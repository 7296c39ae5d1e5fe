//! Shared tunnel registry over the external key-value store.
//!
//! Tracks which edge pod owns which tunnel so a fleet of pods can scale
//! horizontally, and caches slug resolutions. Key schema:
//!
//! - `tunnel:{tunnel_id}` -> pod_id, TTL = registry TTL
//! - `pod:{pod_id}:tunnels` -> set of tunnel_ids, no TTL, pruned by owner
//! - `slug:{slug}` -> tunnel_id, TTL = slug cache TTL
//!
//! Ownership is claimed with create-if-absent, so a tunnel_id is held by
//! at most one pod at a time. The pod set is a cleanup hint consulted only
//! by its owning pod at teardown; the ownership TTL is the backstop for
//! records abandoned by a crashed pod.

use crate::store::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of an ownership claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Registered,
    AlreadyOwned {
        /// Holder as recorded in the store; `None` if the record vanished
        /// between the failed claim and the follow-up read.
        pod_id: Option<String>,
    },
}

pub struct SharedRegistry {
    store: Arc<dyn Store>,
    pod_id: String,
    ownership_ttl: Duration,
    slug_ttl: Duration,
}

fn tunnel_key(tunnel_id: &str) -> String {
    format!("tunnel:{tunnel_id}")
}

fn slug_key(slug: &str) -> String {
    format!("slug:{slug}")
}

impl SharedRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        pod_id: impl Into<String>,
        ownership_ttl: Duration,
        slug_ttl: Duration,
    ) -> Self {
        Self {
            store,
            pod_id: pod_id.into(),
            ownership_ttl,
            slug_ttl,
        }
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    fn pod_set_key(&self) -> String {
        format!("pod:{}:tunnels", self.pod_id)
    }

    /// Claim `tunnel_id` for this pod.
    ///
    /// The claim itself is atomic; the follow-up SADD into the pod set is
    /// not transactional with it, which is fine because the set is only a
    /// teardown hint read by this pod.
    pub async fn register_tunnel(&self, tunnel_id: &str) -> Result<Registration, StoreError> {
        let key = tunnel_key(tunnel_id);
        let claimed = self
            .store
            .set_if_absent(&key, &self.pod_id, self.ownership_ttl)
            .await?;

        if !claimed {
            let holder = self.store.get(&key).await?;
            warn!(
                "tunnel {} already registered (holder: {:?}, this pod: {})",
                tunnel_id, holder, self.pod_id
            );
            return Ok(Registration::AlreadyOwned { pod_id: holder });
        }

        self.store.set_add(&self.pod_set_key(), tunnel_id).await?;
        info!("tunnel {} registered to pod {}", tunnel_id, self.pod_id);
        Ok(Registration::Registered)
    }

    /// Release `tunnel_id`. Idempotent.
    pub async fn remove_tunnel(&self, tunnel_id: &str) -> Result<(), StoreError> {
        self.store
            .delete_and_remove_member(&tunnel_key(tunnel_id), &self.pod_set_key(), tunnel_id)
            .await?;
        info!("tunnel {} unregistered from pod {}", tunnel_id, self.pod_id);
        Ok(())
    }

    /// Re-extend the ownership TTL; called on every successful pong so
    /// long-lived tunnels stay visible across the fleet.
    pub async fn refresh_ttl(&self, tunnel_id: &str) -> Result<(), StoreError> {
        self.store
            .expire(&tunnel_key(tunnel_id), self.ownership_ttl)
            .await
    }

    /// Which pod owns `tunnel_id`, if any.
    pub async fn owner_of(&self, tunnel_id: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&tunnel_key(tunnel_id)).await
    }

    /// Cache a slug resolution; overwrites any previous mapping.
    pub async fn cache_slug(&self, slug: &str, tunnel_id: &str) -> Result<(), StoreError> {
        self.store
            .set_with_ttl(&slug_key(slug), tunnel_id, self.slug_ttl)
            .await?;
        debug!("slug {} cached -> {}", slug, tunnel_id);
        Ok(())
    }

    /// Cached tunnel_id for `slug`, if the entry is still live.
    pub async fn cached_slug(&self, slug: &str) -> Result<Option<String>, StoreError> {
        let tunnel_id = self.store.get(&slug_key(slug)).await?;
        if let Some(ref tunnel_id) = tunnel_id {
            debug!("slug cache hit: {} -> {}", slug, tunnel_id);
        }
        Ok(tunnel_id)
    }

    /// Erase every ownership record this pod holds, plus the pod set.
    /// Called once at shutdown.
    pub async fn teardown(&self) -> Result<(), StoreError> {
        let set_key = self.pod_set_key();
        let tunnel_ids = self.store.set_members(&set_key).await?;

        let mut keys: Vec<String> = tunnel_ids.iter().map(|id| tunnel_key(id)).collect();
        keys.push(set_key);
        self.store.delete(&keys).await?;

        info!(
            "cleaned up {} tunnel(s) for pod {}",
            tunnel_ids.len(),
            self.pod_id
        );
        Ok(())
    }
}
