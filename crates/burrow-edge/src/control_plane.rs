//! Control Plane client.
//!
//! Two idempotent operations: resolve a slug to tunnel metadata, and
//! validate a `(tunnel_id, token)` pair during WebSocket admission. The
//! client carries no retry logic; callers decide what a transient failure
//! means for them (the forwarder answers 502, admission closes 1011).

use burrowconf::ControlPlaneConfig;
use burrowproto::{SlugResolution, TunnelStatus, TunnelValidation};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

/// Any of these is "transient" from the caller's point of view: the
/// Control Plane gave no authoritative answer.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("control plane request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("control plane returned {0}")]
    Status(StatusCode),
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    tunnel_id: &'a str,
    token: &'a str,
}

pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
}

impl ControlPlaneClient {
    pub fn new(config: &ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolve `slug` to tunnel metadata.
    ///
    /// `Ok(None)` means the Control Plane authoritatively does not know
    /// the slug; `Err` means it could not answer.
    pub async fn resolve_slug(
        &self,
        slug: &str,
    ) -> Result<Option<SlugResolution>, ControlPlaneError> {
        let url = format!("{}/api/tunnels/resolve/{}", self.base_url, slug);
        let response = self.http.get(&url).send().await?;

        match response.status() {
            StatusCode::OK => {
                let resolution: SlugResolution = response.json().await?;
                info!("slug {} resolved -> {}", slug, resolution.tunnel_id);
                Ok(Some(resolution))
            }
            StatusCode::NOT_FOUND => {
                info!("slug {} not found in control plane", slug);
                Ok(None)
            }
            status => {
                warn!("control plane error resolving slug {}: {}", slug, status);
                Err(ControlPlaneError::Status(status))
            }
        }
    }

    /// Validate that `(tunnel_id, token)` is authorized to connect.
    ///
    /// 401 and 404 are authoritative denials and come back as
    /// `valid: false` with a synthesized status; only faults the Control
    /// Plane did not decide are errors.
    pub async fn validate_tunnel(
        &self,
        tunnel_id: &str,
        token: &str,
    ) -> Result<TunnelValidation, ControlPlaneError> {
        let url = format!("{}/api/tunnels/validate", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&ValidateRequest { tunnel_id, token })
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let validation: TunnelValidation = response.json().await?;
                info!(
                    "tunnel {} validation completed (valid: {})",
                    tunnel_id, validation.valid
                );
                Ok(validation)
            }
            StatusCode::UNAUTHORIZED => {
                warn!("tunnel {} validation failed: unauthorized", tunnel_id);
                Ok(TunnelValidation::denied(tunnel_id, TunnelStatus::Unauthorized))
            }
            StatusCode::NOT_FOUND => {
                warn!("tunnel {} validation failed: not found", tunnel_id);
                Ok(TunnelValidation::denied(tunnel_id, TunnelStatus::NotFound))
            }
            status => {
                warn!(
                    "control plane error validating tunnel {}: {}",
                    tunnel_id, status
                );
                Err(ControlPlaneError::Status(status))
            }
        }
    }
}
