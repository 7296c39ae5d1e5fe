//! Control Plane contract types.
//!
//! The gateway consumes two endpoints and nothing else:
//! `GET /api/tunnels/resolve/{slug}` and `POST /api/tunnels/validate`.
//! These types mirror their response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Lifecycle state of a tunnel as reported by the Control Plane.
///
/// `Unauthorized` and `NotFound` are synthesized locally from 401/404
/// validation replies; the Control Plane itself only emits the first three.
/// Statuses this gateway does not know map to `Unknown` instead of failing
/// the parse, so a newer Control Plane cannot take the forwarder down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Active,
    Expired,
    Revoked,
    Unauthorized,
    NotFound,
    Unknown,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Active => "active",
            TunnelStatus::Expired => "expired",
            TunnelStatus::Revoked => "revoked",
            TunnelStatus::Unauthorized => "unauthorized",
            TunnelStatus::NotFound => "not_found",
            TunnelStatus::Unknown => "unknown",
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s {
            "active" => TunnelStatus::Active,
            "expired" => TunnelStatus::Expired,
            "revoked" => TunnelStatus::Revoked,
            "unauthorized" => TunnelStatus::Unauthorized,
            "not_found" => TunnelStatus::NotFound,
            _ => TunnelStatus::Unknown,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TunnelStatus::Active)
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for TunnelStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TunnelStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(TunnelStatus::from_wire(&s))
    }
}

/// Reply to `GET /api/tunnels/resolve/{slug}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlugResolution {
    pub tunnel_id: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub status: TunnelStatus,
}

/// Reply to `POST /api/tunnels/validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelValidation {
    pub valid: bool,
    pub tunnel_id: String,
    pub status: TunnelStatus,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TunnelValidation {
    /// Local synthesis for 401 and 404 validation outcomes.
    pub fn denied(tunnel_id: impl Into<String>, status: TunnelStatus) -> Self {
        Self {
            valid: false,
            tunnel_id: tunnel_id.into(),
            status,
            expires_at: None,
        }
    }
}
