//! Pod identity.

use uuid::Uuid;

/// Generate a unique pod identifier: `{hostname}-{8 hex chars}`.
///
/// Generated once at startup; every ownership record this pod writes to
/// the shared store carries it.
pub fn generate_pod_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "edge".to_string());
    let short = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &short[..8])
}
