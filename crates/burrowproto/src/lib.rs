//! Wire types shared between the Burrow edge gateway and its agents.
//!
//! Two surfaces live here: the JSON envelope spoken over the agent
//! WebSocket, and the (consumed) Control Plane HTTP contract.

pub mod control;
pub mod envelope;

pub use control::{SlugResolution, TunnelStatus, TunnelValidation};
pub use envelope::{RequestFrame, ResponseFrame, TunnelFrame};
