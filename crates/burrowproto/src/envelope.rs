//! The JSON envelope spoken over an agent WebSocket.
//!
//! Every frame is a text message carrying an object with a `type` field.
//! Unrecognized types deserialize to [`TunnelFrame::Unknown`] so newer
//! agents can speak past older gateways without being disconnected.
//!
//! ```text
//! edge -> agent: {"type":"request","request_id":"<uuid>","method":"GET",
//!                 "path":"/hi","headers":{...},"body":null}
//! agent -> edge: {"type":"response","request_id":"<uuid>","status":200,
//!                 "headers":{...},"body":"ok"}
//! either way:    {"type":"ping"} / {"type":"pong"}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A request forwarded from the public HTTP surface to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub request_id: String,
    pub method: String,
    /// Always carries a leading slash.
    pub path: String,
    /// Incoming HTTP headers, verbatim.
    pub headers: HashMap<String, String>,
    /// Request body as a string, or null when empty.
    pub body: Option<String>,
}

/// The agent's reply to a [`RequestFrame`], matched by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub request_id: String,
    /// HTTP status to relay; agents may omit it for a plain 200.
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_status() -> u16 {
    200
}

/// One frame of tunnel traffic, dispatched on its `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelFrame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Ping,
    Pong,
    /// Forward-compatible catch-all; receivers ignore these.
    #[serde(other)]
    Unknown,
}
