//! Protocol message types exchanged with a worker process.
//!
//! Every message is a single `Envelope`: a `type` discriminator, an arbitrary
//! JSON `data` payload, and an optional `correlationId` linking a request to
//! its response. Workers register themselves with an `agent.register` envelope
//! on startup and exit on receipt of `agent.stop`.

use serde::{Deserialize, Serialize};

/// Handshake message a worker must emit before the bridge treats it as ready.
pub const MSG_REGISTER: &str = "agent.register";

/// Shutdown request sent by the bridge; a well-behaved worker exits on receipt.
pub const MSG_STOP: &str = "agent.stop";

/// Liveness probe request.
pub const MSG_PING: &str = "agent.ping";

/// Liveness probe response.
pub const MSG_PONG: &str = "agent.pong";

/// Opaque identifier linking a request envelope to its eventual response.
///
/// The bridge generates UUID v4 ids, but inbound envelopes may carry any
/// string the worker echoes back, so this is a string newtype rather than a
/// parsed UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One discrete protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<CorrelationId>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Shutdown request with empty data.
    pub fn stop() -> Self {
        Self::new(MSG_STOP, serde_json::json!({}))
    }

    /// Liveness probe with empty data.
    pub fn ping() -> Self {
        Self::new(MSG_PING, serde_json::json!({}))
    }

    pub fn is_register(&self) -> bool {
        self.kind == MSG_REGISTER
    }

    /// The `id` field of the payload, if present (registration envelopes
    /// carry the worker's agent id here).
    pub fn agent_id(&self) -> Option<&str> {
        self.data.get("id").and_then(|v| v.as_str())
    }
}
