//! agent-bridge: typed stdio bridge for long-lived agent worker subprocesses.
//!
//! Spawns one worker process per bridge, exchanges newline-delimited JSON
//! envelopes over the worker's stdin/stdout, and exposes a request/response
//! API with retries, timeouts, bounded outbound queueing, and metrics.

mod bridge;
mod config;
mod correlation;
mod events;
mod metrics;
mod queue;
mod supervisor;

pub mod wire;

pub use bridge::{AgentBridge, ConnectionState, RequestError, SendError};
pub use config::BridgeConfig;
pub use events::BridgeEvent;
pub use metrics::BridgeMetrics;
pub use supervisor::{AgentSpawner, ConnectError, ScriptSpawner, SpawnError};
pub use wire::protocol::{CorrelationId, Envelope, MSG_PING, MSG_PONG, MSG_REGISTER, MSG_STOP};
