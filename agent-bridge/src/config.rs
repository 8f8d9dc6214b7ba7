//! Bridge configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::supervisor::{AgentSpawner, ScriptSpawner};

/// Configuration for one bridge instance. Immutable once the bridge is
/// constructed.
///
/// `timeout` is both the connect/handshake deadline and the default
/// per-request deadline; [`AgentBridge::request_with`](crate::AgentBridge::request_with)
/// accepts an explicit override.
#[derive(Clone)]
pub struct BridgeConfig {
    /// Interpreter or binary to run (e.g. `python3`).
    pub executable: PathBuf,
    /// Script or entrypoint passed as the first argument.
    pub script: PathBuf,
    /// Logical identifier the worker is expected to register under.
    pub agent_id: String,
    /// Capabilities declared for this agent, handed to the worker via env.
    pub capabilities: Vec<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Capacity of the outbound queue used while the worker is not yet ready.
    pub queue_capacity: usize,
    pub spawner: Arc<dyn AgentSpawner>,
}

impl BridgeConfig {
    pub fn new(
        executable: impl Into<PathBuf>,
        script: impl Into<PathBuf>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            executable: executable.into(),
            script: script.into(),
            agent_id: agent_id.into(),
            capabilities: Vec::new(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            queue_capacity: 100,
            spawner: Arc::new(ScriptSpawner),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn AgentSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}
