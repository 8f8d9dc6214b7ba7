//! Worker process lifecycle: spawn, handshake, stderr draining.
//!
//! Flow:
//! 1. Spawn the worker subprocess with piped stdio
//! 2. Pump stderr into structured logs (diagnostic only, never protocol)
//! 3. Read framed stdout until the worker registers or the deadline expires
//!
//! The steady-state event loop that owns the child afterwards lives in
//! `bridge.rs`.

use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::lock;
use crate::config::BridgeConfig;
use crate::events::BridgeEvent;
use crate::metrics::MetricsInner;
use crate::wire::codec::{EnvelopeCodec, Frame};
use crate::wire::protocol::Envelope;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait AgentSpawner: Send + Sync {
    fn spawn(&self, config: &BridgeConfig) -> Result<Child, SpawnError>;
}

/// Default spawner: runs `executable script` with unbuffered output and the
/// agent identity exported through the environment.
pub struct ScriptSpawner;

impl AgentSpawner for ScriptSpawner {
    fn spawn(&self, config: &BridgeConfig) -> Result<Child, SpawnError> {
        let child = Command::new(&config.executable)
            .arg(&config.script)
            .env("PYTHONUNBUFFERED", "1")
            .env("AGENT_ID", &config.agent_id)
            .env("AGENT_CAPABILITIES", config.capabilities.join(","))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker did not register within the connect timeout")]
    HandshakeTimeout,
    #[error("worker exited before registering")]
    ExitedEarly,
    #[error("bridge is already connected")]
    AlreadyConnected,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A spawned worker that has completed the registration handshake.
pub(crate) struct SpawnedAgent {
    pub child: Child,
    pub writer: FramedWrite<ChildStdin, EnvelopeCodec>,
    pub reader: FramedRead<ChildStdout, EnvelopeCodec>,
    pub register: Envelope,
}

/// Spawn the worker and wait for its `agent.register` handshake.
///
/// On handshake timeout the unresponsive child is terminated before the error
/// is returned. Envelopes that arrive before registration (including the
/// registration itself) are republished to observers and counted in the
/// metrics, same as steady-state traffic.
pub(crate) async fn spawn_agent(
    config: &BridgeConfig,
    events: &broadcast::Sender<BridgeEvent>,
    metrics: &Mutex<MetricsInner>,
) -> Result<SpawnedAgent, ConnectError> {
    tracing::info!(agent_id = %config.agent_id, executable = %config.executable.display(), "spawning worker");
    let mut child = config.spawner.spawn(config)?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ConnectError::Protocol("stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ConnectError::Protocol("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ConnectError::Protocol("stderr not captured".to_string()))?;

    pump_stderr(stderr, config.agent_id.clone());

    let writer = FramedWrite::new(stdin, EnvelopeCodec::new());
    let mut reader = FramedRead::new(stdout, EnvelopeCodec::new());

    tracing::debug!(timeout = ?config.timeout, "waiting for worker registration");
    let register = match tokio::time::timeout(
        config.timeout,
        wait_for_register(&mut reader, config, events, metrics),
    )
    .await
    {
        Ok(Ok(register)) => register,
        Ok(Err(e)) => {
            terminate(&mut child).await;
            return Err(e);
        }
        Err(_) => {
            tracing::warn!(agent_id = %config.agent_id, "registration timed out, terminating worker");
            terminate(&mut child).await;
            return Err(ConnectError::HandshakeTimeout);
        }
    };

    tracing::info!(agent_id = %config.agent_id, "worker registered");

    Ok(SpawnedAgent {
        child,
        writer,
        reader,
        register,
    })
}

async fn wait_for_register(
    reader: &mut FramedRead<ChildStdout, EnvelopeCodec>,
    config: &BridgeConfig,
    events: &broadcast::Sender<BridgeEvent>,
    metrics: &Mutex<MetricsInner>,
) -> Result<Envelope, ConnectError> {
    loop {
        match reader.next().await {
            Some(Ok(Frame::Envelope(envelope))) => {
                lock(metrics).record_received();
                let _ = events.send(BridgeEvent::Message(envelope.clone()));
                if envelope.is_register() {
                    match envelope.agent_id() {
                        Some(id) if id != config.agent_id => {
                            tracing::warn!(
                                expected = %config.agent_id,
                                registered = %id,
                                "worker registered under an unexpected id"
                            );
                        }
                        None => {
                            tracing::warn!("registration envelope carries no agent id");
                        }
                        _ => {}
                    }
                    return Ok(envelope);
                }
                tracing::warn!(kind = %envelope.kind, "message received before registration");
            }
            Some(Ok(Frame::Malformed { raw })) => {
                lock(metrics).record_error();
                tracing::warn!(line = %raw, "unparseable line before registration");
                let _ = events.send(BridgeEvent::ParseError { raw });
            }
            Some(Ok(Frame::Oversized)) => {
                lock(metrics).record_error();
                tracing::warn!("oversized line before registration, discarding");
                let _ = events.send(BridgeEvent::Error {
                    message: "oversized line from worker discarded".to_string(),
                });
            }
            Some(Err(e)) => {
                return Err(ConnectError::Protocol(format!("stdout read error: {}", e)));
            }
            None => return Err(ConnectError::ExitedEarly),
        }
    }
}

/// Forward worker stderr into structured logs until EOF.
fn pump_stderr(stderr: tokio::process::ChildStderr, agent_id: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        tracing::warn!(target: "agent_bridge::worker", agent_id = %agent_id, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "stderr read error");
                    break;
                }
            }
        }
    });
}

/// Force-kill and reap a child that will not exit on its own. Returns the
/// reaped status when one was observed.
pub(crate) async fn terminate(child: &mut Child) -> Option<ExitStatus> {
    if let Err(e) = child.start_kill() {
        // Already exited is fine; anything else is worth a log line.
        if e.kind() != std::io::ErrorKind::InvalidInput {
            tracing::warn!(error = %e, "failed to kill worker");
        }
    }
    match child.wait().await {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(error = %e, "failed to reap worker");
            None
        }
    }
}
