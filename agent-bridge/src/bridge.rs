//! The bridge itself: one handle, one worker child, one event loop.
//!
//! Flow:
//! 1. `connect` spawns the worker and waits for its registration handshake
//! 2. A single event-loop task takes ownership of the child, the framed
//!    stdin/stdout, and the pending-request table
//! 3. The handle talks to the loop over an unbounded command channel, so
//!    `send` never suspends
//! 4. On worker crash: fail all pending requests, emit an exit event
//!
//! Concurrent bridges are fully independent; nothing here is shared across
//! instances.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::FramedWrite;

use crate::config::BridgeConfig;
use crate::correlation::{PendingSender, PendingTable, backoff_delay};
use crate::events::{BridgeEvent, EVENT_CHANNEL_CAPACITY};
use crate::metrics::{BridgeMetrics, MetricsInner};
use crate::queue::OutboundQueue;
use crate::supervisor::{self, ConnectError, SpawnedAgent};
use crate::wire::codec::{EnvelopeCodec, Frame};
use crate::wire::protocol::{CorrelationId, Envelope};

/// Pause between queued messages while draining, to avoid saturating the
/// child's input buffer.
const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period used when the handle is dropped without an explicit
/// disconnect.
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for a crashed child to become reapable before killing it.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle of a bridge instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("bridge is not connected")]
    NotConnected,
    #[error("bridge lost its worker")]
    Disconnected,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("bridge is not connected")]
    NotConnected,
    #[error("bridge lost its worker")]
    Disconnected,
    #[error("request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },
}

enum Command {
    Send(Envelope),
    Register {
        id: CorrelationId,
        tx: PendingSender,
    },
    Deregister {
        id: CorrelationId,
    },
    Disconnect {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
}

struct Shared {
    state: Mutex<ConnectionState>,
    metrics: Mutex<MetricsInner>,
    queue: Mutex<OutboundQueue>,
    events: broadcast::Sender<BridgeEvent>,
}

/// Recover from a poisoned lock; the bridge's invariants hold across
/// panics in lock scopes (plain counters and queue entries).
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Owns exactly one worker process and exchanges envelopes with it over the
/// worker's stdio.
///
/// All host-facing operations live here: `connect`/`disconnect`,
/// fire-and-forget `send`, correlated `request` with retries, metrics, and a
/// broadcast event stream of inbound envelopes and lifecycle events.
pub struct AgentBridge {
    config: BridgeConfig,
    shared: Arc<Shared>,
    conn: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl AgentBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnectionState::Disconnected),
            metrics: Mutex::new(MetricsInner::default()),
            queue: Mutex::new(OutboundQueue::new(config.queue_capacity)),
            events,
        });
        Self {
            config,
            shared,
            conn: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Subscribe to inbound envelopes and lifecycle events. Subscribe before
    /// `connect` to also observe the registration envelope.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.events.subscribe()
    }

    pub fn metrics(&self) -> BridgeMetrics {
        lock(&self.shared.metrics).snapshot()
    }

    /// Zero all counters. Connection state and in-flight requests are
    /// unaffected.
    pub fn reset_metrics(&self) {
        lock(&self.shared.metrics).reset();
    }

    /// Spawn the worker and wait for its registration handshake.
    ///
    /// Fails fast with [`ConnectError::AlreadyConnected`] if a worker is
    /// already owned. A bridge whose worker exited can be connected again.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        {
            let mut state = lock(&self.shared.state);
            match *state {
                ConnectionState::Disconnected | ConnectionState::Closed => {
                    *state = ConnectionState::Connecting;
                }
                _ => return Err(ConnectError::AlreadyConnected),
            }
        }

        let spawned = match supervisor::spawn_agent(
            &self.config,
            &self.shared.events,
            &self.shared.metrics,
        )
        .await
        {
            Ok(spawned) => spawned,
            Err(e) => {
                let mut state = lock(&self.shared.state);
                *state = match e {
                    // No child was ever started; the bridge is back where it
                    // began.
                    ConnectError::Spawn(_) => ConnectionState::Disconnected,
                    _ => ConnectionState::Closed,
                };
                return Err(e);
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *lock(&self.conn) = Some(cmd_tx);
        *lock(&self.shared.state) = ConnectionState::Ready;

        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_event_loop(spawned, cmd_rx, shared));

        Ok(())
    }

    /// Fire-and-forget send. Never suspends.
    ///
    /// While the worker is still connecting the envelope is held in the
    /// outbound queue and drained (oldest first) once the worker is ready.
    pub fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        let state = self.state();
        match state {
            ConnectionState::Ready => {
                let dispatched = {
                    let conn = lock(&self.conn);
                    match conn.as_ref() {
                        Some(tx) => tx.send(Command::Send(envelope)).is_ok(),
                        None => false,
                    }
                };
                if !dispatched {
                    return Err(SendError::Disconnected);
                }
                lock(&self.shared.metrics).record_sent();
                Ok(())
            }
            ConnectionState::Connecting => {
                lock(&self.shared.queue).enqueue(envelope);
                Ok(())
            }
            ConnectionState::Disconnected => Err(SendError::NotConnected),
            ConnectionState::Closing | ConnectionState::Closed => Err(SendError::Disconnected),
        }
    }

    /// Correlated request using the configured timeout and retry budget.
    pub async fn request(&self, envelope: Envelope) -> Result<serde_json::Value, RequestError> {
        self.request_with(envelope, self.config.timeout, self.config.max_retries)
            .await
    }

    /// Liveness probe: `agent.ping` → `agent.pong` payload.
    pub async fn ping(&self) -> Result<serde_json::Value, RequestError> {
        self.request(Envelope::ping()).await
    }

    /// Correlated request with explicit deadline and retry budget.
    ///
    /// Each attempt is sent under a fresh correlation id; a timed-out
    /// attempt's id is deregistered so a late response is discarded rather
    /// than resolving a retry it does not belong to. Retry `k` is delayed by
    /// `retry_base_delay * k`. Timeouts count as errors in the metrics;
    /// exhaustion surfaces as [`RequestError::Timeout`].
    pub async fn request_with(
        &self,
        envelope: Envelope,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<serde_json::Value, RequestError> {
        if self.state() != ConnectionState::Ready {
            return Err(match self.state() {
                ConnectionState::Closing | ConnectionState::Closed => RequestError::Disconnected,
                _ => RequestError::NotConnected,
            });
        }

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = backoff_delay(self.config.retry_base_delay, attempt);
                tracing::debug!(kind = %envelope.kind, attempt, ?delay, "retrying request");
                tokio::time::sleep(delay).await;
            }

            let id = CorrelationId::new();
            let (tx, rx) = oneshot::channel();
            {
                let conn = lock(&self.conn);
                let sender = conn.as_ref().ok_or(RequestError::Disconnected)?;
                sender
                    .send(Command::Register {
                        id: id.clone(),
                        tx,
                    })
                    .map_err(|_| RequestError::Disconnected)?;
            }

            let started = Instant::now();
            if let Err(e) = self.send(envelope.clone().with_correlation(id.clone())) {
                self.deregister(&id);
                return Err(match e {
                    SendError::NotConnected => RequestError::NotConnected,
                    SendError::Disconnected => RequestError::Disconnected,
                });
            }

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(data)) => {
                    lock(&self.shared.metrics).record_latency(started.elapsed());
                    return Ok(data);
                }
                // Sender dropped: the loop failed all pendings on disconnect.
                Ok(Err(_)) => return Err(RequestError::Disconnected),
                Err(_) => {
                    self.deregister(&id);
                    lock(&self.shared.metrics).record_error();
                    tracing::warn!(
                        kind = %envelope.kind,
                        correlation_id = %id,
                        attempt,
                        "request attempt timed out"
                    );
                }
            }
        }

        Err(RequestError::Timeout {
            attempts: max_retries + 1,
        })
    }

    fn deregister(&self, id: &CorrelationId) {
        let conn = lock(&self.conn);
        if let Some(tx) = conn.as_ref() {
            let _ = tx.send(Command::Deregister { id: id.clone() });
        }
    }

    /// Graceful shutdown: best-effort `agent.stop`, then race the worker's
    /// own exit against `grace` and force-kill on expiry.
    ///
    /// Idempotent and infallible from the caller's point of view; the bridge
    /// always ends up Closed.
    pub async fn disconnect(&self, grace: Duration) {
        let cmd_tx = lock(&self.conn).take();

        if let Some(tx) = cmd_tx {
            *lock(&self.shared.state) = ConnectionState::Closing;
            let (done_tx, done_rx) = oneshot::channel();
            if tx
                .send(Command::Disconnect {
                    grace,
                    done: done_tx,
                })
                .is_ok()
            {
                // Loop already gone (worker crashed) counts as done.
                let _ = done_rx.await;
            }
        }

        *lock(&self.shared.state) = ConnectionState::Closed;
    }
}

async fn run_event_loop(
    spawned: SpawnedAgent,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
) {
    let SpawnedAgent {
        mut child,
        mut writer,
        mut reader,
        register,
    } = spawned;

    tracing::debug!(
        agent_id = register.agent_id().unwrap_or("<unknown>"),
        "bridge event loop started"
    );

    let mut pending = PendingTable::new();

    drain_queue(&shared, &mut writer).await;

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Send(envelope)) => {
                        if let Err(e) = writer.send(envelope).await {
                            lock(&shared.metrics).record_error();
                            tracing::error!(error = %e, "failed to write envelope to worker");
                            let _ = shared.events.send(BridgeEvent::Error {
                                message: format!("write failed: {}", e),
                            });
                        }
                    }
                    Some(Command::Register { id, tx }) => {
                        pending.register(id, tx);
                    }
                    Some(Command::Deregister { id }) => {
                        pending.remove(&id);
                    }
                    Some(Command::Disconnect { grace, done }) => {
                        let _ = writer.send(Envelope::stop()).await;
                        let status = await_exit(&mut child, grace).await;
                        finish(&shared, &mut pending, status);
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        // Handle dropped without an explicit disconnect.
                        let _ = writer.send(Envelope::stop()).await;
                        let status = await_exit(&mut child, DEFAULT_GRACE).await;
                        finish(&shared, &mut pending, status);
                        return;
                    }
                }
            }

            frame = reader.next() => {
                match frame {
                    Some(Ok(Frame::Envelope(envelope))) => {
                        lock(&shared.metrics).record_received();
                        if let Some(id) = &envelope.correlation_id
                            && !pending.resolve(id, envelope.data.clone())
                        {
                            tracing::debug!(
                                correlation_id = %id,
                                kind = %envelope.kind,
                                "response for unknown correlation id, discarding"
                            );
                        }
                        let _ = shared.events.send(BridgeEvent::Message(envelope));
                    }
                    Some(Ok(Frame::Malformed { raw })) => {
                        lock(&shared.metrics).record_error();
                        tracing::warn!(line = %raw, "unparseable message from worker");
                        let _ = shared.events.send(BridgeEvent::ParseError { raw });
                    }
                    Some(Ok(Frame::Oversized)) => {
                        lock(&shared.metrics).record_error();
                        tracing::warn!(
                            limit = crate::wire::codec::MAX_LINE_LENGTH,
                            "oversized line from worker, discarding"
                        );
                        let _ = shared.events.send(BridgeEvent::Error {
                            message: "oversized line from worker discarded".to_string(),
                        });
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "worker stdout error");
                        let status = await_exit(&mut child, REAP_TIMEOUT).await;
                        finish(&shared, &mut pending, status);
                        return;
                    }
                    None => {
                        tracing::warn!("worker stdout closed (worker crashed?)");
                        let status = await_exit(&mut child, REAP_TIMEOUT).await;
                        finish(&shared, &mut pending, status);
                        return;
                    }
                }
            }
        }
    }
}

/// Flush envelopes queued while the worker was still connecting, oldest
/// first. A failed write requeues the message and ends the pass rather than
/// spinning on a persistent failure.
async fn drain_queue(shared: &Shared, writer: &mut FramedWrite<ChildStdin, EnvelopeCodec>) {
    loop {
        if *lock(&shared.state) != ConnectionState::Ready {
            return;
        }
        let (message, remaining) = {
            let mut queue = lock(&shared.queue);
            (queue.pop(), queue.len())
        };
        let Some(message) = message else { return };
        tracing::trace!(
            kind = %message.envelope.kind,
            queued_for = ?message.enqueued_at.elapsed(),
            "draining queued message"
        );

        if let Err(e) = writer.send(message.envelope.clone()).await {
            tracing::warn!(error = %e, "queue drain failed, requeueing message");
            lock(&shared.metrics).record_error();
            lock(&shared.queue).requeue(message);
            return;
        }
        lock(&shared.metrics).record_sent();

        if remaining > 0 {
            tokio::time::sleep(QUEUE_DRAIN_INTERVAL).await;
        }
    }
}

/// Wait up to `grace` for the child to exit, then force-kill it. Returns the
/// exit status when one was observed.
async fn await_exit(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(code = ?status.code(), signal = ?status.signal(), "worker exited");
            Some(status)
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to await worker exit");
            None
        }
        Err(_) => {
            tracing::warn!("worker did not exit within grace period, killing");
            supervisor::terminate(child).await
        }
    }
}

/// Terminal transition shared by disconnect and crash paths: mark the bridge
/// Closed, reject every pending request, publish the exit.
///
/// State flips before the pendings are dropped so a rejected requester never
/// observes a still-Ready bridge.
fn finish(shared: &Shared, pending: &mut PendingTable, status: Option<ExitStatus>) {
    *lock(&shared.state) = ConnectionState::Closed;
    let failed = pending.fail_all();
    if failed > 0 {
        tracing::warn!(failed, "rejecting pending requests on disconnect");
    }
    let _ = shared.events.send(BridgeEvent::Exit {
        code: status.and_then(|s| s.code()),
        signal: status.and_then(|s| s.signal()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> BridgeConfig {
        BridgeConfig::new("/bin/sh", "worker.sh", "test-agent")
    }

    #[test]
    fn starts_disconnected() {
        let bridge = AgentBridge::new(config());
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
        assert!(!bridge.is_connected());
    }

    #[test]
    fn send_before_connect_is_rejected() {
        let bridge = AgentBridge::new(config());
        let err = bridge.send(Envelope::new("task", json!({}))).unwrap_err();
        assert_eq!(err, SendError::NotConnected);
        assert_eq!(bridge.metrics().sent, 0);
    }

    #[tokio::test]
    async fn request_before_connect_is_rejected() {
        let bridge = AgentBridge::new(config());
        let err = bridge.request(Envelope::ping()).await.unwrap_err();
        assert_eq!(err, RequestError::NotConnected);
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_idempotent() {
        let bridge = AgentBridge::new(config());
        bridge.disconnect(Duration::from_millis(10)).await;
        bridge.disconnect(Duration::from_millis(10)).await;
        assert_eq!(bridge.state(), ConnectionState::Closed);

        let err = bridge.send(Envelope::new("task", json!({}))).unwrap_err();
        assert_eq!(err, SendError::Disconnected);
    }

    #[tokio::test]
    async fn spawn_failure_leaves_bridge_reconnectable() {
        let bridge = AgentBridge::new(BridgeConfig::new(
            "/definitely/not/an/executable",
            "worker.sh",
            "test-agent",
        ));
        let err = bridge.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Spawn(_)));
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connection_state_names() {
        assert_eq!(ConnectionState::Ready.as_str(), "ready");
        assert_eq!(ConnectionState::Closed.as_str(), "closed");
    }
}
