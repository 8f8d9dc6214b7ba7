//! Typed event stream exposed to bridge observers.

use crate::wire::protocol::Envelope;

/// Number of events a slow subscriber may lag behind before dropping some.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events republished by the bridge.
///
/// Every successfully parsed inbound envelope is broadcast as `Message`;
/// specific-type listeners match on [`Envelope::kind`] while generic
/// loggers/metrics listeners consume everything.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A parsed envelope from the worker (including responses that also
    /// resolved a pending request).
    Message(Envelope),
    /// A line from the worker that was not valid envelope JSON.
    ParseError { raw: String },
    /// The worker process exited, expectedly or not. A signal-killed worker
    /// has no exit code; the signal number is reported instead.
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// A transport-level failure (e.g. a failed stdin write).
    Error { message: String },
}
