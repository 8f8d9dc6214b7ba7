//! Wire protocol for bridge-worker communication.
//!
//! One channel per worker, over the worker's stdin/stdout:
//! - **protocol**: the `Envelope` message shape and well-known message types
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
