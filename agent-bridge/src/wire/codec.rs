//! Framed codec for worker communication.
//!
//! Uses LinesCodec for newline framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, etc).
//!
//! A line that fails to decode is surfaced as [`Frame::Malformed`] rather than
//! an error, so one bad message never tears down the whole stream.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::Envelope;

/// Upper bound on a single line from the worker. A worker that never emits a
/// newline must not grow the read buffer without bound.
pub const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// One decoded line from the worker's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Envelope(Envelope),
    /// A complete line that was not valid envelope JSON. The raw text is
    /// retained for diagnostics.
    Malformed { raw: String },
    /// A line that outgrew [`MAX_LINE_LENGTH`] before its newline arrived.
    /// The runaway bytes are discarded up to the next newline and decoding
    /// resumes on the line after it.
    Oversized,
}

/// Codec that frames envelopes one-per-line and serializes with JSON.
///
/// Wraps LinesCodec and adds serde_json serialization. Empty and
/// whitespace-only lines are consumed silently. serde_json escapes interior
/// newlines, so an encoded envelope can never split across frames.
pub struct EnvelopeCodec {
    inner: LinesCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }

    fn frame_line(line: String) -> Option<Frame> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str::<Envelope>(trimmed) {
            Ok(envelope) => Some(Frame::Envelope(envelope)),
            Err(_) => Some(Frame::Malformed { raw: line }),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn line_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "max line length exceeded")
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src) {
                Ok(Some(line)) => {
                    if let Some(frame) = Self::frame_line(line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                // Recoverable: the inner codec discards to the next newline
                // on subsequent calls, the stream itself stays usable.
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Ok(Some(Frame::Oversized));
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A trailing unterminated line at EOF is still a complete message.
        loop {
            match self.inner.decode_eof(src) {
                Ok(Some(line)) => {
                    if let Some(frame) = Self::frame_line(line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Ok(Some(Frame::Oversized));
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            }
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(json, dst).map_err(line_error)
    }
}
