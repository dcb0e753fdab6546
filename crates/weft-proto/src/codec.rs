//! Newline-delimited framing.
//!
//! One JSON message per line. The inbound side accumulates bytes in a
//! bounded buffer; a line that never terminates within the limit is a hard
//! protocol error (the transport closes on it). Trailing partial fragments
//! are kept across reads.

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use crate::rpc::ProtocolError;

/// Serialize a message and append the line terminator.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    let mut out = serde_json::to_vec(message)?;
    out.push(b'\n');
    Ok(Bytes::from(out))
}

/// Accumulating inbound line buffer with a hard byte limit.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_bytes,
        }
    }

    /// Append freshly read bytes and drain every complete line.
    ///
    /// Returns the complete frames (without terminators). Empty lines are
    /// skipped. Errors when the unterminated remainder exceeds the limit;
    /// the buffer is unusable afterwards and the caller must close.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, ProtocolError> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = memchr_newline(&self.buf) {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos); // drop '\n'
            if line.ends_with(b"\r") {
                line.truncate(line.len() - 1);
            }
            if !line.is_empty() {
                frames.push(line.freeze());
            }
        }

        if self.buf.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameOverflow {
                observed: self.buf.len(),
                limit: self.max_frame_bytes,
            });
        }
        Ok(frames)
    }

    /// Bytes of the pending partial frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn memchr_newline(haystack: &[u8]) -> Option<usize> {
    haystack.iter().position(|&b| b == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_multiple_lines_in_one_read() {
        let mut fb = FrameBuffer::new(1024);
        let frames = fb.push(b"{\"a\":1}\n{\"b\":2}\n").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"{\"a\":1}");
        assert_eq!(fb.pending(), 0);
    }

    #[test]
    fn preserves_partial_fragment_across_reads() {
        let mut fb = FrameBuffer::new(1024);
        assert!(fb.push(b"{\"a\":").unwrap().is_empty());
        assert_eq!(fb.pending(), 5);
        let frames = fb.push(b"1}\n").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"{\"a\":1}");
    }

    #[test]
    fn strips_carriage_return_and_skips_blank_lines() {
        let mut fb = FrameBuffer::new(1024);
        let frames = fb.push(b"{}\r\n\n{\"x\":0}\n").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"{}");
    }

    #[test]
    fn unterminated_line_over_limit_is_fatal() {
        let mut fb = FrameBuffer::new(8);
        let err = fb.push(b"0123456789abcdef").unwrap_err();
        assert!(matches!(err, ProtocolError::FrameOverflow { .. }));
    }

    #[test]
    fn long_but_terminated_line_within_limit_passes() {
        let mut fb = FrameBuffer::new(8);
        // The complete line drains before the limit check applies.
        let frames = fb.push(b"{\"k\":1}\n").unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn encode_appends_newline() {
        let frame = encode_frame(&json!({"m": 1})).unwrap();
        assert!(frame.ends_with(b"\n"));
    }
}
