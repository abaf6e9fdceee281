//! gRPC-style length-prefixed message framing.
//!
//! Each frame is `[compression: u8][length: u32 be][payload]`. The parser is
//! tolerant to fragmentation: bytes accumulate across calls and each complete
//! inner frame is emitted exactly once, whatever the chunking.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::{Code, Status};

/// Size of the frame header: one compression byte plus a big-endian length.
pub const HEADER_SIZE: usize = 5;

const BUFFER_SIZE: usize = 8 * 1024;

/// Prepend the 5-byte frame header to `message`.
pub fn pack(message: &[u8]) -> Bytes {
    debug_assert!(message.len() <= u32::MAX as usize);

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + message.len());
    buf.put_u8(0);
    buf.put_u32(message.len() as u32);
    buf.put_slice(message);
    buf.freeze()
}

#[derive(Debug)]
enum State {
    ReadHeader,
    ReadBody { len: usize },
}

/// Stateful frame decoder.
///
/// Holds partial bytes across invocations; [`FrameParser::parse`] may emit
/// zero or more complete frames per network read.
#[derive(Debug)]
pub struct FrameParser {
    buf: BytesMut,
    state: State,
}

impl Default for FrameParser {
    fn default() -> Self {
        FrameParser::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        FrameParser {
            buf: BytesMut::with_capacity(BUFFER_SIZE),
            state: State::ReadHeader,
        }
    }

    /// Feed a chunk of the wire stream, returning every frame it completed.
    pub fn parse(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, Status> {
        self.buf.put_slice(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.decode_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// True if no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        matches!(self.state, State::ReadHeader) && self.buf.is_empty()
    }

    fn decode_frame(&mut self) -> Result<Option<Bytes>, Status> {
        if let State::ReadHeader = self.state {
            if self.buf.remaining() < HEADER_SIZE {
                return Ok(None);
            }

            match self.buf.get_u8() {
                0 => {}
                flag => {
                    trace!("unexpected compression flag");
                    return Err(Status::new(
                        Code::Internal,
                        format!(
                            "protocol error: received message with unsupported compression flag: {flag}"
                        ),
                    ));
                }
            }

            let len = self.buf.get_u32() as usize;
            self.buf.reserve(len);
            self.state = State::ReadBody { len };
        }

        if let State::ReadBody { len } = self.state {
            // not enough of the message yet, keep reading
            if self.buf.remaining() < len {
                return Ok(None);
            }

            self.state = State::ReadHeader;
            return Ok(Some(self.buf.split_to(len).freeze()));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn pack_writes_header() {
        let framed = pack(b"abc");
        assert_eq!(&framed[..], &[0, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn parses_multiple_frames_per_read() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&pack(b"one"));
        wire.extend_from_slice(&pack(b""));
        wire.extend_from_slice(&pack(b"three"));

        let mut parser = FrameParser::new();
        let frames = parser.parse(&wire).unwrap();
        assert_eq!(frames, vec![&b"one"[..], &b""[..], &b"three"[..]]);
        assert!(parser.is_empty());
    }

    #[test]
    fn holds_partial_bytes_across_reads() {
        let framed = pack(b"split me");
        let mut parser = FrameParser::new();

        assert!(parser.parse(&framed[..3]).unwrap().is_empty());
        assert!(parser.parse(&framed[3..7]).unwrap().is_empty());
        let frames = parser.parse(&framed[7..]).unwrap();
        assert_eq!(frames, vec![&b"split me"[..]]);
    }

    #[test]
    fn rejects_compression_flag() {
        let mut framed = pack(b"x").to_vec();
        framed[0] = 1;

        let mut parser = FrameParser::new();
        let err = parser.parse(&framed).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    // Any concatenation of packed frames parses back to the original
    // sequence for any chunking of the wire bytes.
    #[quickcheck]
    fn any_chunking_round_trips(messages: Vec<Vec<u8>>, cuts: Vec<u8>) -> bool {
        let mut wire = Vec::new();
        for message in &messages {
            wire.extend_from_slice(&pack(message));
        }

        let mut parser = FrameParser::new();
        let mut parsed: Vec<Bytes> = Vec::new();
        let mut rest = &wire[..];
        let mut cuts = cuts.into_iter();

        while !rest.is_empty() {
            let take = usize::from(cuts.next().unwrap_or(255)).clamp(1, rest.len());
            let (chunk, tail) = rest.split_at(take);
            parsed.extend(parser.parse(chunk).expect("valid wire bytes"));
            rest = tail;
        }

        parser.is_empty() && parsed.iter().map(|b| &b[..]).eq(messages.iter().map(|m| &m[..]))
    }
}
