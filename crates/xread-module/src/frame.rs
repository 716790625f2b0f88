//! Stream framing for TCP.
//!
//! ```text
//!  +-------------+--------------+----------------+-----------------+
//!  | header_len  | payload_len  | header bytes   | payload bytes   |
//!  | u32 LE      | u32 LE       | (WireMessage)  | (read data)     |
//!  +-------------+--------------+----------------+-----------------+
//! ```
//!
//! A header longer than `MAX_HEADER_LEN` is still framed and handed up, so
//! the receiver can answer it with an error and keep the connection. Only
//! a header past [`MAX_FRAME_HEADER_LEN`] or a payload past
//! [`MAX_PAYLOAD_LEN`] means the stream can no longer be trusted; the
//! decoder reports it and the connection is dropped.

use xread_core::error::ProtocolError;
use xread_core::wire::MAX_HEADER_LEN;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const FRAME_PREFIX_LEN: usize = 8;
pub const MAX_PAYLOAD_LEN: usize = 64 << 20;
/// Largest header the framer will consume. Headers between
/// `MAX_HEADER_LEN` and this are delivered and rejected by the decoder.
pub const MAX_FRAME_HEADER_LEN: usize = 64 << 10;

pub fn frame_prefix(header_len: usize, payload_len: usize) -> [u8; FRAME_PREFIX_LEN] {
    let mut out = [0u8; FRAME_PREFIX_LEN];
    out[..4].copy_from_slice(&(header_len as u32).to_le_bytes());
    out[4..].copy_from_slice(&(payload_len as u32).to_le_bytes());
    out
}

/// Append a complete frame to `dst`.
pub fn put_frame(dst: &mut BytesMut, header: &[u8], payload: &[u8]) {
    dst.reserve(FRAME_PREFIX_LEN + header.len() + payload.len());
    dst.put_u32_le(header.len() as u32);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(header);
    dst.put_slice(payload);
}

#[derive(Debug)]
pub struct Frame {
    pub header: Bytes,
    pub payload: Bytes,
}

/// Incremental frame decoder over a byte stream.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, if one has fully arrived.
    pub fn decode(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }
        let mut prefix = &self.buf[..FRAME_PREFIX_LEN];
        let header_len = prefix.get_u32_le() as usize;
        let payload_len = prefix.get_u32_le() as usize;

        if header_len > MAX_FRAME_HEADER_LEN {
            return Err(ProtocolError::Oversized {
                what: "frame header",
                len: header_len,
                max: MAX_FRAME_HEADER_LEN,
            });
        }
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::Oversized {
                what: "frame payload",
                len: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }

        let total = FRAME_PREFIX_LEN + header_len + payload_len;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total);
        frame.advance(FRAME_PREFIX_LEN);
        let header = frame.split_to(header_len).freeze();
        Ok(Some(Frame {
            header,
            payload: frame.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_across_partial_reads() {
        let mut wire = BytesMut::new();
        put_frame(&mut wire, b"hdr-one", b"");
        put_frame(&mut wire, b"hdr-two", b"payload");

        let mut dec = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(3) {
            dec.extend(chunk);
            while let Some(f) = dec.decode().unwrap() {
                frames.push(f);
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].header[..], b"hdr-one");
        assert!(frames[0].payload.is_empty());
        assert_eq!(&frames[1].header[..], b"hdr-two");
        assert_eq!(&frames[1].payload[..], b"payload");
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_long_header_is_delivered() {
        let header = vec![7u8; MAX_HEADER_LEN + 904];
        let mut wire = BytesMut::new();
        put_frame(&mut wire, &header, b"");
        put_frame(&mut wire, b"next", b"");

        let mut dec = FrameDecoder::new();
        dec.extend(&wire);
        let first = dec.decode().unwrap().unwrap();
        assert_eq!(first.header.len(), MAX_HEADER_LEN + 904);
        assert_eq!(&dec.decode().unwrap().unwrap().header[..], b"next");
    }

    #[test]
    fn test_header_past_frame_limit_is_fatal() {
        let mut dec = FrameDecoder::new();
        dec.extend(&frame_prefix(MAX_FRAME_HEADER_LEN + 1, 0));
        assert!(matches!(
            dec.decode(),
            Err(ProtocolError::Oversized { what: "frame header", .. })
        ));
    }
}
