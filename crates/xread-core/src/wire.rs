//! Wire message: the request/response envelope.
//!
//! A `WireMessage` is the header of every frame exchanged between client
//! and server. Read payloads travel next to the header, never inside it.
//!
//! # Layout
//!
//! ```text
//!  0      2   3   4          12         20       24   25
//!  +------+---+---+----------+----------+--------+----+---------------+
//!  | "XR" | v | op| opaque   | retval   | errval | n  | n x field ... |
//!  +------+---+---+----------+----------+--------+----+---------------+
//!
//!  field := tag:u8 len:u16 value[len]
//! ```
//!
//! Integers are little-endian. Optional fields (filename, offset, size)
//! may appear in any order, each at most once. The whole header is bounded
//! by [`MAX_HEADER_LEN`]; the decoder checks every length before touching
//! the bytes it describes.

use crate::error::ProtocolError;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MAGIC: [u8; 2] = *b"XR";
pub const VERSION: u8 = 1;

/// Upper bound on an encoded header.
pub const MAX_HEADER_LEN: usize = 4096;
/// Upper bound on a filename in a read request.
pub const MAX_FILENAME_LEN: usize = 1024;

const FIXED_LEN: usize = 25;
const FIELD_HDR_LEN: usize = 3;

const TAG_FILENAME: u8 = 1;
const TAG_OFFSET: u8 = 2;
const TAG_SIZE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Noop = 0,
    OpenReq = 1,
    OpenRsp = 2,
    CloseReq = 3,
    CloseRsp = 4,
    ReadReq = 5,
    ReadRsp = 6,
    ErrorRsp = 7,
}

impl Opcode {
    pub fn is_request(self) -> bool {
        matches!(self, Self::OpenReq | Self::CloseReq | Self::ReadReq)
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::OpenRsp | Self::CloseRsp | Self::ReadRsp | Self::ErrorRsp
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        Ok(match v {
            0 => Self::Noop,
            1 => Self::OpenReq,
            2 => Self::OpenRsp,
            3 => Self::CloseReq,
            4 => Self::CloseRsp,
            5 => Self::ReadReq,
            6 => Self::ReadRsp,
            7 => Self::ErrorRsp,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// Request/response envelope.
///
/// `opaque` is chosen by the client and echoed unchanged in the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub opcode: Opcode,
    pub opaque: u64,
    pub retval: i64,
    pub errval: i32,
    pub filename: Option<String>,
    pub offset: Option<u64>,
    pub size: Option<u64>,
}

impl WireMessage {
    fn bare(opcode: Opcode, opaque: u64) -> Self {
        Self {
            opcode,
            opaque,
            retval: 0,
            errval: 0,
            filename: None,
            offset: None,
            size: None,
        }
    }

    pub fn noop() -> Self {
        Self::bare(Opcode::Noop, 0)
    }

    pub fn open_req(opaque: u64) -> Self {
        Self::bare(Opcode::OpenReq, opaque)
    }

    pub fn close_req(opaque: u64) -> Self {
        Self::bare(Opcode::CloseReq, opaque)
    }

    /// Read request. `filename` must not exceed [`MAX_FILENAME_LEN`].
    pub fn read_req(opaque: u64, filename: &str, offset: u64, size: u64) -> Self {
        Self {
            filename: Some(filename.to_owned()),
            offset: Some(offset),
            size: Some(size),
            ..Self::bare(Opcode::ReadReq, opaque)
        }
    }

    /// Response carrying a result. `errval` is 0 on success.
    pub fn response(opcode: Opcode, opaque: u64, retval: i64, errval: i32) -> Self {
        Self {
            retval,
            errval,
            ..Self::bare(opcode, opaque)
        }
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = FIXED_LEN;
        if let Some(name) = &self.filename {
            len += FIELD_HDR_LEN + name.len();
        }
        if self.offset.is_some() {
            len += FIELD_HDR_LEN + 8;
        }
        if self.size.is_some() {
            len += FIELD_HDR_LEN + 8;
        }
        len
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        debug_assert!(self
            .filename
            .as_ref()
            .map_or(true, |n| n.len() <= MAX_FILENAME_LEN));

        let nfields = self.filename.is_some() as u8
            + self.offset.is_some() as u8
            + self.size.is_some() as u8;

        buf.reserve(self.encoded_len());
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.opcode as u8);
        buf.put_u64_le(self.opaque);
        buf.put_i64_le(self.retval);
        buf.put_i32_le(self.errval);
        buf.put_u8(nfields);

        if let Some(name) = &self.filename {
            buf.put_u8(TAG_FILENAME);
            buf.put_u16_le(name.len() as u16);
            buf.put_slice(name.as_bytes());
        }
        if let Some(offset) = self.offset {
            buf.put_u8(TAG_OFFSET);
            buf.put_u16_le(8);
            buf.put_u64_le(offset);
        }
        if let Some(size) = self.size {
            buf.put_u8(TAG_SIZE);
            buf.put_u16_le(8);
            buf.put_u64_le(size);
        }
    }

    /// Decode a header. Never panics and never reads past `src`.
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() > MAX_HEADER_LEN {
            return Err(ProtocolError::Oversized {
                what: "header",
                len: src.len(),
                max: MAX_HEADER_LEN,
            });
        }
        if src.len() < FIXED_LEN {
            return Err(ProtocolError::Malformed("truncated header"));
        }

        let mut buf = src;
        if buf[..2] != MAGIC {
            return Err(ProtocolError::Malformed("bad magic"));
        }
        buf.advance(2);
        if buf.get_u8() != VERSION {
            return Err(ProtocolError::Malformed("unsupported version"));
        }
        let opcode = Opcode::try_from(buf.get_u8())?;

        let mut msg = Self::bare(opcode, buf.get_u64_le());
        msg.retval = buf.get_i64_le();
        msg.errval = buf.get_i32_le();
        let nfields = buf.get_u8();

        for _ in 0..nfields {
            if buf.remaining() < FIELD_HDR_LEN {
                return Err(ProtocolError::Malformed("truncated field header"));
            }
            let tag = buf.get_u8();
            let len = buf.get_u16_le() as usize;
            if buf.remaining() < len {
                return Err(ProtocolError::Malformed("truncated field value"));
            }
            let (value, rest) = buf.split_at(len);
            buf = rest;

            match tag {
                TAG_FILENAME => {
                    if msg.filename.is_some() {
                        return Err(ProtocolError::Malformed("duplicate filename"));
                    }
                    if len > MAX_FILENAME_LEN {
                        return Err(ProtocolError::Oversized {
                            what: "filename",
                            len,
                            max: MAX_FILENAME_LEN,
                        });
                    }
                    let name = std::str::from_utf8(value)
                        .map_err(|_| ProtocolError::Malformed("filename is not utf-8"))?;
                    msg.filename = Some(name.to_owned());
                }
                TAG_OFFSET => {
                    if msg.offset.is_some() {
                        return Err(ProtocolError::Malformed("duplicate offset"));
                    }
                    msg.offset = Some(read_u64_field(value)?);
                }
                TAG_SIZE => {
                    if msg.size.is_some() {
                        return Err(ProtocolError::Malformed("duplicate size"));
                    }
                    msg.size = Some(read_u64_field(value)?);
                }
                _ => return Err(ProtocolError::Malformed("unknown field tag")),
            }
        }

        if buf.has_remaining() {
            return Err(ProtocolError::Malformed("trailing bytes"));
        }
        Ok(msg)
    }
}

/// `opaque` of a header that may not decode, if the fixed prefix is intact.
///
/// Lets an error response echo the opaque of a request that failed to
/// parse past its opcode.
pub fn peek_opaque(src: &[u8]) -> Option<u64> {
    if src.len() < FIXED_LEN || src[..2] != MAGIC || src[2] != VERSION {
        return None;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[4..12]);
    Some(u64::from_le_bytes(raw))
}

fn read_u64_field(mut value: &[u8]) -> Result<u64, ProtocolError> {
    if value.len() != 8 {
        return Err(ProtocolError::Malformed("integer field must be 8 bytes"));
    }
    Ok(value.get_u64_le())
}

/// A validated inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Open,
    Close,
    Read {
        filename: String,
        offset: u64,
        size: u64,
    },
}

impl Request {
    pub fn parse(msg: &WireMessage) -> Result<Self, ProtocolError> {
        match msg.opcode {
            Opcode::OpenReq => Ok(Self::Open),
            Opcode::CloseReq => Ok(Self::Close),
            Opcode::ReadReq => {
                let filename = msg
                    .filename
                    .clone()
                    .ok_or(ProtocolError::Malformed("read without filename"))?;
                let offset = msg
                    .offset
                    .ok_or(ProtocolError::Malformed("read without offset"))?;
                let size = msg
                    .size
                    .ok_or(ProtocolError::Malformed("read without size"))?;
                Ok(Self::Read {
                    filename,
                    offset,
                    size,
                })
            }
            other => Err(ProtocolError::UnexpectedOpcode(other)),
        }
    }

    /// Opcode of the successful response to this request.
    pub fn response_opcode(&self) -> Opcode {
        match self {
            Self::Open => Opcode::OpenRsp,
            Self::Close => Opcode::CloseRsp,
            Self::Read { .. } => Opcode::ReadRsp,
        }
    }
}
