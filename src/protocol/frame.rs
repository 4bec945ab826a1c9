//! The 9-byte frame header, grounded on `original_source/cpp-driver/src/constants.hpp`
//! (`CQL_HEADER_SIZE_V3` and later) and on the stream-id field the stream
//! manager multiplexes on.

use bytes::{Buf, BufMut, BytesMut};

use super::Opcode;
use crate::error::{Error, ErrorKind};

pub const FRAME_HEADER_LEN: usize = 9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub const COMPRESSION: FrameFlags = FrameFlags(0x01);
    pub const TRACING: FrameFlags = FrameFlags(0x02);
    pub const CUSTOM_PAYLOAD: FrameFlags = FrameFlags(0x04);
    pub const WARNING: FrameFlags = FrameFlags(0x08);

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | other.0)
    }
}

/// A decoded frame header plus its (still opaque) body.
///
/// The body is never interpreted by this crate beyond the `Opcode` needed to
/// tell an `ERROR` frame from a non-error one; parsing a `RESULT` body into
/// rows is the out-of-scope wire codec's job.
#[derive(Clone, Debug)]
pub struct Frame {
    pub version: u8,
    pub flags: FrameFlags,
    pub stream: i16,
    pub opcode: Opcode,
    pub body: bytes::Bytes,
}

impl Frame {
    /// Builds a request frame. `version` is the negotiated protocol version
    /// with the request/response direction bit (0x80) cleared.
    pub fn request(version: u8, stream: i16, opcode: Opcode, body: bytes::Bytes) -> Self {
        Self { version, flags: FrameFlags::default(), stream, opcode, body }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.opcode, Opcode::Error)
    }

    /// A placeholder success response carrying no interpretable rows, used
    /// when a retry policy decides to treat a failure as a success with an
    /// empty result rather than surface it to the caller.
    pub fn empty_result(version: u8) -> Self {
        Self { version, flags: FrameFlags::default(), stream: 0, opcode: Opcode::Result, body: bytes::Bytes::new() }
    }

    /// Serializes the header and body into `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(FRAME_HEADER_LEN + self.body.len());
        out.put_u8(self.version & 0x7F);
        out.put_u8(self.flags.0);
        out.put_i16(self.stream);
        out.put_u8(self.opcode.as_byte());
        out.put_u32(self.body.len() as u32);
        out.extend_from_slice(&self.body);
    }

    /// Parses just the header out of `src`, returning `(header_minus_body,
    /// body_len)`. Callers read the header first to learn how many more
    /// bytes to buffer before the body is complete.
    pub fn decode_header(src: &[u8]) -> Result<PartialHeader, Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Err(Error::internal("short frame header"));
        }
        let version = src[0] & 0x7F;
        let flags = FrameFlags(src[1]);
        let stream = i16::from_be_bytes([src[2], src[3]]);
        let opcode = Opcode::from_byte(src[4]);
        let length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        Ok(PartialHeader { version, flags, stream, opcode, body_len: length })
    }

    /// Completes a [`PartialHeader`] once `body_len` more bytes are
    /// available in `buf`, consuming them.
    pub fn finish(header: PartialHeader, buf: &mut BytesMut) -> Result<Self, Error> {
        if buf.len() < header.body_len {
            return Err(Error::internal("frame body shorter than declared length"));
        }
        let body = buf.split_to(header.body_len).freeze();
        Ok(Self {
            version: header.version,
            flags: header.flags,
            stream: header.stream,
            opcode: header.opcode,
            body,
        })
    }

    /// Convenience for the error path: decodes the `[int]` error code and
    /// `[string]` message out of an `ERROR` body.
    pub fn error_kind(&self) -> ErrorKind {
        let mut body = self.body.clone();
        if body.len() < 6 {
            return ErrorKind::Server { code: -1, message: "truncated error body".into() };
        }
        let code = body.get_i32();
        let msg_len = body.get_u16() as usize;
        let message = if body.len() >= msg_len {
            String::from_utf8_lossy(&body[..msg_len]).into_owned()
        } else {
            String::from_utf8_lossy(&body).into_owned()
        };
        ErrorKind::Server { code, message }
    }
}

/// A frame header that has been read but whose body may not yet be fully
/// buffered.
#[derive(Clone, Copy, Debug)]
pub struct PartialHeader {
    pub version: u8,
    pub flags: FrameFlags,
    pub stream: i16,
    pub opcode: Opcode,
    pub body_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn round_trips_a_query_frame() {
        let body = Bytes::from_static(b"SELECT 1");
        let frame = Frame::request(4, 7, Opcode::Query, body.clone());

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_LEN + body.len());

        let header = Frame::decode_header(&buf[..FRAME_HEADER_LEN]).unwrap();
        assert_eq!(header.stream, 7);
        assert_eq!(header.body_len, body.len());

        let mut rest = buf.split_off(FRAME_HEADER_LEN);
        let decoded = Frame::finish(header, &mut rest).unwrap();
        assert_eq!(decoded.stream, 7);
        assert_eq!(decoded.opcode, Opcode::Query);
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn negative_stream_ids_round_trip() {
        let frame = Frame::request(4, -1, Opcode::Event, Bytes::new());
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let header = Frame::decode_header(&buf[..FRAME_HEADER_LEN]).unwrap();
        assert_eq!(header.stream, -1);
    }

    #[test]
    fn parses_error_body() {
        let mut body = BytesMut::new();
        body.put_i32(0x1100); // UNAVAILABLE
        let msg = b"not enough replicas";
        body.put_u16(msg.len() as u16);
        body.extend_from_slice(msg);
        let frame = Frame::request(4, 0, Opcode::Error, body.freeze());
        match frame.error_kind() {
            ErrorKind::Server { code, message } => {
                assert_eq!(code, 0x1100);
                assert_eq!(message, "not enough replicas");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
