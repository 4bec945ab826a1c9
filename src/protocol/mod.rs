//! The narrow wire-protocol seam this crate depends on.
//!
//! The CQL wire codec's typed value encoding/decoding and result-set
//! parsing are out of scope: query parameter values travel as opaque
//! pre-serialized byte blobs, exactly as the wire protocol already nests
//! `[bytes]` values. What *is* in scope is the frame envelope (the 9-byte
//! header carrying the stream id) because the stream manager's
//! multiplexing invariant is untestable without it.

mod frame;
mod query;

pub use frame::{Frame, FrameFlags, FRAME_HEADER_LEN};
pub use query::{query_body, use_keyspace_body, QueryFlags, QueryParams, QueryValue};

/// The CQL protocol versions this crate negotiates between, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: [u8; 3] = [5, 4, 3];

pub const MIN_SUPPORTED_PROTOCOL_VERSION: u8 = 3;

/// Wire opcodes used by the core itself. Additional
/// opcodes the server may send (e.g. `RESULT` subtypes) are represented by
/// their raw byte and interpreted by the out-of-scope result-set codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Opcode {
    Error,
    Startup,
    Ready,
    Authenticate,
    Options,
    Supported,
    Query,
    Result,
    Prepare,
    Execute,
    Register,
    Event,
    Batch,
    AuthChallenge,
    AuthResponse,
    AuthSuccess,
    Other(u8),
}

impl Opcode {
    pub fn as_byte(self) -> u8 {
        match self {
            Opcode::Error => 0x00,
            Opcode::Startup => 0x01,
            Opcode::Ready => 0x02,
            Opcode::Authenticate => 0x03,
            Opcode::Options => 0x05,
            Opcode::Supported => 0x06,
            Opcode::Query => 0x07,
            Opcode::Result => 0x08,
            Opcode::Prepare => 0x09,
            Opcode::Execute => 0x0A,
            Opcode::Register => 0x0B,
            Opcode::Event => 0x0C,
            Opcode::Batch => 0x0D,
            Opcode::AuthChallenge => 0x0E,
            Opcode::AuthResponse => 0x0F,
            Opcode::AuthSuccess => 0x10,
            Opcode::Other(b) => b,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => Opcode::Other(other),
        }
    }
}

/// The consistency levels the core needs to plumb through to the wire;
/// their numeric encoding matches the CQL binary protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Consistency {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    Serial,
    LocalSerial,
    LocalOne,
}

impl Consistency {
    pub fn as_u16(self) -> u16 {
        match self {
            Consistency::Any => 0x0000,
            Consistency::One => 0x0001,
            Consistency::Two => 0x0002,
            Consistency::Three => 0x0003,
            Consistency::Quorum => 0x0004,
            Consistency::All => 0x0005,
            Consistency::LocalQuorum => 0x0006,
            Consistency::EachQuorum => 0x0007,
            Consistency::Serial => 0x0008,
            Consistency::LocalSerial => 0x0009,
            Consistency::LocalOne => 0x000A,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0000 => Consistency::Any,
            0x0001 => Consistency::One,
            0x0002 => Consistency::Two,
            0x0003 => Consistency::Three,
            0x0004 => Consistency::Quorum,
            0x0005 => Consistency::All,
            0x0006 => Consistency::LocalQuorum,
            0x0007 => Consistency::EachQuorum,
            0x0008 => Consistency::Serial,
            0x0009 => Consistency::LocalSerial,
            0x000A => Consistency::LocalOne,
            _ => return None,
        })
    }
}
