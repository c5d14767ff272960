use std::fmt::{Display, Formatter, Result as FmtResult};

/// A malformed or unexpected response from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidMagic(u8),
    PacketTooSmall,
    BodySizeMismatch,
    /// A response's opaque did not match any outstanding request on this
    /// connection. Indicates the connection's framing has desynchronized.
    UnexpectedOpaque { expected: u32, got: u32 },
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ProtocolError::InvalidMagic(byte) => write!(f, "invalid magic byte: {:#x}", byte),
            ProtocolError::PacketTooSmall => write!(f, "packet smaller than the 24-byte header"),
            ProtocolError::BodySizeMismatch => {
                write!(f, "body length did not match the header's body_len")
            }
            ProtocolError::UnexpectedOpaque { expected, got } => write!(
                f,
                "unexpected opaque: expected {}, got {}",
                expected, got
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}
