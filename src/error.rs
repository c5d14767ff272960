use std::error::Error as StdError;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io;

use crate::protocol::{ProtocolError, Status};

/// Every way a client operation can fail, per the taxonomy this crate
/// commits to: a caller can match on the variant to decide whether to
/// retry, log and ignore, or propagate.
#[derive(Debug)]
pub enum Error {
    /// The key was empty, contained a forbidden byte, or could not be made
    /// to fit within the 250-byte wire limit even after digesting.
    InvalidKey(String),
    /// The encoded value (after any compression) exceeded `value_max_bytes`.
    ValueTooLarge { limit: usize, actual: usize },
    /// A value's bytes did not decompress or deserialize cleanly.
    Unmarshal(Box<dyn StdError + Send + Sync>),
    /// A connect, read, write, or timeout failure on the socket.
    Network(io::Error),
    /// No server in the ring is currently alive for a given key.
    Ring(String),
    /// A negative counter amount, non-integer TTL, or similarly malformed
    /// argument to an operation.
    InvalidArgument(String),
    /// A malformed or out-of-sequence frame from the wire.
    Protocol(ProtocolError),
    /// A non-zero status code returned by the server.
    Status(Status),
}

impl Error {
    /// True for the errors the request chokepoint retries exactly once
    /// against a freshly-chosen server (per §4.6).
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Network(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<Status> for Error {
    fn from(err: Status) -> Self {
        Error::Status(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Unmarshal(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Error::InvalidKey(msg) => write!(f, "invalid key: {}", msg),
            Error::ValueTooLarge { limit, actual } => {
                write!(f, "value too large: {} bytes exceeds limit of {}", actual, limit)
            }
            Error::Unmarshal(err) => write!(f, "unmarshal error: {}", err),
            Error::Network(err) => write!(f, "network error: {}", err),
            Error::Ring(msg) => write!(f, "ring error: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::Protocol(err) => write!(f, "protocol error: {}", err),
            Error::Status(status) => write!(f, "status error: {}", status),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Unmarshal(err) => Some(err.as_ref()),
            Error::Network(err) => Some(err),
            Error::Protocol(err) => Some(err),
            Error::Status(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::protocol::{ProtocolError, Status};

    #[test]
    fn display_formats_each_variant() {
        assert_eq!(
            "protocol error: invalid magic byte: 0x8",
            format!("{}", Error::Protocol(ProtocolError::InvalidMagic(8)))
        );
        assert_eq!(
            "status error: key not found",
            format!("{}", Error::Status(Status::KeyNotFound))
        );
        assert_eq!(
            "value too large: 10 bytes exceeds limit of 5",
            format!(
                "{}",
                Error::ValueTooLarge {
                    limit: 5,
                    actual: 10
                }
            )
        );
    }

    #[test]
    fn network_errors_are_retryable() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "boom"));
        assert!(err.is_network());
        assert!(!Error::Ring("no live server".into()).is_network());
    }
}
