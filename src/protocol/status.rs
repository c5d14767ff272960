use std::fmt::{Display, Formatter, Result as FmtResult};

/// Status codes carried in a response header's `vbucket_or_status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoError,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    IncrDecrOnNonNumericValue,
    VbucketBelongsToAnotherServer,
    AuthenticationError,
    AuthenticationContinue,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    Unknown(u16),
}

impl From<u16> for Status {
    fn from(val: u16) -> Self {
        match val {
            0x00 => Status::NoError,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::ValueTooLarge,
            0x04 => Status::InvalidArguments,
            0x05 => Status::ItemNotStored,
            0x06 => Status::IncrDecrOnNonNumericValue,
            0x07 => Status::VbucketBelongsToAnotherServer,
            0x08 => Status::AuthenticationError,
            0x09 => Status::AuthenticationContinue,
            0x81 => Status::UnknownCommand,
            0x82 => Status::OutOfMemory,
            0x83 => Status::NotSupported,
            0x84 => Status::InternalError,
            0x85 => Status::Busy,
            0x86 => Status::TemporaryFailure,
            other => Status::Unknown(other),
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let msg = match self {
            Status::NoError => "no error",
            Status::KeyNotFound => "key not found",
            Status::KeyExists => "key exists",
            Status::ValueTooLarge => "value too large",
            Status::InvalidArguments => "invalid arguments",
            Status::ItemNotStored => "item not stored",
            Status::IncrDecrOnNonNumericValue => "incr/decr on non-numeric value",
            Status::VbucketBelongsToAnotherServer => "vbucket belongs to another server",
            Status::AuthenticationError => "authentication error",
            Status::AuthenticationContinue => "authentication continue",
            Status::UnknownCommand => "unknown command",
            Status::OutOfMemory => "out of memory",
            Status::NotSupported => "not supported",
            Status::InternalError => "internal error",
            Status::Busy => "busy",
            Status::TemporaryFailure => "temporary failure",
            Status::Unknown(code) => return write!(f, "unknown status ({:#x})", code),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::Status;

    #[test]
    fn maps_known_codes() {
        assert_eq!(Status::KeyNotFound, Status::from(0x01));
        assert_eq!(Status::KeyExists, Status::from(0x02));
        assert_eq!(Status::AuthenticationContinue, Status::from(0x09));
    }

    #[test]
    fn unknown_code_is_preserved() {
        match Status::from(0xbeef) {
            Status::Unknown(code) => assert_eq!(0xbeef, code),
            other => panic!("expected Unknown, got {:?}", other),
        }
    }
}
