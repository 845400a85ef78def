/// Response status codes.
///
/// The interesting subset of the memcached status table plus the DCP
/// additions. Codes the client does not branch on are preserved in
/// `Other` so they can be logged faithfully.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Status {
    #[error("success")]
    Success,
    #[error("key not found")]
    KeyNotFound,
    #[error("key exists")]
    KeyExists,
    #[error("value too large")]
    ValueTooLarge,
    #[error("invalid arguments")]
    InvalidArguments,
    #[error("item not stored")]
    NotStored,
    #[error("not my vbucket")]
    NotMyVbucket,
    #[error("no bucket selected")]
    NoBucket,
    #[error("authentication error")]
    AuthError,
    #[error("authentication continue")]
    AuthContinue,
    #[error("range error")]
    RangeError,
    #[error("rollback required")]
    Rollback,
    #[error("access denied")]
    AccessError,
    #[error("node not initialized")]
    NotInitialized,
    #[error("unknown command")]
    UnknownCommand,
    #[error("out of memory")]
    OutOfMemory,
    #[error("not supported")]
    NotSupported,
    #[error("internal error")]
    InternalError,
    #[error("server busy")]
    Busy,
    #[error("temporary failure")]
    TemporaryFailure,
    #[error("unknown collection")]
    UnknownCollection,
    #[error("unknown scope")]
    UnknownScope,
    #[error("status {0:#06x}")]
    Other(u16),
}

impl Status {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => Self::Success,
            0x0001 => Self::KeyNotFound,
            0x0002 => Self::KeyExists,
            0x0003 => Self::ValueTooLarge,
            0x0004 => Self::InvalidArguments,
            0x0005 => Self::NotStored,
            0x0007 => Self::NotMyVbucket,
            0x0008 => Self::NoBucket,
            0x0020 => Self::AuthError,
            0x0021 => Self::AuthContinue,
            0x0022 => Self::RangeError,
            0x0023 => Self::Rollback,
            0x0024 => Self::AccessError,
            0x0025 => Self::NotInitialized,
            0x0081 => Self::UnknownCommand,
            0x0082 => Self::OutOfMemory,
            0x0083 => Self::NotSupported,
            0x0084 => Self::InternalError,
            0x0085 => Self::Busy,
            0x0086 => Self::TemporaryFailure,
            0x0088 => Self::UnknownCollection,
            0x008c => Self::UnknownScope,
            other => Self::Other(other),
        }
    }

    pub fn to_code(self) -> u16 {
        match self {
            Self::Success => 0x0000,
            Self::KeyNotFound => 0x0001,
            Self::KeyExists => 0x0002,
            Self::ValueTooLarge => 0x0003,
            Self::InvalidArguments => 0x0004,
            Self::NotStored => 0x0005,
            Self::NotMyVbucket => 0x0007,
            Self::NoBucket => 0x0008,
            Self::AuthError => 0x0020,
            Self::AuthContinue => 0x0021,
            Self::RangeError => 0x0022,
            Self::Rollback => 0x0023,
            Self::AccessError => 0x0024,
            Self::NotInitialized => 0x0025,
            Self::UnknownCommand => 0x0081,
            Self::OutOfMemory => 0x0082,
            Self::NotSupported => 0x0083,
            Self::InternalError => 0x0084,
            Self::Busy => 0x0085,
            Self::TemporaryFailure => 0x0086,
            Self::UnknownCollection => 0x0088,
            Self::UnknownScope => 0x008c,
            Self::Other(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Statuses that no amount of retrying will fix. Used by the channel
    /// to classify handshake failures as permanent.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            Self::AuthError
                | Self::AccessError
                | Self::NoBucket
                | Self::KeyNotFound
                | Self::NotSupported
                | Self::UnknownCommand
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for code in 0u16..=0x100 {
            assert_eq!(Status::from_code(code).to_code(), code);
        }
    }

    #[test]
    fn test_permanence_classification() {
        assert!(Status::AuthError.is_permanent());
        assert!(Status::NoBucket.is_permanent());
        assert!(!Status::TemporaryFailure.is_permanent());
        assert!(!Status::Rollback.is_permanent());
    }
}
