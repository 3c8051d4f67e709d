//! Common error types

use protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Device path no longer names an attached endpoint
    #[error("Device not available")]
    DeviceUnavailable,

    /// Low-level I/O failure talking to a device
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Invalid framing: {0}")]
    InvalidFraming(String),

    /// Caller's view of the current session is stale
    #[error("Wrong previous session")]
    WrongPreviousSession,

    /// Call lost the race against a release of its session
    #[error("Session released")]
    SessionReleased,

    #[error("Configuration is not correctly signed")]
    BadSignature,

    #[error("Configuration expired")]
    ConfigExpired { now: u64, valid_until: u64 },

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not configured")]
    NotConfigured,

    /// Device initialization failed in a way that suggests missing udev rules
    /// or drivers
    #[error("Device initialization failed, possible driver problem: {0}")]
    DriverProblem(Box<Error>),

    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Device access failures feed the driver-health heuristic
    pub fn is_device_failure(&self) -> bool {
        match self {
            Error::DeviceUnavailable | Error::TransferFailed(_) => true,
            Error::DriverProblem(inner) => inner.is_device_failure(),
            _ => false,
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::BadSignature => Error::BadSignature,
            ProtocolError::ConfigExpired { now, valid_until } => {
                Error::ConfigExpired { now, valid_until }
            }
            ProtocolError::InvalidFraming(msg) => Error::InvalidFraming(msg),
            other => Error::Protocol(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_keep_their_class() {
        assert!(matches!(
            Error::from(ProtocolError::BadSignature),
            Error::BadSignature
        ));
        assert!(matches!(
            Error::from(ProtocolError::InvalidFraming("x".into())),
            Error::InvalidFraming(_)
        ));
        assert!(matches!(
            Error::from(ProtocolError::UnknownTypeId(3)),
            Error::Protocol(_)
        ));
    }

    #[test]
    fn test_device_failure_classification() {
        assert!(Error::DeviceUnavailable.is_device_failure());
        assert!(Error::TransferFailed("pipe".into()).is_device_failure());
        assert!(Error::DriverProblem(Box::new(Error::DeviceUnavailable)).is_device_failure());
        assert!(!Error::SessionReleased.is_device_failure());
        assert!(!Error::InvalidFraming("x".into()).is_device_failure());
    }

    #[test]
    fn test_driver_problem_display_wraps_cause() {
        let err = Error::DriverProblem(Box::new(Error::TransferFailed("timeout".into())));
        assert!(err.to_string().contains("Transfer failed: timeout"));
    }
}
