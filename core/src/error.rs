use crate::DeviceState;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device {id} is {state}, expected MOUNTED")]
    InvalidState { id: String, state: DeviceState },

    #[error("Unmount of {id} failed: {source}")]
    Unmount {
        id: String,
        #[source]
        source: UnmountError,
    },

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// OS-level reason an unmount did not complete, carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnmountError {
    #[error("device busy: {0}")]
    Busy(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("unknown failure: {0}")]
    Unknown(String),

    #[error("no answer from the OS after {0:?}")]
    Timeout(Duration),
}

const OS_CODE_MARKER: &str = "(os error ";

impl UnmountError {
    /// Numeric OS result behind the failure, when the platform reported
    /// one. Platforms append it as `(os error N)`, the way
    /// `std::io::Error` displays raw codes.
    pub fn os_code(&self) -> Option<i32> {
        let message = match self {
            UnmountError::Busy(m)
            | UnmountError::PermissionDenied(m)
            | UnmountError::IoFailure(m)
            | UnmountError::Unknown(m) => m,
            UnmountError::Timeout(_) => return None,
        };
        let start = message.rfind(OS_CODE_MARKER)? + OS_CODE_MARKER.len();
        let end = start + message[start..].find(')')?;
        message[start..end].trim().parse().ok()
    }

    /// Classify an errno-style failure.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let detail = err.to_string();
        match err.kind() {
            ErrorKind::PermissionDenied => UnmountError::PermissionDenied(detail),
            ErrorKind::TimedOut => UnmountError::Unknown(detail),
            ErrorKind::NotFound
            | ErrorKind::UnexpectedEof
            | ErrorKind::WriteZero
            | ErrorKind::BrokenPipe => UnmountError::IoFailure(detail),
            _ => match err.raw_os_error() {
                // EBUSY
                Some(16) => UnmountError::Busy(detail),
                // EIO
                Some(5) => UnmountError::IoFailure(detail),
                _ => UnmountError::Unknown(detail),
            },
        }
    }
}

/// The failure taxonomy exposed to the calling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ProbeTimeout,
    NotFound,
    InvalidState,
    Busy,
    PermissionDenied,
    IoFailure,
    Unknown,
    Timeout,
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::NotFound(_) => ErrorKind::NotFound,
            DeviceError::InvalidState { .. } => ErrorKind::InvalidState,
            DeviceError::Unmount { source, .. } => match source {
                UnmountError::Busy(_) => ErrorKind::Busy,
                UnmountError::PermissionDenied(_) => ErrorKind::PermissionDenied,
                UnmountError::IoFailure(_) => ErrorKind::IoFailure,
                UnmountError::Unknown(_) => ErrorKind::Unknown,
                UnmountError::Timeout(_) => ErrorKind::Timeout,
            },
            DeviceError::Probe(_) | DeviceError::Configuration(_) => ErrorKind::Unknown,
            DeviceError::IoError(_) | DeviceError::SerializationError(_) => ErrorKind::IoFailure,
        }
    }

    /// Caller errors are never worth retrying.
    pub fn is_caller_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound | ErrorKind::InvalidState)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[cfg(unix)]
    #[test]
    fn errno_classification() {
        assert_eq!(
            UnmountError::from_io(&io::Error::from_raw_os_error(16)),
            UnmountError::Busy(io::Error::from_raw_os_error(16).to_string())
        );
        assert!(matches!(
            UnmountError::from_io(&io::Error::from_raw_os_error(1)),
            UnmountError::PermissionDenied(_)
        ));
        assert!(matches!(
            UnmountError::from_io(&io::Error::from_raw_os_error(5)),
            UnmountError::IoFailure(_)
        ));
        assert!(matches!(
            UnmountError::from_io(&io::Error::new(io::ErrorKind::Other, "weird")),
            UnmountError::Unknown(_)
        ));
    }

    #[test]
    fn kinds_follow_taxonomy() {
        let err = DeviceError::Unmount {
            id: "usb-1".into(),
            source: UnmountError::Busy("target is busy".into()),
        };
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(!err.is_caller_error());
        assert!(err.to_string().contains("target is busy"));

        let err = DeviceError::InvalidState {
            id: "usb-1".into(),
            state: DeviceState::Unmounting,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(err.is_caller_error());
        assert!(err.to_string().contains("UNMOUNTING"));
    }

    #[test]
    fn os_code_is_read_back_from_the_message() {
        let err = UnmountError::from_io(&io::Error::from_raw_os_error(16));
        assert_eq!(err.os_code(), Some(16));

        let err = UnmountError::Busy("E: is in use (os error 32)".into());
        assert_eq!(err.os_code(), Some(32));

        assert_eq!(UnmountError::Busy("target is busy".into()).os_code(), None);
        assert_eq!(UnmountError::Timeout(std::time::Duration::from_secs(1)).os_code(), None);
    }
}
