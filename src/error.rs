use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while driving a ProForm treadmill
#[derive(Error, Debug)]
pub enum ProformError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("Treadmill not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// The communication service was not exposed by the peripheral
    #[error("Communication service {uuid} not found")]
    ServiceNotFound {
        /// Expected service UUID
        uuid: Uuid,
    },

    /// A required characteristic was absent after service discovery
    #[error("Characteristic {uuid} not found - firmware does not match this driver")]
    CharacteristicNotFound {
        /// Expected characteristic UUID
        uuid: Uuid,
    },

    /// Transport-level write failure
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The driver task is gone
    #[error("Driver stopped")]
    DriverStopped,

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, ProformError>;

impl ProformError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::ConnectionFailed(_) | Self::DeviceNotFound
        )
    }

    /// Check if this error is recoverable by retrying the same operation later
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::WriteFailed(_)
        )
    }

    /// Check if this error ends the session for good.
    ///
    /// A missing service or characteristic means the firmware is not one this
    /// driver understands, so reconnecting would only hit the same wall.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ServiceNotFound { .. } | Self::CharacteristicNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = ProformError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());
        assert!(!connection_error.is_fatal());

        let timeout_error = ProformError::Timeout { timeout_ms: 300 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        let missing = ProformError::CharacteristicNotFound {
            uuid: crate::WRITE_CHAR_UUID,
        };
        assert!(missing.is_fatal());
        assert!(!missing.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = ProformError::CharacteristicNotFound {
            uuid: crate::NOTIFY_CHAR_UUID,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("00001535-1412-efde-1523-785feabcd123"));
        assert!(error_string.contains("firmware"));
    }
}
