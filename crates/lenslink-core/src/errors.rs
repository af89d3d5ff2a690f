use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peripheral disconnected")]
    Disconnected,

    #[error("Permission denied: {permission}")]
    PermissionDenied { permission: String },

    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Service {service} not found")]
    ServiceNotFound { service: String },

    #[error("Characteristic {characteristic} not found")]
    CharacteristicNotFound { characteristic: String },

    #[error("Write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("Payload exceeds MTU ({size} > {mtu})")]
    MtuExceeded { size: usize, mtu: usize },

    #[error("Scan failed: {reason}")]
    ScanFailed { reason: String },

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },
}

impl TransportError {
    /// Capability errors are fatal to a connection attempt and never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. }
                | Self::ServiceNotFound { .. }
                | Self::CharacteristicNotFound { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration invalid: {reason}")]
    Invalid { reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
