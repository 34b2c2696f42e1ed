//! Error types for peili

use thiserror::Error;

/// Result type alias for peili operations
pub type Result<T> = std::result::Result<T, PeiliError>;

/// Main error type for peili
#[derive(Error, Debug)]
pub enum PeiliError {
    /// Configuration error (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record body outside the configured size bounds
    #[error("record body of {size} bytes outside bounds [{min}, {max}]")]
    OversizedRecord { size: usize, min: u32, max: u32 },

    /// Malformed on-disk record frame
    #[error("malformed record frame: {0}")]
    Codec(String),

    /// Queue input channel closed
    #[error("queue '{0}' is closed")]
    QueueClosed(String),

    /// HTTP client construction error
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Metrics registration error
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Sidecar metadata (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PeiliError {
    fn from(err: serde_json::Error) -> Self {
        PeiliError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for PeiliError {
    fn from(err: serde_yaml::Error) -> Self {
        PeiliError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversized_record_message() {
        let err = PeiliError::OversizedRecord {
            size: 2048,
            min: 0,
            max: 1024,
        };
        assert_eq!(
            err.to_string(),
            "record body of 2048 bytes outside bounds [0, 1024]"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PeiliError = io.into();
        assert!(matches!(err, PeiliError::Io(_)));
    }
}
