//! Error types for GhostCodec

use thiserror::Error;

/// Result type alias for GhostCodec operations
pub type Result<T> = std::result::Result<T, Error>;

/// GhostCodec error type
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Config file error: {0}")]
    ConfigFile(String),

    // Backend construction errors
    #[error("Backend initialization failed: {0}")]
    BackendInit(String),

    #[error("Driver not available: {0}")]
    DriverUnavailable(String),

    #[error("Codec not supported: {0}")]
    CodecNotSupported(String),

    // Per-operation errors
    #[error("Submit failed: {0}")]
    Submit(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Decoder recreation failed: {0}")]
    Recreate(String),

    #[error("Output error: {0}")]
    Output(String),

    #[error("Interop error: {0}")]
    Interop(String),

    #[error("Colorspace conversion error: {0}")]
    ColorspaceConversion(String),

    // Session lifecycle errors
    #[error("Session is faulted, only destroy is permitted")]
    Faulted,

    #[error("Session already destroyed")]
    Destroyed,

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Negative status code reported at the API boundary
    pub fn status(&self) -> i32 {
        match self {
            Error::Configuration(_) => -2,
            Error::ConfigFile(_) => -3,
            Error::BackendInit(_) => -10,
            Error::DriverUnavailable(_) => -11,
            Error::CodecNotSupported(_) => -12,
            Error::Submit(_) => -20,
            Error::Timeout(_) => -21,
            Error::Recreate(_) => -22,
            Error::Output(_) => -23,
            Error::Interop(_) => -24,
            Error::ColorspaceConversion(_) => -25,
            Error::Faulted => -30,
            Error::Destroyed => -31,
            Error::Unsupported(_) => -32,
            Error::Io(_) => -40,
            Error::Internal(_) => -1,
        }
    }

    /// Check if the session can keep operating after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Submit(_) | Error::Timeout(_) | Error::Output(_) | Error::Interop(_)
        )
    }

    /// Check if this is a hardware/driver issue
    pub fn is_hardware_issue(&self) -> bool {
        matches!(
            self,
            Error::DriverUnavailable(_) | Error::CodecNotSupported(_) | Error::BackendInit(_)
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::ConfigFile(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_negative() {
        let errors = [
            Error::Configuration("odd width".into()),
            Error::BackendInit("context".into()),
            Error::Submit("rejected".into()),
            Error::Timeout("sync".into()),
            Error::Recreate("decoder".into()),
            Error::Output("shared handle".into()),
            Error::Faulted,
            Error::Internal("x".into()),
        ];
        for e in &errors {
            assert!(e.status() < 0, "{e} mapped to {}", e.status());
        }
    }

    #[test]
    fn test_faulted_is_not_recoverable() {
        assert!(!Error::Faulted.is_recoverable());
        assert!(!Error::Recreate("x".into()).is_recoverable());
        assert!(Error::Timeout("x".into()).is_recoverable());
    }
}
