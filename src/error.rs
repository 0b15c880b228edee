//! Service-wide error taxonomy and its HTTP mapping.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session expired: {0}")]
    Expired(String),

    #[error("version conflict: expected {expected}, got {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("maximum concurrent executions reached")]
    AdmissionRejected,

    #[error("failed to prepare sandbox: {0}")]
    Prep(String),

    #[error("sandbox runtime error: {0}")]
    Runtime(String),

    #[error("execution timed out after {0}s")]
    Timeout(u64),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// HTTP status code the gateway answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) | Self::Expired(_) => 404,
            Self::VersionConflict { .. } | Self::AdmissionRejected => 409,
            Self::Prep(_) | Self::Runtime(_) | Self::Config(_) => 500,
            Self::Timeout(_) => 504,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
