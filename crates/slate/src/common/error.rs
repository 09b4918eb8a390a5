use thiserror::Error;

use crate::JobId;

/// Reason why a credential was rejected by `verify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CredFailure {
    BadSignature,
    Expired,
    Revoked,
    Reused,
}

impl std::fmt::Display for CredFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            CredFailure::BadSignature => "invalid signature",
            CredFailure::Expired => "expired",
            CredFailure::Revoked => "revoked",
            CredFailure::Reused => "already used",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Error)]
pub enum SlateError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Not authorized: {0}")]
    Unauthorized(String),
    /// The request is valid but blocked by live usage or higher-priority
    /// work; the caller should queue or retry.
    #[error("Resources temporarily unavailable")]
    InfeasibleNow,
    /// The request can never be satisfied under the current configuration.
    #[error("Requested configuration is not available: {0}")]
    InfeasibleEver(String),
    #[error("Credential rejected: {0}")]
    CredentialInvalid(CredFailure),
    #[error("Transient failure: {0}")]
    Transient(String),
    /// A state invariant was violated; no further mutations are accepted.
    #[error("Fatal: {0}")]
    Fatal(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl SlateError {
    /// The job this failure refers to, stitched into user-visible output
    /// by the controller surface.
    pub fn for_job(self, job_id: JobId) -> SlateError {
        match self {
            SlateError::InvalidRequest(msg) => {
                SlateError::InvalidRequest(format!("job {job_id}: {msg}"))
            }
            SlateError::Unauthorized(msg) => {
                SlateError::Unauthorized(format!("job {job_id}: {msg}"))
            }
            other => other,
        }
    }
}

impl From<bincode::Error> for SlateError {
    fn from(e: bincode::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<String> for SlateError {
    fn from(e: String) -> Self {
        Self::InvalidRequest(e)
    }
}

impl From<&str> for SlateError {
    fn from(e: &str) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

/// Process exit codes of the controller binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    InvalidRequest = 1,
    Unauthorized = 2,
    TryAgain = 3,
    Internal = 4,
}

impl From<&SlateError> for ExitCode {
    fn from(e: &SlateError) -> Self {
        match e {
            SlateError::InvalidRequest(_) | SlateError::InfeasibleEver(_) => {
                ExitCode::InvalidRequest
            }
            SlateError::Unauthorized(_) | SlateError::CredentialInvalid(_) => ExitCode::Unauthorized,
            SlateError::InfeasibleNow | SlateError::Transient(_) => ExitCode::TryAgain,
            _ => ExitCode::Internal,
        }
    }
}
