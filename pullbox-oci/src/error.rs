use std::path::PathBuf;

/// Errors produced by the OCI client.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("manifest inconsistency: {0}")]
    ManifestInconsistency(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("transfer of {digest} interrupted after {received} of {expected} bytes")]
    TransferInterrupted {
        digest: String,
        expected: u64,
        received: u64,
    },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification of an [`OciError`], used by callers that only care
/// about which failure class occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidReference,
    AuthError,
    NotFound,
    RegistryUnavailable,
    ManifestInconsistency,
    TransferInterrupted,
    DigestMismatch,
    WriteError,
    SerializationError,
}

impl OciError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OciError::InvalidReference { .. } => ErrorKind::InvalidReference,
            OciError::Auth(_) => ErrorKind::AuthError,
            OciError::NotFound(_) => ErrorKind::NotFound,
            OciError::RegistryUnavailable(_) => ErrorKind::RegistryUnavailable,
            OciError::ManifestInconsistency(_) | OciError::UnsupportedMediaType(_) => {
                ErrorKind::ManifestInconsistency
            }
            OciError::TransferInterrupted { .. } => ErrorKind::TransferInterrupted,
            OciError::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            OciError::Write { .. } => ErrorKind::WriteError,
            OciError::Serialization(_) => ErrorKind::SerializationError,
        }
    }

    pub(crate) fn invalid_reference(reference: &str, reason: impl Into<String>) -> Self {
        OciError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OciError::Write {
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for OciError {
    fn from(e: reqwest::Error) -> Self {
        OciError::RegistryUnavailable(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
