//! Error types for pull-box

use std::fmt;

use pullbox_oci::OciError;
use thiserror::Error;

/// Result type alias using pull-box Error
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Parsing the image reference
    Resolve,
    /// Manifest and layer discovery (sizing pass)
    Discover,
    /// Instrumented blob transfer
    Fetch,
    /// Writing the output tarball
    Archive,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Resolve => "resolve",
            Stage::Discover => "discover",
            Stage::Fetch => "fetch",
            Stage::Archive => "archive",
        })
    }
}

/// Errors that can occur while pulling an image
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pipeline stage failed
    #[error("{stage} failed: {source}")]
    Pull {
        stage: Stage,
        #[source]
        source: OciError,
    },

    /// The background pull task ended without reporting a result
    #[error("Background task error: {0}")]
    Background(String),
}

/// Failure classes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigParseError,
    InvalidReference,
    AuthError,
    NotFound,
    RegistryUnavailable,
    ManifestInconsistency,
    TransferInterrupted,
    DigestMismatch,
    WriteError,
    SerializationError,
    /// The host adapter lost its background task.
    Internal,
}

impl From<pullbox_oci::ErrorKind> for ErrorKind {
    fn from(kind: pullbox_oci::ErrorKind) -> Self {
        use pullbox_oci::ErrorKind as K;
        match kind {
            K::InvalidReference => ErrorKind::InvalidReference,
            K::AuthError => ErrorKind::AuthError,
            K::NotFound => ErrorKind::NotFound,
            K::RegistryUnavailable => ErrorKind::RegistryUnavailable,
            K::ManifestInconsistency => ErrorKind::ManifestInconsistency,
            K::TransferInterrupted => ErrorKind::TransferInterrupted,
            K::DigestMismatch => ErrorKind::DigestMismatch,
            K::WriteError => ErrorKind::WriteError,
            K::SerializationError => ErrorKind::SerializationError,
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::ConfigParseError,
            Error::Pull { source, .. } => source.kind().into(),
            Error::Background(_) => ErrorKind::Internal,
        }
    }

    /// The stage a pull failed in, if this is a pull failure.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Pull { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub(crate) fn at(stage: Stage) -> impl FnOnce(OciError) -> Error {
        move |source| Error::Pull { stage, source }
    }
}
