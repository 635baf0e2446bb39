use pvsec_pki::{CertStatus, PkiError};
use thiserror::Error;

/// CMS-side errors.  Each variant that can cross the RPC surface carries a
/// stable text code so callers can match on failures without parsing
/// messages.
#[derive(Error, Debug)]
pub enum CmsError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("a certificate with this subject already exists")]
    DuplicateSubject,

    #[error("a certificate with this subject key identifier already exists")]
    DuplicateKey,

    #[error("illegal status transition for certificate {serial}: {from:?} -> {to:?}")]
    IllegalTransition {
        serial: u64,
        from: CertStatus,
        to: CertStatus,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("certificate {0} not found")]
    NotFound(u64),

    #[error("database error: {0}")]
    DbError(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error("key error: {0}")]
    KeyError(#[from] pvsec_key::KeyError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CmsError {
    /// Stable text code reported on the RPC surface
    pub fn code(&self) -> &'static str {
        match self {
            CmsError::MalformedRequest(_) => "MalformedRequest",
            CmsError::DuplicateSubject => "DuplicateSubject",
            CmsError::DuplicateKey => "DuplicateKey",
            CmsError::IllegalTransition { .. } => "IllegalTransition",
            CmsError::Unauthorized(_) => "Unauthorized",
            CmsError::NotFound(_) => "NotFound",
            CmsError::DbError(_) => "DbError",
            CmsError::ConfigError(_) => "ConfigError",
            CmsError::Pki(PkiError::MalformedRequest(_)) => "MalformedRequest",
            CmsError::Pki(_) => "CertError",
            CmsError::KeyError(_) => "KeyError",
            CmsError::IoError(_) => "IoError",
        }
    }
}

pub type Result<T, E = CmsError> = std::result::Result<T, E>;
