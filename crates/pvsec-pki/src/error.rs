use thiserror::Error;

/// Errors surfaced by the certificate plane's client side.
///
/// The token and subscription variants all cause a TLS verify decision of
/// "reject" when they reach the verify gate.
#[derive(Error, Debug)]
pub enum PkiError {
    /// Signed status token could not be parsed
    #[error("Malformed status token: {0}")]
    MalformedToken(String),

    /// Embedded signer cannot be chained to a trust anchor
    #[error("Unverified signer: {0}")]
    UnverifiedSigner(String),

    /// Token validity window has expired (or lies in the future)
    #[error("Status validity window expired: {0}")]
    ExpiredWindow(String),

    /// Certificate lacks a required custom extension
    #[error("Missing certificate extension: {0}")]
    MissingExtension(String),

    /// Certificate lacks the Subject Key Identifier extension
    #[error("Missing Subject Key Identifier")]
    MissingSki,

    /// Certificate key usage does not permit the intended role
    #[error("Key usage mismatch: {0}")]
    KeyUsageMismatch(String),

    /// Status subscription could not be established
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Deadline expired before an operation completed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Certificate creation request failed validation
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Certificate parse/encode error
    #[error("Certificate error: {0}")]
    CertError(String),

    /// Status PV name error
    #[error("Status PV error: {0}")]
    PvNameError(String),

    /// Key error
    #[error("Key error: {0}")]
    KeyError(#[from] pvsec_key::KeyError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PkiError>;
