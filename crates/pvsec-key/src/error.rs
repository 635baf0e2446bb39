use thiserror::Error;

/// Errors raised by key generation, import and export
#[derive(Error, Debug)]
pub enum KeyError {
    /// Key import failed (bad PEM/DER, wrong algorithm)
    #[error("Import error: {0}")]
    ImportError(String),

    /// Key export failed
    #[error("Export error: {0}")]
    ExportError(String),

    /// Randomness source failed
    #[error("Entropy error: {0}")]
    EntropyError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KeyError>;
