//! Crate-level error taxonomy.
//!
//! Errors are scoped to one container: the loader catches them, logs the
//! container name, and moves on to the next item. Unresolvable
//! cross-references are not errors at all — resolution APIs return
//! found/not-found results instead.

use thiserror::Error;

use crate::cipher::CipherError;
use crate::codec::CodecError;

#[derive(Error, Debug)]
pub enum Error {
    /// Declared sizes/offsets inconsistent with stream bounds. Fatal for
    /// the affected container only.
    #[error("corrupt container {container}: {detail}")]
    Corrupt { container: String, detail: String },

    /// Archive family with no implemented handler.
    #[error("unsupported archive signature {0:?}")]
    UnsupportedSignature(String),

    /// Serialized-file format revision with no implemented handler.
    #[error("unsupported serialized format version {0}")]
    UnsupportedVersion(u32),

    /// Compression kind errors, including the unsupported-kind case.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Title/variant mismatch — caller configuration error, reported
    /// distinctly from corruption.
    #[error(transparent)]
    Cipher(#[from] CipherError),

    /// The input matches no recognized container format.
    #[error("{0} is not a recognized container")]
    UnknownFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Cooperative cancellation observed between items. Already-decoded
    /// state remains valid.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn corrupt(container: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Corrupt { container: container.into(), detail: detail.into() }
    }

    /// True for caller configuration errors (wrong title, missing key)
    /// as opposed to data corruption.
    pub fn is_variant_mismatch(&self) -> bool {
        matches!(
            self,
            Error::Cipher(CipherError::WrongVariant { .. })
                | Error::Cipher(CipherError::MissingKey(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
