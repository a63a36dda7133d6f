//! Defines all errors surfaced by the registry.

use std::fmt;

use crate::certs::CryptoError;
use crate::storage::BackendError;

//------------ Error ---------------------------------------------------------

/// The error type for all registry operations.
///
/// The registry performs no retries: every failure aborts the current
/// operation and leaves the store in its prior state. The originating
/// error is kept so callers can inspect the full cause chain.
#[derive(Debug)]
pub enum Error {
    /// The requested entry name is not present in the registry.
    NotFound(String),

    /// A name allocation lost a race. The caller may retry.
    Conflict(String),

    /// The storage backend failed.
    Backend(BackendError),

    /// Key generation, signing or parsing failed.
    Crypto(CryptoError),

    /// ACME registration or issuance failed.
    Protocol(String),

    /// An artifact was read but does not match its invariants.
    Integrity(String),

    /// The caller passed an empty name or incomplete parameters.
    InvalidInput(String),
}

impl Error {
    pub fn not_found(name: impl fmt::Display) -> Self {
        Error::NotFound(name.to_string())
    }

    pub fn conflict(msg: impl fmt::Display) -> Self {
        Error::Conflict(msg.to_string())
    }

    pub fn protocol(msg: impl fmt::Display) -> Self {
        Error::Protocol(msg.to_string())
    }

    pub fn integrity(msg: impl fmt::Display) -> Self {
        Error::Integrity(msg.to_string())
    }

    pub fn invalid_input(msg: impl fmt::Display) -> Self {
        Error::InvalidInput(msg.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(name) => write!(f, "unknown entry: {}", name),
            Error::Conflict(msg) => write!(f, "name conflict: {}", msg),
            Error::Backend(e) => write!(f, "backend error: {}", e),
            Error::Crypto(e) => write!(f, "crypto error: {}", e),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::Integrity(msg) => write!(f, "integrity error: {}", msg),
            Error::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Backend(e) => Some(e),
            Error::Crypto(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        Error::Backend(e)
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::Crypto(e)
    }
}
