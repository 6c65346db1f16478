//! Error types for tag parsing and identity validation.

use thiserror::Error;

/// Errors that can occur when parsing chain tags or instance keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The chain tag does not name a node chain.
    #[error("unknown chain tag: '{0}'")]
    UnknownChain(String),

    /// The instance key is missing the required prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The digest portion of the key is malformed.
    #[error("invalid ID format: {message}")]
    InvalidFormat { message: String },

    /// The identity secret cannot key the hash.
    #[error("invalid identity secret")]
    InvalidSecret,
}
