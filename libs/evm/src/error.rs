//! Error types for chain access.

use thiserror::Error;

/// Errors from talking to an EVM node or building its payloads.
#[derive(Debug, Error)]
pub enum EvmError {
    /// HTTP transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The node answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The node answered with something that is not a JSON-RPC response.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// ABI data could not be decoded.
    #[error("abi decode error: {0}")]
    Abi(String),

    /// Key or signature failure.
    #[error("signing error: {0}")]
    Signing(String),

    /// A transaction was not mined in time.
    #[error("transaction {0} not mined before timeout")]
    ReceiptTimeout(String),

    /// A mined transaction reverted.
    #[error("transaction {0} reverted")]
    Reverted(String),
}
