//! Error types for weft-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// weft-core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Identity file IO error
    #[error("identity file error: {0}")]
    Io(#[from] std::io::Error),

    /// Identity file serialization error
    #[error("identity serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid secret key material
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    /// Stored proof of work does not satisfy the required difficulty
    #[error("proof of work invalid for address {address} at difficulty {difficulty}")]
    ProofOfWorkInvalid { address: String, difficulty: u8 },
}
