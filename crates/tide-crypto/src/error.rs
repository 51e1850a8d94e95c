//! Error types for tide-crypto.

/// Errors that can occur while signing, verifying or encrypting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// A key was supplied with the wrong number of bytes.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Encryption failed.
    #[error("encryption failed")]
    Encryption,

    /// Decryption or authentication failed (wrong key or tampered data).
    #[error("decryption failed")]
    Decryption,

    /// The signature does not verify for the claimed identity.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

/// Convenience alias for tide-crypto results.
pub type Result<T> = std::result::Result<T, CryptoError>;
