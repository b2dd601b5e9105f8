//! Error types for VeloGuard sniffing

use thiserror::Error;

/// Result type alias for sniffing operations
pub type Result<T> = std::result::Result<T, SniffError>;

/// Reasons a datagram could not be recognized
///
/// Every variant is recoverable: callers treat any of them as
/// "not detected" and forward the datagram unmodified.
#[derive(Error, Debug)]
pub enum SniffError {
    #[error("Datagram too short: expected {expected}, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Not a QUIC packet: flags 0x{0:02x}")]
    NotQuic(u8),

    #[error("Short header packet")]
    ShortHeader,

    #[error("Unsupported QUIC version: 0x{0:08x}")]
    UnsupportedVersion(u32),

    #[error("Not an Initial packet: type {0}")]
    NotInitial(u8),

    #[error("Connection id too long: {0}")]
    ConnectionIdTooLong(usize),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("TLS handshake error: {0}")]
    Handshake(String),

    #[error("DNS error: {0}")]
    Dns(String),
}

impl From<hickory_proto::error::ProtoError> for SniffError {
    fn from(e: hickory_proto::error::ProtoError) -> Self {
        SniffError::Dns(e.to_string())
    }
}

impl From<aes_gcm::aead::Error> for SniffError {
    fn from(_: aes_gcm::aead::Error) -> Self {
        SniffError::DecryptionFailed
    }
}
