//! Error types for the VeloGuard interception core

use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use veloguard_sniff::SniffError;

/// Result type alias for interception operations
pub type Result<T> = std::result::Result<T, InterceptError>;

#[derive(Error, Debug)]
pub enum InterceptError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Sniff error: {0}")]
    Sniff(#[from] SniffError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Relay for {0} is closed")]
    RelayClosed(SocketAddr),

    #[error("TCP intercept failed: {0}")]
    TcpIntercept(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Side channel error: {0}")]
    SideChannel(String),

    #[error("Channel closed")]
    ChannelClosed,
}

impl InterceptError {
    pub fn config(message: impl Into<String>) -> Self {
        InterceptError::Config(message.into())
    }
}
