//! VeloGuard Sniff - passive protocol detection on relayed UDP datagrams
//!
//! Features:
//! - DNS query detection with byte-identical pass-through
//! - QUIC Initial packet parsing and header protection removal
//! - Initial key derivation from the destination connection id
//! - TLS ClientHello extraction (SNI, ALPN, supported versions)
//!
//! Every entry point treats malformed input as "not detected"; nothing in
//! this crate panics on untrusted bytes.
//!
//! ```text
//! datagram --> detect_dns_query ----------------> DnsMessage
//!     |
//!     +-----> parse_initial_header
//!                 |
//!             InitialSecrets (HKDF, salt per version)
//!                 |
//!             header protection (AES-ECB) + AEAD open (AES-128-GCM)
//!                 |
//!             parse_frames -> CRYPTO stream -> ClientHello
//! ```

pub mod dns;
pub mod error;
pub mod quic;
pub mod reader;
pub mod tls;

pub use dns::{detect_dns_query, DnsMessage};
pub use error::{Result, SniffError};
pub use quic::{detect_client_hello, QuicInitialSniff, QuicVersion};
pub use tls::ClientHello;

#[cfg(test)]
mod tests;
