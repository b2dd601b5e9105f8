//! Collaborator slots consulted by the relay and the classifier

use crate::error::Result;
use crate::packet::CapturedPacket;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use veloguard_sniff::{ClientHello, DnsMessage, QuicInitialSniff};

/// DNS policy hook
///
/// Both methods return `None` to let the exchange proceed untouched.
pub trait DnsFilter: Send + Sync {
    /// Called once with the client's query before it is forwarded. A returned
    /// message is sent back to the client and the real server never sees the
    /// query.
    fn cancel_query(&self, query: &DnsMessage) -> Option<DnsMessage> {
        let _ = query;
        None
    }

    /// Called once per real response; a returned message replaces it
    fn filter_response(&self, query: &DnsMessage, response: &DnsMessage) -> Option<DnsMessage> {
        let _ = (query, response);
        None
    }
}

/// Filter that never intercepts
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughDns;

impl DnsFilter for PassThroughDns {}

/// Everything a QUIC MITM needs to take over a detected handshake
#[derive(Debug, Clone)]
pub struct QuicHandshake {
    /// Where the client actually sends from
    pub client: SocketAddr,
    /// Real destination of the flow
    pub server: SocketAddr,
    /// Loopback address of the relay carrying the flow
    pub relay: SocketAddr,
    /// The datagram the ClientHello was found in
    pub datagram: Bytes,
    pub sniff: QuicInitialSniff,
}

impl QuicHandshake {
    pub fn client_hello(&self) -> &ClientHello {
        &self.sniff.client_hello
    }

    pub fn server_name(&self) -> Option<&str> {
        self.sniff.server_name()
    }

    /// ALPN hint for the intercepting endpoint
    pub fn application_protocol(&self) -> Option<&str> {
        self.sniff.application_protocol()
    }
}

/// Receives every detected QUIC handshake, with or without ALPN; the
/// starter decides whether to intercept. Must not block: the relay calls it
/// from its forwarding loop.
pub trait QuicInterceptStarter: Send + Sync {
    fn on_client_hello(&self, handshake: QuicHandshake);
}

/// Starts the TCP TLS-terminating proxy for a redirected flow
#[async_trait::async_trait]
pub trait TcpInterceptStarter: Send + Sync {
    /// Returns the loopback listener the flow should be NATed to
    async fn start_tcp_intercept(
        &self,
        packet: &CapturedPacket,
        timeout: Duration,
    ) -> Result<SocketAddr>;

    /// Whether the listener at `target` still serves its flow. Sessions
    /// reported dead are forgotten and the next packet of the flow is
    /// classified again.
    fn is_active(&self, target: SocketAddr) -> bool {
        let _ = target;
        true
    }
}
