//! Sniffing UDP relay
//!
//! One relay carries one redirected UDP flow. The capture layer NATs the
//! client's datagrams to the relay's loopback socket; the relay forwards
//! them to the real server from its own upstream socket and copies replies
//! back. Only the first client datagram is inspected: a DNS query is
//! offered to the [`DnsFilter`], otherwise a QUIC ClientHello is looked for
//! and handed to the [`QuicInterceptStarter`]. Detection never delays or
//! alters what is forwarded, except for a DNS query the filter answers
//! itself.

use crate::config::UdpRelayConfig;
use crate::error::Result;
use crate::hooks::{DnsFilter, PassThroughDns, QuicHandshake, QuicInterceptStarter};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};
use veloguard_sniff::{detect_client_hello, detect_dns_query, DnsMessage, QuicInitialSniff};

/// Socket and timing options for a relay
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Address the client-facing socket binds to
    pub bind: IpAddr,
    /// Idle expiry for either direction
    pub read_timeout: Duration,
    /// Datagrams above this size are relayed whole but logged
    pub mtu: usize,
}

impl RelayOptions {
    pub fn from_config(config: &UdpRelayConfig, bind: IpAddr) -> Self {
        Self {
            bind,
            read_timeout: config.read_timeout(),
            mtu: config.mtu,
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::from_config(&UdpRelayConfig::default(), IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

/// Hooks a relay consults while sniffing
#[derive(Clone)]
pub struct RelayHooks {
    pub dns: Arc<dyn DnsFilter>,
    pub quic: Option<Arc<dyn QuicInterceptStarter>>,
}

impl Default for RelayHooks {
    fn default() -> Self {
        Self {
            dns: Arc::new(PassThroughDns),
            quic: None,
        }
    }
}

/// Relay statistics
#[derive(Debug, Default)]
pub struct RelayStats {
    pub datagrams_to_server: AtomicU64,
    pub bytes_to_server: AtomicU64,
    pub datagrams_to_client: AtomicU64,
    pub bytes_to_client: AtomicU64,
    pub queries_cancelled: AtomicU64,
    pub responses_replaced: AtomicU64,
}

impl RelayStats {
    fn record_to_server(&self, bytes: usize) {
        self.datagrams_to_server.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_server.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_to_client(&self, bytes: usize) {
        self.datagrams_to_client.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_client.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

pub struct UdpRelay {
    client: SocketAddr,
    server: SocketAddr,
    local_addr: SocketAddr,
    hooks: RelayHooks,
    closed: AtomicBool,
    close_count: AtomicUsize,
    cancel: CancellationToken,
    tracker: TaskTracker,
    forward_addr: Mutex<Option<SocketAddr>>,
    pending_query: Mutex<Option<DnsMessage>>,
    client_hello: Mutex<Option<QuicInitialSniff>>,
    stats: RelayStats,
}

/// Receive buffer size: the largest payload a UDP datagram can carry
const MAX_DATAGRAM: usize = 65535;

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

impl UdpRelay {
    /// Bind both sockets and start relaying. The returned relay's
    /// [`local_addr`](Self::local_addr) is the redirect target for the flow.
    pub async fn start(
        client: SocketAddr,
        server: SocketAddr,
        options: RelayOptions,
        hooks: RelayHooks,
    ) -> Result<Arc<Self>> {
        let listen = Arc::new(UdpSocket::bind(SocketAddr::new(options.bind, 0)).await?);
        let upstream = Arc::new(UdpSocket::bind(unspecified_for(&server)).await?);
        let local_addr = listen.local_addr()?;

        let relay = Arc::new(Self {
            client,
            server,
            local_addr,
            hooks,
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            forward_addr: Mutex::new(None),
            pending_query: Mutex::new(None),
            client_hello: Mutex::new(None),
            stats: RelayStats::default(),
        });

        relay.tracker.spawn(relay.clone().pump_to_server(
            listen.clone(),
            upstream.clone(),
            options.read_timeout,
            options.mtu,
        ));
        relay.tracker.spawn(relay.clone().pump_to_client(
            listen,
            upstream,
            options.read_timeout,
            options.mtu,
        ));
        relay.tracker.close();

        debug!(
            "UDP relay started: {} -> {} via {}",
            client, server, local_addr
        );
        Ok(relay)
    }

    /// Redirect target handed back to the capture layer
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Source address of the first client datagram
    pub fn forward_address(&self) -> Option<SocketAddr> {
        *self.forward_addr.lock()
    }

    pub fn pending_query(&self) -> Option<DnsMessage> {
        self.pending_query.lock().clone()
    }

    pub fn client_hello(&self) -> Option<QuicInitialSniff> {
        self.client_hello.lock().clone()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of times the close path actually ran; never more than one
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }

    /// Stop both directions. Safe to call any number of times from any task.
    pub fn stop(&self) {
        self.close("stopped");
    }

    /// Resolves once both directions have exited and both sockets are dropped
    pub async fn closed(&self) {
        self.tracker.wait().await;
    }

    fn close(&self, reason: &str) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.close_count.fetch_add(1, Ordering::AcqRel);
        self.cancel.cancel();
        debug!(
            "UDP relay closed: {} -> {} ({})",
            self.client, self.server, reason
        );
        true
    }

    /// Client datagrams towards the real server
    async fn pump_to_server(
        self: Arc<Self>,
        listen: Arc<UdpSocket>,
        upstream: Arc<UdpSocket>,
        read_timeout: Duration,
        mtu: usize,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let reason = loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break "cancelled",
                r = tokio::time::timeout(read_timeout, listen.recv_from(&mut buf)) => r,
            };
            let (n, from) = match received {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    debug!("UDP relay client read error on {}: {}", self.local_addr, e);
                    break "client read error";
                }
                Err(_) => break "idle timeout",
            };
            if n > mtu {
                debug!("UDP relay {} -> {} datagram of {} bytes exceeds mtu {}", from, self.server, n, mtu);
            }
            let datagram = &buf[..n];

            let first = {
                let mut forward = self.forward_addr.lock();
                if forward.is_none() {
                    *forward = Some(from);
                    true
                } else {
                    false
                }
            };

            if first {
                if let Some(answer) = self.sniff_first(datagram, from) {
                    if let Err(e) = listen.send_to(&answer, from).await {
                        debug!("UDP relay failed to answer {}: {}", from, e);
                        break "client write error";
                    }
                    self.stats.record_to_client(answer.len());
                    continue;
                }
            }

            if let Err(e) = upstream.send_to(datagram, self.server).await {
                debug!("UDP relay send to {} failed: {}", self.server, e);
                break "server write error";
            }
            self.stats.record_to_server(n);
            trace!("UDP relay {} -> {} ({} bytes)", from, self.server, n);
        };
        self.close(reason);
    }

    /// Real server replies towards the client
    async fn pump_to_client(
        self: Arc<Self>,
        listen: Arc<UdpSocket>,
        upstream: Arc<UdpSocket>,
        read_timeout: Duration,
        mtu: usize,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let reason = loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break "cancelled",
                r = tokio::time::timeout(read_timeout, upstream.recv_from(&mut buf)) => r,
            };
            let (n, from) = match received {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    debug!("UDP relay server read error from {}: {}", self.server, e);
                    break "server read error";
                }
                Err(_) => break "idle timeout",
            };
            if from != self.server {
                trace!("UDP relay ignoring datagram from {}", from);
                continue;
            }
            let Some(client) = self.forward_address() else {
                trace!("UDP relay reply from {} before any client datagram", from);
                continue;
            };

            if n > mtu {
                debug!("UDP relay {} <- {} datagram of {} bytes exceeds mtu {}", client, from, n, mtu);
            }
            let reply = &buf[..n];
            let substitute = self.filter_response(reply);
            let out = substitute.as_deref().unwrap_or(reply);

            if let Err(e) = listen.send_to(out, client).await {
                debug!("UDP relay send to {} failed: {}", client, e);
                break "client write error";
            }
            self.stats.record_to_client(out.len());
            trace!("UDP relay {} <- {} ({} bytes)", client, from, out.len());
        };
        self.close(reason);
    }

    /// Inspect the first client datagram. Returns a synthetic DNS answer
    /// when the filter cancelled the query; the datagram is then consumed.
    fn sniff_first(&self, datagram: &[u8], from: SocketAddr) -> Option<Bytes> {
        if let Some(query) = detect_dns_query(datagram) {
            debug!(
                "DNS query on relay {} -> {}: {:?}",
                from,
                self.server,
                query.first_query_name()
            );
            let cancelled = self.hooks.dns.cancel_query(&query);
            *self.pending_query.lock() = Some(query);

            let fake = cancelled?;
            return match fake.to_wire() {
                Ok(wire) => {
                    self.stats.queries_cancelled.fetch_add(1, Ordering::Relaxed);
                    debug!("DNS query cancelled by filter, answering {}", from);
                    Some(wire)
                }
                Err(e) => {
                    debug!("DNS cancel answer not encodable, forwarding query: {}", e);
                    None
                }
            };
        }

        let sniff = detect_client_hello(datagram)?;
        *self.client_hello.lock() = Some(sniff.clone());

        if let Some(starter) = &self.hooks.quic {
            starter.on_client_hello(QuicHandshake {
                client: from,
                server: self.server,
                relay: self.local_addr,
                datagram: Bytes::copy_from_slice(datagram),
                sniff,
            });
        }
        None
    }

    /// Substitute for a real DNS response, if the filter wants one.
    /// Anything that fails along the way passes the original through.
    fn filter_response(&self, reply: &[u8]) -> Option<Bytes> {
        let query = self.pending_query.lock().clone()?;
        let response = match DnsMessage::parse(reply) {
            Ok(r) => r,
            Err(e) => {
                trace!("reply to DNS query is not DNS: {}", e);
                return None;
            }
        };
        let substitute = self.hooks.dns.filter_response(&query, &response)?;
        match substitute.to_wire() {
            Ok(wire) => {
                self.stats.responses_replaced.fetch_add(1, Ordering::Relaxed);
                Some(wire)
            }
            Err(e) => {
                debug!("DNS substitute not encodable, passing original: {}", e);
                None
            }
        }
    }
}
