//! VeloGuard Intercept - flow classification and sniffing relays
//!
//! The capture layer hands every outbound IP packet to a [`VpnClient`]. The
//! first packet of each flow goes through the [`Classifier`], which answers
//! with an [`AllowedDecision`]:
//!
//! - TCP flows are redirected to a TLS-terminating listener started by the
//!   [`TcpInterceptStarter`]
//! - UDP flows are redirected through a [`UdpRelay`] that sniffs the first
//!   datagram for a DNS query or a QUIC ClientHello
//! - IPv6, foreign owners and unknown protocols are blocked
//!
//! Packets going back to the device are serialized by a single
//! [`PacketWriter`] per client.

pub mod classifier;
pub mod config;
pub mod decision;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod packet;
pub mod pool;
pub mod session;
pub mod side_channel;
pub mod udp_relay;
pub mod write_queue;

pub use classifier::Classifier;
pub use config::{InterceptConfig, LogLevel};
pub use decision::AllowedDecision;
pub use error::{InterceptError, Result};
pub use hooks::{DnsFilter, PassThroughDns, QuicHandshake, QuicInterceptStarter, TcpInterceptStarter};
pub use logging::init_logging;
pub use packet::{CapturedPacket, FlowKey, IpVersion};
pub use pool::DiscardingPool;
pub use session::{FlowHandler, VpnClient};
pub use side_channel::{AppIdentity, DeviceChannel};
pub use udp_relay::{RelayHooks, RelayOptions, UdpRelay};
pub use write_queue::PacketWriter;

pub use veloguard_sniff;

#[cfg(test)]
mod tests;
