//! Allowed-decision engine
//!
//! Decides the fate of a flow from its first packet:
//!
//! 1. allow-all mode lets everything through
//! 2. owners above the privileged uid and unsupported protocols are blocked
//! 3. IPv6 is blocked
//! 4. IPv4 TCP is redirected to a TCP intercept session
//! 5. IPv4 UDP (DNS included unless direct DNS is allowed) is redirected
//!    through a [`UdpRelay`]
//! 6. IPv4 ICMP passes through
//!
//! Errors while setting up a redirect fail closed to [`AllowedDecision::Block`].
//!
//! A redirect stays live while its relay is open or its TCP listener is
//! active. Dead redirects are forgotten by [`Classifier::cleanup`] and the
//! next packet of that flow is classified again.

use crate::config::{ClassifierConfig, InterceptConfig};
use crate::decision::AllowedDecision;
use crate::error::{InterceptError, Result};
use crate::hooks::TcpInterceptStarter;
use crate::packet::{is_supported_protocol, CapturedPacket, FlowKey, IpVersion};
use crate::side_channel::{AppIdentity, DeviceChannel};
use crate::udp_relay::{RelayHooks, RelayOptions, UdpRelay};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Classifier statistics
#[derive(Debug, Default)]
pub struct ClassifierStats {
    pub direct: AtomicU64,
    pub blocked: AtomicU64,
    pub redirected: AtomicU64,
    pub failures: AtomicU64,
    pub relays_created: AtomicU64,
    pub tcp_sessions_created: AtomicU64,
}

impl ClassifierStats {
    fn record(&self, decision: &AllowedDecision) {
        let counter = match decision {
            AllowedDecision::Direct => &self.direct,
            AllowedDecision::Block => &self.blocked,
            AllowedDecision::Redirect { .. } => &self.redirected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Classifier {
    config: ClassifierConfig,
    relay_options: RelayOptions,
    hooks: RelayHooks,
    tcp: Arc<dyn TcpInterceptStarter>,
    side_channel: Option<Arc<DeviceChannel>>,
    relays: DashMap<FlowKey, Arc<UdpRelay>>,
    tcp_sessions: DashMap<FlowKey, SocketAddr>,
    stats: ClassifierStats,
}

impl Classifier {
    pub fn new(
        config: &InterceptConfig,
        hooks: RelayHooks,
        tcp: Arc<dyn TcpInterceptStarter>,
    ) -> Self {
        Self {
            relay_options: RelayOptions::from_config(&config.udp, config.classifier.loopback),
            config: config.classifier.clone(),
            hooks,
            tcp,
            side_channel: None,
            relays: DashMap::new(),
            tcp_sessions: DashMap::new(),
            stats: ClassifierStats::default(),
        }
    }

    /// Build a classifier and, when owner lookups are enabled, open the
    /// device side channel. An absent or silent device leaves every lookup
    /// reporting [`AppIdentity::Unknown`].
    pub async fn connect(
        config: &InterceptConfig,
        hooks: RelayHooks,
        tcp: Arc<dyn TcpInterceptStarter>,
    ) -> Self {
        let classifier = Self::new(config, hooks, tcp);
        if config.classifier.direct_allow_all || !config.classifier.resolve_owner {
            return classifier;
        }
        let Some(device) = config.side_channel.device else {
            debug!("Owner lookups enabled without a side channel device");
            return classifier;
        };
        match DeviceChannel::connect(device, config.side_channel.timeout()).await {
            Some(channel) => classifier.with_side_channel(Arc::new(channel)),
            None => classifier,
        }
    }

    /// Attach the device side channel used for owner lookups
    pub fn with_side_channel(mut self, channel: Arc<DeviceChannel>) -> Self {
        self.side_channel = Some(channel);
        self
    }

    pub fn has_side_channel(&self) -> bool {
        self.side_channel.is_some()
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn stats(&self) -> &ClassifierStats {
        &self.stats
    }

    /// Decide the fate of the flow `packet` opens. Never fails: errors are
    /// logged and block the flow.
    pub async fn decide(&self, packet: &CapturedPacket) -> AllowedDecision {
        let decision = match self.try_decide(packet).await {
            Ok(decision) => decision,
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Classification of {} failed, blocking: {}", packet.flow_key(), e);
                AllowedDecision::Block
            }
        };
        self.stats.record(&decision);
        debug!(
            "{} uid={} -> {}",
            packet.flow_key(),
            packet.uid,
            decision
        );
        decision
    }

    async fn try_decide(&self, packet: &CapturedPacket) -> Result<AllowedDecision> {
        if self.config.direct_allow_all {
            return Ok(AllowedDecision::Direct);
        }
        if packet.uid > self.config.privileged_uid || !is_supported_protocol(packet.protocol) {
            trace!(
                "Blocking uid={} protocol={}",
                packet.uid,
                packet.protocol
            );
            return Ok(AllowedDecision::Block);
        }
        if packet.version == IpVersion::V6 {
            return Ok(AllowedDecision::Block);
        }

        if self.config.resolve_owner {
            self.log_owner(packet).await;
        }

        if packet.is_tcp() {
            return self.redirect_tcp(packet).await;
        }
        if packet.is_udp() {
            if packet.is_dns() && self.config.allow_direct_dns {
                return Ok(AllowedDecision::Direct);
            }
            return self.redirect_udp(packet).await;
        }
        if packet.is_icmp() {
            return Ok(AllowedDecision::Direct);
        }
        Ok(AllowedDecision::Block)
    }

    /// Application owning the flow of `packet`, as the device reports it
    pub async fn owner(&self, packet: &CapturedPacket) -> AppIdentity {
        match &self.side_channel {
            Some(channel) => channel.query_applications(packet.uid).await,
            None => AppIdentity::Unknown,
        }
    }

    async fn log_owner(&self, packet: &CapturedPacket) {
        let owner = self.owner(packet).await;
        debug!("{} owned by uid={} app={}", packet.flow_key(), packet.uid, owner);
    }

    async fn redirect_tcp(&self, packet: &CapturedPacket) -> Result<AllowedDecision> {
        let key = packet.flow_key();
        let cached = self.tcp_sessions.get(&key).map(|target| *target);
        if let Some(target) = cached {
            if self.tcp.is_active(target) {
                return Ok(AllowedDecision::redirect(target));
            }
            self.tcp_sessions.remove(&key);
            trace!("TCP intercept for {} ended, starting a new one", key);
        }

        let timeout = self.config.tcp_connect_timeout();
        let target = tokio::time::timeout(timeout, self.tcp.start_tcp_intercept(packet, timeout))
            .await
            .map_err(|_| InterceptError::Timeout(format!("TCP intercept for {}", key)))??;

        let target = *self.tcp_sessions.entry(key).or_insert(target);
        self.stats.tcp_sessions_created.fetch_add(1, Ordering::Relaxed);
        Ok(AllowedDecision::redirect(target))
    }

    async fn redirect_udp(&self, packet: &CapturedPacket) -> Result<AllowedDecision> {
        let key = packet.flow_key();
        if let Some(relay) = self.relays.get(&key) {
            if !relay.is_closed() {
                return Ok(AllowedDecision::redirect(relay.local_addr()));
            }
        }

        let relay = UdpRelay::start(
            packet.src,
            packet.dst,
            self.relay_options.clone(),
            self.hooks.clone(),
        )
        .await?;
        self.stats.relays_created.fetch_add(1, Ordering::Relaxed);

        // a concurrent first packet may have won the race
        let winner = match self.relays.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    entry.insert(relay.clone());
                    relay
                } else {
                    relay.stop();
                    entry.get().clone()
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(relay.clone());
                relay
            }
        };
        Ok(AllowedDecision::redirect(winner.local_addr()))
    }

    /// Relay carrying `key`, if one is registered
    pub fn relay(&self, key: &FlowKey) -> Option<Arc<UdpRelay>> {
        self.relays.get(key).map(|r| r.clone())
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    pub fn tcp_session_count(&self) -> usize {
        self.tcp_sessions.len()
    }

    /// Whether the redirect registered for `key` still carries traffic
    pub fn is_live(&self, key: &FlowKey) -> bool {
        if let Some(relay) = self.relays.get(key) {
            return !relay.is_closed();
        }
        let target = self.tcp_sessions.get(key).map(|target| *target);
        target.is_some_and(|target| self.tcp.is_active(target))
    }

    /// Stop the relay and forget the TCP session of one flow
    pub fn release(&self, key: &FlowKey) {
        if let Some((_, relay)) = self.relays.remove(key) {
            relay.stop();
            trace!("UDP relay released: {}", key);
        }
        self.tcp_sessions.remove(key);
    }

    /// Forget relays that have closed on their own and TCP sessions whose
    /// listener is gone
    pub fn cleanup(&self) {
        let before = self.relays.len() + self.tcp_sessions.len();
        self.relays.retain(|key, relay| {
            let open = !relay.is_closed();
            if !open {
                trace!("UDP relay cleaned up: {}", key);
            }
            open
        });
        self.tcp_sessions
            .retain(|_, target| self.tcp.is_active(*target));

        let removed = before.saturating_sub(self.relays.len() + self.tcp_sessions.len());
        if removed > 0 {
            debug!("Cleaned up {} dead redirects", removed);
        }
    }

    /// Stop every relay and forget every session. For the owner of the
    /// classifier; a client sharing it releases only its own flows.
    pub fn stop_all(&self) {
        for entry in self.relays.iter() {
            entry.stop();
        }
        self.relays.clear();
        self.tcp_sessions.clear();
    }
}
