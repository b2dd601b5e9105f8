//! Per-connection VPN client session
//!
//! Reads u16-length-prefixed IP frames from the capture stream, classifies
//! each new flow once, and hands admitted packets to a [`FlowHandler`].
//! Everything written back to the device goes through the client's
//! [`PacketWriter`].
//!
//! A cached redirect holds only while the classifier reports it live. A
//! background sweep forgets dead redirects and idle direct or blocked flows,
//! so a flow seen again after expiry is classified from scratch.

use crate::classifier::Classifier;
use crate::config::InterceptConfig;
use crate::decision::AllowedDecision;
use crate::error::Result;
use crate::packet::{resolve_uid, CapturedPacket, FlowKey, UNKNOWN_UID};
use crate::pool::DiscardingPool;
use crate::write_queue::PacketWriter;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Carries admitted packets onwards (NAT, ping proxy, direct forwarding)
#[async_trait::async_trait]
pub trait FlowHandler: Send + Sync {
    async fn handle(
        &self,
        packet: CapturedPacket,
        decision: AllowedDecision,
        writer: Arc<PacketWriter>,
    );
}

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Session statistics
#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_read: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub packets_blocked: AtomicU64,
    pub flows_classified: AtomicU64,
    pub icmp_discarded: AtomicU64,
    pub flows_expired: AtomicU64,
}

struct FlowEntry {
    decision: AllowedDecision,
    last_seen: Instant,
}

pub struct VpnClient {
    classifier: Arc<Classifier>,
    handler: Arc<dyn FlowHandler>,
    writer: Arc<PacketWriter>,
    ping_pool: DiscardingPool,
    decisions: DashMap<FlowKey, FlowEntry>,
    idle_timeout: Duration,
    cancel: CancellationToken,
    stopped: AtomicBool,
    stats: SessionStats,
}

impl VpnClient {
    pub fn new(
        config: &InterceptConfig,
        classifier: Arc<Classifier>,
        handler: Arc<dyn FlowHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            classifier,
            handler,
            writer: PacketWriter::new(&config.write_queue),
            ping_pool: DiscardingPool::new(config.ping_pool.max_workers),
            decisions: DashMap::new(),
            idle_timeout: config.udp.read_timeout().max(MIN_SWEEP_INTERVAL),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            stats: SessionStats::default(),
        })
    }

    /// Queue back to the device; handlers may also write through it directly
    pub fn writer(&self) -> &Arc<PacketWriter> {
        &self.writer
    }

    pub fn classifier(&self) -> &Arc<Classifier> {
        &self.classifier
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Decision cached for `key`, if the flow has been seen
    pub fn decision(&self, key: &FlowKey) -> Option<AllowedDecision> {
        self.decisions.get(key).map(|entry| entry.decision)
    }

    pub fn flow_count(&self) -> usize {
        self.decisions.len()
    }

    /// Serve one capture connection until EOF, a read error or [`stop`](Self::stop).
    /// The device writer is drained before this returns.
    pub async fn run<R, W>(self: &Arc<Self>, mut reader: R, device: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer_task = self.writer.spawn(device);
        let sweep_task = tokio::spawn(self.clone().sweep_loop());
        info!("VPN client session started");

        let result = loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(Some(frame)) if frame.is_empty() => {
                    trace!("Skipping empty frame");
                }
                Ok(Some(frame)) => self.dispatch(frame).await,
                Ok(None) => {
                    debug!("Capture stream closed");
                    break Ok(());
                }
                Err(e) => {
                    warn!("Capture stream read failed: {}", e);
                    break Err(e.into());
                }
            }
        };

        self.stop();
        if let Err(e) = sweep_task.await {
            warn!("Flow sweep task failed: {}", e);
        }
        if let Err(e) = writer_task.await {
            warn!("Device writer task failed: {}", e);
        }
        info!(
            "VPN client session stopped after {} frames",
            self.stats.frames_read.load(Ordering::Relaxed)
        );
        result
    }

    async fn dispatch(&self, frame: Bytes) {
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        let mut packet = match CapturedPacket::parse(UNKNOWN_UID, frame) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                debug!("Skipping unparseable frame: {}", e);
                return;
            }
        };
        packet.uid = resolve_uid(packet.protocol);

        let decision = self.decide_once(&packet).await;
        if decision == AllowedDecision::Block {
            self.stats.packets_blocked.fetch_add(1, Ordering::Relaxed);
            trace!("Dropping blocked packet {}", packet.flow_key());
            return;
        }

        if packet.is_icmp() {
            let handler = self.handler.clone();
            let writer = self.writer.clone();
            let accepted = self.ping_pool.try_spawn(async move {
                handler.handle(packet, decision, writer).await;
            });
            if !accepted {
                self.stats.icmp_discarded.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        self.handler
            .handle(packet, decision, self.writer.clone())
            .await;
    }

    async fn decide_once(&self, packet: &CapturedPacket) -> AllowedDecision {
        let key = packet.flow_key();
        let cached = self.decisions.get_mut(&key).map(|mut entry| {
            entry.last_seen = Instant::now();
            entry.decision
        });
        if let Some(decision) = cached {
            if !decision.is_redirect() || self.classifier.is_live(&key) {
                return decision;
            }
            self.decisions.remove(&key);
            self.stats.flows_expired.fetch_add(1, Ordering::Relaxed);
            trace!("Redirect for {} expired, classifying again", key);
        }

        let decision = self.classifier.decide(packet).await;
        self.stats.flows_classified.fetch_add(1, Ordering::Relaxed);
        self.decisions
            .entry(key)
            .or_insert(FlowEntry {
                decision,
                last_seen: Instant::now(),
            })
            .decision
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.idle_timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep(),
            }
        }
    }

    /// Forget dead redirects and flows idle for longer than the relay read
    /// timeout, then let the classifier drop what has closed
    pub fn sweep(&self) {
        let before = self.decisions.len();
        self.decisions.retain(|key, entry| {
            if entry.decision.is_redirect() {
                self.classifier.is_live(key)
            } else {
                entry.last_seen.elapsed() < self.idle_timeout
            }
        });
        let expired = before.saturating_sub(self.decisions.len());
        if expired > 0 {
            self.stats
                .flows_expired
                .fetch_add(expired as u64, Ordering::Relaxed);
            debug!("Expired {} flows", expired);
        }
        self.classifier.cleanup();
    }

    /// End the session. Safe to call more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.writer.shutdown();
        self.ping_pool.close();
        // the classifier may be shared, so only this client's flows go
        for entry in self.decisions.iter() {
            if entry.decision.is_redirect() {
                self.classifier.release(entry.key());
            }
        }
        self.decisions.clear();
        debug!("VPN client session stopping");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Read one length-prefixed frame; `None` at a clean end of stream
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Bytes>> {
    let len = match reader.read_u16().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf.freeze()))
}
