//! Ordered, retrying writer back to the capture device
//!
//! A single consumer task owns the device writer. Frames go out as a u16
//! big-endian length followed by the packet. A frame that fails to write
//! is retried before anything behind it, so order is kept across retries.
//! Retries resume at the first unwritten byte; a partial write never puts
//! the same bytes on the stream twice.

use crate::config::WriteQueueConfig;
use crate::error::{InterceptError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Default)]
pub struct WriterStats {
    pub frames_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub write_retries: AtomicU64,
}

/// Frame being written, with how much of its wire form went out
struct InFlight {
    frame: Bytes,
    wire: Bytes,
    written: usize,
}

impl InFlight {
    fn new(frame: Bytes) -> Self {
        let mut wire = BytesMut::with_capacity(2 + frame.len());
        wire.put_u16(frame.len() as u16);
        wire.put_slice(&frame);
        Self {
            frame,
            wire: wire.freeze(),
            written: 0,
        }
    }
}

pub struct PacketWriter {
    queue: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    cancel: CancellationToken,
    max_frame_len: usize,
    retry_delay: Duration,
    stats: WriterStats,
}

impl PacketWriter {
    pub fn new(config: &WriteQueueConfig) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            max_frame_len: config.max_frame_len,
            retry_delay: config.retry_delay(),
            stats: WriterStats::default(),
        })
    }

    /// Append a frame to the tail of the queue
    pub fn enqueue(&self, frame: Bytes) -> Result<()> {
        if frame.len() > self.max_frame_len {
            return Err(InterceptError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }
        self.queue.lock().push_back(frame);
        self.notify.notify_one();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Start the single consumer over `writer`
    pub fn spawn<W>(self: &Arc<Self>, writer: W) -> JoinHandle<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(self.clone().run(writer))
    }

    /// Stop once the queue is drained. A write error after this point ends
    /// the consumer instead of retrying; an untouched frame is left at the
    /// head of the queue.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn run<W: AsyncWrite + Unpin>(self: Arc<Self>, mut writer: W) {
        let mut retry: Option<InFlight> = None;
        loop {
            let next = retry
                .take()
                .or_else(|| self.queue.lock().pop_front().map(InFlight::new));
            let Some(mut current) = next else {
                if self.cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = self.cancel.cancelled() => {}
                }
                continue;
            };

            match write_frame(&mut writer, &mut current).await {
                Ok(()) => {
                    self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .bytes_written
                        .fetch_add(current.frame.len() as u64, Ordering::Relaxed);
                    trace!("Wrote {} byte frame to device", current.frame.len());
                }
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        if current.written == 0 {
                            self.queue.lock().push_front(current.frame);
                        } else {
                            debug!(
                                "Dropping frame cut after {} of {} bytes",
                                current.written,
                                current.wire.len()
                            );
                        }
                        debug!("Device write failed during shutdown: {}", e);
                        break;
                    }
                    self.stats.write_retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Device write failed after {} of {} bytes, retrying: {}",
                        current.written,
                        current.wire.len(),
                        e
                    );
                    retry = Some(current);
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
        debug!("Device writer stopped, {} frames left", self.len());
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, current: &mut InFlight) -> io::Result<()> {
    while current.written < current.wire.len() {
        let n = writer.write(&current.wire[current.written..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        current.written += n;
    }
    writer.flush().await
}
