//! Per-client three-tier outbound queue and its writer task.
//!
//! Enqueue never blocks: a full tier escalates to the next tier up, a full
//! high tier evicts its oldest frame for a high-priority frame, and
//! anything else is dropped with a warning. The writer drains all high
//! frames, then a bounded batch of normal, then a bounded batch of low,
//! rechecking higher tiers between batches.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use boardroom_core::net::messages::Priority;

use crate::config::HubConfig;

/// An encoded outbound text frame, shared across every recipient.
pub type Frame = std::sync::Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("client queue is closed")]
    Closed,
    #[error("client queues are full")]
    Full,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub normal_batch: usize,
    pub low_batch: usize,
}

impl From<&HubConfig> for QueueLimits {
    fn from(cfg: &HubConfig) -> Self {
        Self {
            high: cfg.high_queue_capacity,
            normal: cfg.normal_queue_capacity,
            low: cfg.low_queue_capacity,
            normal_batch: cfg.normal_batch,
            low_batch: cfg.low_batch,
        }
    }
}

#[derive(Default)]
struct Tiers {
    high: VecDeque<Frame>,
    normal: VecDeque<Frame>,
    low: VecDeque<Frame>,
    closed: bool,
    draining: bool,
}

impl Tiers {
    fn tier(&mut self, priority: Priority) -> &mut VecDeque<Frame> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }
}

pub struct OutboundQueue {
    tiers: Mutex<Tiers>,
    notify: Notify,
    limits: QueueLimits,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            tiers: Mutex::new(Tiers::default()),
            notify: Notify::new(),
            limits,
            dropped: AtomicU64::new(0),
        }
    }

    fn capacity(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.limits.high,
            Priority::Normal => self.limits.normal,
            Priority::Low => self.limits.low,
        }
    }

    /// Queue `frame` at `priority`. Returns the tier it landed in.
    pub fn enqueue(&self, frame: Frame, priority: Priority) -> Result<Priority, EnqueueError> {
        let landed = {
            let mut tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
            if tiers.closed || tiers.draining {
                return Err(EnqueueError::Closed);
            }
            let mut candidate = Some(priority);
            let mut landed = None;
            while let Some(tier) = candidate {
                if tiers.tier(tier).len() < self.capacity(tier) {
                    tiers.tier(tier).push_back(frame.clone());
                    landed = Some(tier);
                    break;
                }
                candidate = tier.escalate();
            }
            if landed.is_none() && priority == Priority::High && tiers.high.pop_front().is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("High-priority queue full, evicted oldest frame");
                if tiers.high.len() < self.limits.high {
                    tiers.high.push_back(frame);
                    landed = Some(Priority::High);
                }
            }
            landed
        };

        match landed {
            Some(tier) => {
                if tier != priority {
                    tracing::debug!(?priority, ?tier, "Escalated outbound frame");
                }
                self.notify.notify_one();
                Ok(tier)
            },
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(?priority, "Outbound queues full, dropping frame");
                Err(EnqueueError::Full)
            },
        }
    }

    fn take_batch(&self, tiers: &mut Tiers) -> Vec<Frame> {
        if !tiers.high.is_empty() {
            return tiers.high.drain(..).collect();
        }
        if !tiers.normal.is_empty() {
            let n = self.limits.normal_batch.min(tiers.normal.len());
            return tiers.normal.drain(..n).collect();
        }
        let n = self.limits.low_batch.min(tiers.low.len());
        tiers.low.drain(..n).collect()
    }

    /// Wait for the next batch. Returns `None` once the queue is closed.
    pub async fn recv_batch(&self) -> Option<Vec<Frame>> {
        loop {
            {
                let mut tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
                if tiers.closed {
                    return None;
                }
                if !tiers.is_empty() {
                    return Some(self.take_batch(&mut tiers));
                }
                if tiers.draining {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue and discard anything still pending. Later enqueues
    /// fail with [`EnqueueError::Closed`].
    pub fn close(&self) {
        {
            let mut tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
            tiers.closed = true;
            tiers.high.clear();
            tiers.normal.clear();
            tiers.low.clear();
        }
        self.notify.notify_one();
    }

    /// Stop accepting frames but let the writer flush what is pending.
    pub fn finish(&self) {
        self.tiers.lock().unwrap_or_else(|e| e.into_inner()).draining = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        let tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
        tiers.closed || tiers.draining
    }

    /// Pending frames per tier as `(high, normal, low)`.
    pub fn depths(&self) -> (usize, usize, usize) {
        let tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
        (tiers.high.len(), tiers.normal.len(), tiers.low.len())
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Take every pending frame in drain order without waiting.
    pub fn drain_pending(&self) -> Vec<Frame> {
        let mut tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        while !tiers.is_empty() {
            out.extend(self.take_batch(&mut tiers));
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub min_send_interval: Duration,
    pub ping_interval: Duration,
}

impl From<&HubConfig> for WriterOptions {
    fn from(cfg: &HubConfig) -> Self {
        Self {
            min_send_interval: cfg.min_send_interval(),
            ping_interval: Duration::from_secs(cfg.ping_interval_secs),
        }
    }
}

/// Drain `queue` into `sink` until the queue closes, the sink fails, or
/// `shutdown` fires. Sends periodic pings and a close frame on exit.
pub async fn run_writer<S>(
    mut sink: S,
    queue: std::sync::Arc<OutboundQueue>,
    opts: WriterOptions,
    shutdown: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ping = tokio::time::interval(opts.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;
    let mut last_send: Option<Instant> = None;

    loop {
        tokio::select! {
            batch = queue.recv_batch() => {
                let Some(frames) = batch else { break };
                for frame in frames {
                    if let Some(last) = last_send {
                        let elapsed = last.elapsed();
                        if elapsed < opts.min_send_interval {
                            tokio::time::sleep(opts.min_send_interval - elapsed).await;
                        }
                    }
                    if let Err(e) = sink.send(Message::Text(frame.to_string().into())).await {
                        tracing::debug!(error = %e, "Outbound send failed, closing writer");
                        queue.close();
                        return;
                    }
                    last_send = Some(Instant::now());
                }
            },
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    tracing::debug!(error = %e, "Ping failed, closing writer");
                    queue.close();
                    return;
                }
            },
            _ = shutdown.cancelled() => break,
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}
