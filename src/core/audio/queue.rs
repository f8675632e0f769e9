//! Bounded per-direction frame queues and drop accounting.
//!
//! Queues never block the producer: when full, the newest frame is dropped
//! so latency stays bounded, and the drop is charged to a reason category.
//! A non-zero [`DropReason::Unknown`] count on a call points at a defect.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

use super::AudioFrame;

/// Why a frame never reached its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Egress (AI → caller) queue at capacity
    TxQueueFull,
    /// Ingress (caller → AI) queue at capacity
    RxQueueFull,
    /// Discarded by an outbound flush after a confirmed barge-in
    BargeInFlush,
    /// AI audio for a response that is no longer active
    StaleResponse,
    /// Caller audio that arrived before the provider session was usable
    ProviderNotReady,
    /// Caller audio withheld while waiting for a human on an outbound call
    AwaitingHuman,
    /// Still queued, or pushed, after the session began tearing down
    SessionClosed,
    /// The telephony socket went away under the egress writer
    TransportClosed,
    /// Audio that could not be sample-rate converted
    ResampleFailed,
    /// Any path without a dedicated category
    Unknown,
}

impl DropReason {
    pub const ALL: [DropReason; 10] = [
        DropReason::TxQueueFull,
        DropReason::RxQueueFull,
        DropReason::BargeInFlush,
        DropReason::StaleResponse,
        DropReason::ProviderNotReady,
        DropReason::AwaitingHuman,
        DropReason::SessionClosed,
        DropReason::TransportClosed,
        DropReason::ResampleFailed,
        DropReason::Unknown,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::TxQueueFull => "tx_queue_full",
            DropReason::RxQueueFull => "rx_queue_full",
            DropReason::BargeInFlush => "barge_in_flush",
            DropReason::StaleResponse => "stale_response",
            DropReason::ProviderNotReady => "provider_not_ready",
            DropReason::AwaitingHuman => "awaiting_human",
            DropReason::SessionClosed => "session_closed",
            DropReason::TransportClosed => "transport_closed",
            DropReason::ResampleFailed => "resample_failed",
            DropReason::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session frame drop counters.
#[derive(Debug, Default)]
pub struct DropCounters {
    by_reason: [AtomicU64; DropReason::ALL.len()],
    total: AtomicU64,
}

impl DropCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge `frames` dropped frames to `reason`.
    pub fn record(&self, reason: DropReason, frames: u64) {
        if frames == 0 {
            return;
        }
        self.by_reason[reason.index()].fetch_add(frames, Ordering::Relaxed);
        self.total.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn get(&self, reason: DropReason) -> u64 {
        self.by_reason[reason.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DropSnapshot {
        let by_reason = DropReason::ALL
            .iter()
            .map(|r| (r.as_str(), self.get(*r)))
            .collect();
        DropSnapshot {
            by_reason,
            total: self.total(),
        }
    }
}

/// Point-in-time copy of [`DropCounters`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct DropSnapshot {
    pub by_reason: BTreeMap<&'static str, u64>,
    pub total: u64,
}

impl DropSnapshot {
    /// Sum over all categories; equals `total` for a consistent snapshot.
    pub fn categorized_sum(&self) -> u64 {
        self.by_reason.values().sum()
    }

    pub fn unknown(&self) -> u64 {
        self.by_reason
            .get(DropReason::Unknown.as_str())
            .copied()
            .unwrap_or(0)
    }
}

/// Bounded FIFO of audio frames.
///
/// Producers use [`push`](FrameQueue::push), which drops on overflow;
/// consumers either poll with [`try_pop`](FrameQueue::try_pop) (the paced
/// egress writer) or await [`pop`](FrameQueue::pop) (the uplink task).
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    overflow_reason: DropReason,
    drops: Arc<DropCounters>,
    notify: Notify,
    closed: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize, overflow_reason: DropReason, drops: Arc<DropCounters>) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            overflow_reason,
            drops,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame. Returns `false` if it was dropped.
    pub fn push(&self, frame: AudioFrame) -> bool {
        // Closed queues belong to a session in teardown.
        if self.closed.load(Ordering::Acquire) {
            self.drops.record(DropReason::SessionClosed, 1);
            return false;
        }
        {
            let mut frames = self.frames.lock();
            if frames.len() >= self.capacity {
                drop(frames);
                self.drops.record(self.overflow_reason, 1);
                tracing::trace!(reason = %self.overflow_reason, "Frame queue full, dropping newest frame");
                return false;
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.frames.lock().pop_front()
    }

    /// Wait for the next frame. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<AudioFrame> {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Discard everything queued, charging the frames to `reason`.
    pub fn flush(&self, reason: DropReason) -> usize {
        let flushed = {
            let mut frames = self.frames.lock();
            let n = frames.len();
            frames.clear();
            n
        };
        self.drops.record(reason, flushed as u64);
        flushed
    }

    /// Stop accepting frames and wake any waiting consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::FrameDirection;
    use std::time::Duration;

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame {
            seq,
            direction: FrameDirection::Outbound,
            sample_rate: 8000,
            samples: vec![0; 160],
        }
    }

    #[test]
    fn test_overflow_drops_newest() {
        let drops = Arc::new(DropCounters::new());
        let queue = FrameQueue::new(2, DropReason::TxQueueFull, drops.clone());

        assert!(queue.push(frame(0)));
        assert!(queue.push(frame(1)));
        assert!(!queue.push(frame(2)));

        assert_eq!(queue.try_pop().unwrap().seq, 0);
        assert_eq!(queue.try_pop().unwrap().seq, 1);
        assert!(queue.try_pop().is_none());
        assert_eq!(drops.get(DropReason::TxQueueFull), 1);
    }

    #[test]
    fn test_flush_is_counted() {
        let drops = Arc::new(DropCounters::new());
        let queue = FrameQueue::new(10, DropReason::TxQueueFull, drops.clone());
        for i in 0..4 {
            queue.push(frame(i));
        }
        assert_eq!(queue.flush(DropReason::BargeInFlush), 4);
        assert!(queue.is_empty());
        assert_eq!(drops.get(DropReason::BargeInFlush), 4);
    }

    #[test]
    fn test_snapshot_sum_matches_total() {
        let drops = DropCounters::new();
        drops.record(DropReason::TxQueueFull, 3);
        drops.record(DropReason::StaleResponse, 5);
        drops.record(DropReason::AwaitingHuman, 2);
        drops.record(DropReason::RxQueueFull, 0);

        let snap = drops.snapshot();
        assert_eq!(snap.total, 10);
        assert_eq!(snap.categorized_sum(), snap.total);
        assert_eq!(snap.unknown(), 0);
        assert_eq!(snap.by_reason.len(), DropReason::ALL.len());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let drops = Arc::new(DropCounters::new());
        let queue = Arc::new(FrameQueue::new(4, DropReason::RxQueueFull, drops));

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(frame(7));

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().seq, 7);
    }

    #[tokio::test]
    async fn test_close_releases_consumer() {
        let drops = Arc::new(DropCounters::new());
        let queue = Arc::new(FrameQueue::new(4, DropReason::RxQueueFull, drops.clone()));

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
        assert!(!queue.push(frame(1)));
        assert_eq!(drops.get(DropReason::SessionClosed), 1);
    }

    #[test]
    fn test_push_after_close_is_counted() {
        let drops = Arc::new(DropCounters::new());
        let queue = FrameQueue::new(4, DropReason::TxQueueFull, drops.clone());
        queue.close();

        assert!(!queue.push(frame(0)));
        assert!(!queue.push(frame(1)));

        let snap = drops.snapshot();
        assert_eq!(snap.total, 2);
        assert_eq!(drops.get(DropReason::SessionClosed), 2);
        assert_eq!(drops.get(DropReason::TxQueueFull), 0);
        assert_eq!(snap.categorized_sum(), snap.total);
    }

    #[test]
    fn test_reason_index_matches_all_order() {
        for (i, reason) in DropReason::ALL.iter().enumerate() {
            assert_eq!(reason.index(), i, "{reason}");
        }
    }
}
