use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// Result of offering a frame to the outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queue was full; the offered (newest) frame was discarded
    Dropped,
    /// Consumer is gone; the frame was discarded silently
    Closed,
}

#[derive(Debug, Default)]
struct QueueCounters {
    queued: AtomicU64,
    dropped: AtomicU64,
}

/// Bounded FIFO between the codec's encoding context and the sender task.
///
/// The producer side never blocks and may be used from any thread. When the
/// queue is full the newest frame is dropped, so frames already waiting keep
/// their order.
pub struct OutboundQueue;

impl OutboundQueue {
    pub fn bounded(capacity: usize) -> (FrameProducer, FrameConsumer) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let producer = FrameProducer {
            tx,
            capacity,
            counters: Arc::new(QueueCounters::default()),
        };
        (producer, FrameConsumer { rx })
    }
}

#[derive(Clone)]
pub struct FrameProducer {
    tx: mpsc::Sender<Vec<u8>>,
    capacity: usize,
    counters: Arc<QueueCounters>,
}

impl FrameProducer {
    pub fn push(&self, frame: Vec<u8>) -> EnqueueOutcome {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Queued
            }
            Err(TrySendError::Full(frame)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    log::warn!(
                        "⚠️  Outbound audio queue full, dropped {} frame(s) ({} bytes latest)",
                        dropped,
                        frame.len()
                    );
                }
                EnqueueOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently waiting
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Frames accepted since creation
    pub fn queued(&self) -> u64 {
        self.counters.queued.load(Ordering::Relaxed)
    }

    /// Frames discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

pub struct FrameConsumer {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl FrameConsumer {
    /// Next frame in FIFO order; `None` once every producer is gone
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Vec<u8>> {
        match self.rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Stop accepting frames; already queued ones can still be drained
    pub fn close(&mut self) {
        self.rx.close();
    }
}
