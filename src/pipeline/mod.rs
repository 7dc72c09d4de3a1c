//! Outbound/inbound audio plumbing between the codec and the transport.
//!
//! Encoded frames are produced on whatever context the codec runs on and are
//! handed to a single sender task through a bounded queue, so the codec never
//! waits on the network. Inbound frames go straight to the codec for decoding.

pub mod queue;

pub use queue::{EnqueueOutcome, FrameConsumer, FrameProducer, OutboundQueue};

use crate::codec::{AudioCodec, CodecError};
use crate::transport::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Audio pipeline already stopped")]
    Stopped,
}

/// Destination for encoded audio frames
#[async_trait]
pub trait FrameSender: Send + Sync {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct PipelineState {
    running: AtomicBool,
    send_enabled: AtomicBool,
    sent: AtomicU64,
    send_failures: AtomicU64,
}

impl PipelineState {
    fn accepts_frames(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.send_enabled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub queued: u64,
    pub dropped: u64,
    pub sent: u64,
    pub send_failures: u64,
}

struct SenderTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct AudioPipeline {
    codec: Mutex<Option<Box<dyn AudioCodec>>>,
    queue_capacity: usize,
    state: Arc<PipelineState>,
    producer: Mutex<Option<FrameProducer>>,
    sender: Mutex<Option<SenderTask>>,
    last_stats: Mutex<PipelineStats>,
}

impl AudioPipeline {
    pub fn new(codec: Box<dyn AudioCodec>, queue_capacity: usize) -> Self {
        Self {
            codec: Mutex::new(Some(codec)),
            queue_capacity,
            state: Arc::new(PipelineState::default()),
            producer: Mutex::new(None),
            sender: Mutex::new(None),
            last_stats: Mutex::new(PipelineStats::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    pub fn is_sending_enabled(&self) -> bool {
        self.state.send_enabled.load(Ordering::Acquire)
    }

    /// Wire the codec output into the queue, initialize the codec and start
    /// the sender task. Frames are only queued once sending is enabled.
    pub async fn start(&self, sender: Arc<dyn FrameSender>) -> Result<(), PipelineError> {
        let mut codec_guard = self.codec.lock().await;
        let codec = codec_guard.as_mut().ok_or(PipelineError::Stopped)?;

        if self.is_running() {
            log::warn!("⚠️  Audio pipeline already running");
            return Ok(());
        }

        let (producer, consumer) = OutboundQueue::bounded(self.queue_capacity);

        let state = Arc::clone(&self.state);
        let callback_producer = producer.clone();
        codec.set_encoded_callback(Arc::new(move |frame: Vec<u8>| {
            if state.accepts_frames() {
                callback_producer.push(frame);
            }
        }));

        self.state.running.store(true, Ordering::Release);
        if let Err(e) = codec.initialize().await {
            self.state.running.store(false, Ordering::Release);
            return Err(e.into());
        }

        *self.producer.lock().await = Some(producer);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sender_loop(
            consumer,
            sender,
            Arc::clone(&self.state),
            cancel.clone(),
        ));
        *self.sender.lock().await = Some(SenderTask { handle, cancel });

        log::info!(
            "🔊 Audio pipeline started ({} codec, queue capacity {})",
            codec.format(),
            self.queue_capacity
        );
        Ok(())
    }

    /// Gate whether encoded frames are queued for sending
    pub fn enable_sending(&self, enabled: bool) {
        let previous = self.state.send_enabled.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            log::info!(
                "🎙️  Audio sending {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
    }

    /// Hand an inbound frame to the codec for decoding. Decode failures are
    /// logged and the frame is dropped.
    pub async fn handle_incoming_audio(&self, frame: Vec<u8>) {
        let mut codec = self.codec.lock().await;
        match codec.as_mut() {
            Some(codec) => {
                if let Err(e) = codec.write_audio(&frame).await {
                    log::warn!("⚠️  Failed to decode {} byte frame: {}", frame.len(), e);
                }
            }
            None => log::trace!("Pipeline stopped, dropping {} byte frame", frame.len()),
        }
    }

    /// Stop sending, wait for the sender task and release the codec.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.state.send_enabled.store(false, Ordering::Release);
        self.state.running.store(false, Ordering::Release);

        let task = self.sender.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                log::warn!("Audio sender task ended abnormally: {}", e);
            }
        }

        let stats = self.stats().await;
        *self.last_stats.lock().await = stats;
        self.producer.lock().await.take();

        let codec = self.codec.lock().await.take();
        if let Some(mut codec) = codec {
            if let Err(e) = codec.close().await {
                log::warn!("⚠️  Codec close failed: {}", e);
            }
            log::info!(
                "🔇 Audio pipeline stopped (sent {}, dropped {}, failed {})",
                stats.sent,
                stats.dropped,
                stats.send_failures
            );
        }
    }

    pub async fn stats(&self) -> PipelineStats {
        let producer = self.producer.lock().await;
        match producer.as_ref() {
            Some(producer) => PipelineStats {
                queued: producer.queued(),
                dropped: producer.dropped(),
                sent: self.state.sent.load(Ordering::Relaxed),
                send_failures: self.state.send_failures.load(Ordering::Relaxed),
            },
            None => *self.last_stats.lock().await,
        }
    }
}

async fn sender_loop(
    mut consumer: FrameConsumer,
    sender: Arc<dyn FrameSender>,
    state: Arc<PipelineState>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = consumer.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = sender.send_frame(frame) => result,
        };

        match result {
            Ok(()) => {
                state.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_connection_closed() => {
                log::info!("🔌 Connection closed, audio sending stopped ({})", e);
                state.send_enabled.store(false, Ordering::Release);
                break;
            }
            Err(e) => {
                state.send_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("⚠️  Failed to send audio frame: {}", e);
            }
        }
    }

    consumer.close();
    log::debug!("Audio sender task exited");
}
