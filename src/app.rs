use crate::codec::AudioCodec;
use crate::config::ClientSettings;
use crate::error::Result;
use crate::pipeline::{AudioPipeline, FrameSender};
use crate::transport::{DisconnectReason, StreamTransport, TransportEvents};
use crate::tts_cache::TtsCache;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use xiaozhi_protocol::{ControlMessage, TtsState};

/// Routes transport events into the cache and the audio pipeline
struct ClientEvents {
    pipeline: Arc<AudioPipeline>,
    cache: Arc<TtsCache>,
    stop: CancellationToken,
}

#[async_trait]
impl TransportEvents for ClientEvents {
    async fn on_control(&self, message: ControlMessage) {
        handle_control(&self.cache, &message);
    }

    async fn on_audio(&self, frame: Vec<u8>) {
        self.pipeline.handle_incoming_audio(frame).await;
    }

    async fn on_disconnect(&self, reason: DisconnectReason) {
        log::info!("🔌 Server disconnected ({}), stopping", reason);
        self.stop.cancel();
    }
}

/// Echo a control message to stdout and drive the TTS cache from it
pub fn handle_control(cache: &TtsCache, message: &ControlMessage) {
    match message.tts_state() {
        Some(TtsState::Start) => cache.start_tts(),
        Some(TtsState::Stop) => {
            cache.end_tts();
        }
        None => {}
    }
    println!("{}", format_control(message));
}

/// `[<type>] <json>`, or `[json]` for messages without a type
pub fn format_control(message: &ControlMessage) -> String {
    match message.type_str() {
        Some(message_type) => format!("[{}] {}", message_type, message),
        None => format!("[json] {}", message),
    }
}

/// Wires the transport, audio pipeline and TTS cache into one session
pub struct VoiceClient {
    settings: Arc<ClientSettings>,
    transport: Arc<StreamTransport>,
    pipeline: Arc<AudioPipeline>,
    cache: Arc<TtsCache>,
    stop: CancellationToken,
    shut_down: AtomicBool,
}

impl VoiceClient {
    pub fn new(settings: Arc<ClientSettings>, mut codec: Box<dyn AudioCodec>) -> Self {
        let cache = Arc::new(TtsCache::new(
            &settings.cache,
            settings.audio.output_sample_rate,
        ));

        let decoded_cache = Arc::clone(&cache);
        codec.set_decoded_callback(Arc::new(move |samples: &[i16]| {
            decoded_cache.append_audio(samples);
        }));

        let audio_params = settings.audio.audio_params(codec.format());
        let pipeline = Arc::new(AudioPipeline::new(codec, settings.audio.queue_capacity));
        let stop = CancellationToken::new();

        let events = Arc::new(ClientEvents {
            pipeline: Arc::clone(&pipeline),
            cache: Arc::clone(&cache),
            stop: stop.clone(),
        });
        let transport = Arc::new(StreamTransport::new(
            Arc::clone(&settings),
            audio_params,
            events,
        ));

        Self {
            settings,
            transport,
            pipeline,
            cache,
            stop,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<TtsCache> {
        &self.cache
    }

    pub fn pipeline(&self) -> &Arc<AudioPipeline> {
        &self.pipeline
    }

    pub fn transport(&self) -> &Arc<StreamTransport> {
        &self.transport
    }

    /// Cancelling this token ends [`VoiceClient::run`]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Connect, stream until the server disconnects or `shutdown` resolves,
    /// then tear everything down. Teardown also runs when startup fails.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.cache.start_session();
        let result = self.stream_until_stopped(shutdown).await;
        self.shutdown().await;
        result
    }

    async fn stream_until_stopped<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.transport.connect().await?;
        self.transport.handshake().await?;

        let sender: Arc<dyn FrameSender> = self.transport.clone();
        self.pipeline.start(sender).await?;
        self.transport
            .start_listening(&self.settings.listen_mode)
            .await?;
        self.pipeline.enable_sending(true);

        println!("🎧 Streaming... Press Ctrl+C to exit");

        tokio::select! {
            _ = self.stop.cancelled() => log::info!("Session ended by server"),
            _ = shutdown => log::info!("🛑 Shutdown requested"),
        }
        Ok(())
    }

    /// Stop audio, tell the server we stopped listening, close the
    /// connection and flush the cache. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.cancel();

        self.pipeline.stop().await;
        if let Err(e) = self
            .transport
            .send_control(&ControlMessage::listen_stop())
            .await
        {
            log::debug!("listen stop not delivered: {}", e);
        }
        self.transport.close().await;
        self.cache.end_session();

        log::info!("👋 Client shut down");
    }
}
