//! Streaming voice-assistant client.
//!
//! A single WebSocket connection carries JSON control messages and binary
//! audio frames. Outbound audio flows codec → bounded queue → transport;
//! inbound audio flows transport → codec → TTS cache.

pub mod app;
pub mod codec;
pub mod config;
pub mod error;
pub mod mock_server;
pub mod pipeline;
pub mod transport;
pub mod tts_cache;

pub use app::VoiceClient;
pub use codec::{AudioCodec, Pcm16Codec};
pub use config::{load_config, ClientSettings};
pub use error::{ClientError, Result};
pub use pipeline::{AudioPipeline, FrameSender, OutboundQueue};
pub use transport::{StreamTransport, TransportError, TransportEvents};
pub use tts_cache::{CacheSample, TtsCache};
