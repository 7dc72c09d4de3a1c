//! # Xiaozhi Protocol
//!
//! Control-channel vocabulary for the xiaozhi voice service.
//!
//! The service speaks WebSocket: JSON text frames carry control messages
//! (`hello`, `listen`, `stt`, `tts`, `llm`, `mcp`, ...) and binary frames
//! carry wire-encoded audio with no extra framing. This crate only models
//! the text side; audio frames are opaque bytes.
//!
//! ## Example Usage
//!
//! ```rust
//! use xiaozhi_protocol::{AudioParams, ControlMessage, TtsState};
//!
//! let hello = ControlMessage::hello(&AudioParams::default());
//! assert!(hello.to_text().unwrap().contains("\"type\":\"hello\""));
//!
//! let inbound = ControlMessage::parse(r#"{"type":"tts","state":"stop"}"#).unwrap();
//! assert_eq!(inbound.tts_state(), Some(TtsState::Stop));
//! ```

pub mod protocol;

// Re-export commonly used types
pub use protocol::{
    headers, listen_mode, AudioParams, ControlMessage, ListenState, MessageType, ProtocolError,
    TtsState, PROTOCOL_VERSION, TRANSPORT_NAME,
};
