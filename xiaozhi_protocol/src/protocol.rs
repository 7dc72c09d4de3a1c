use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Version announced in the `Protocol-Version` header and in `hello`
pub const PROTOCOL_VERSION: u32 = 1;

/// Transport name announced in `hello`
pub const TRANSPORT_NAME: &str = "websocket";

/// Upgrade request headers required by the server
pub mod headers {
    pub const AUTHORIZATION: &str = "Authorization";
    pub const PROTOCOL_VERSION: &str = "Protocol-Version";
    pub const DEVICE_ID: &str = "Device-Id";
    pub const CLIENT_ID: &str = "Client-Id";
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Control message must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Discriminator carried in the `type` field of every control message
#[derive(Debug, Clone, PartialEq, Eq, Hash, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum MessageType {
    Hello,
    Listen,
    Stt,
    Tts,
    Llm,
    Mcp,
    /// Any type this client has no special handling for
    #[strum(default)]
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Other(name) => name,
            known => known.as_ref(),
        }
    }
}

// Equivalent to strum's `EnumString` derive (lowercase names, `Other`
// default); written by hand because the derive also emits a
// `TryFrom<&str>` impl that conflicts with `From<&str>` below.
impl std::str::FromStr for MessageType {
    type Err = strum::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "hello" => MessageType::Hello,
            "listen" => MessageType::Listen,
            "stt" => MessageType::Stt,
            "tts" => MessageType::Tts,
            "llm" => MessageType::Llm,
            "mcp" => MessageType::Mcp,
            other => MessageType::Other(other.into()),
        })
    }
}

impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        value
            .parse()
            .unwrap_or_else(|_| MessageType::Other(value.to_string()))
    }
}

/// `state` of a `tts` message
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TtsState {
    Start,
    Stop,
}

/// `state` of a `listen` message
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
}

/// Listening modes understood by the server
pub mod listen_mode {
    pub const REALTIME: &str = "realtime";
    pub const AUTO: &str = "auto";
    pub const MANUAL: &str = "manual";
}

/// Audio parameters declared in the `hello` handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    /// Wire codec name, e.g. "opus"
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Frame duration in milliseconds
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate: 16000,
            channels: 1,
            frame_duration: 20,
        }
    }
}

/// A JSON control-channel message.
///
/// The server adds fields freely, so the message is kept as a plain JSON
/// object and typed accessors are layered on top of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlMessage(Map<String, Value>);

impl ControlMessage {
    pub fn new(message_type: MessageType) -> Self {
        let mut map = Map::new();
        map.insert(
            "type".to_string(),
            Value::String(message_type.as_str().to_string()),
        );
        Self(map)
    }

    /// Add or replace a field
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Parse an inbound text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => Ok(Self(map)),
            Value::Array(_) => Err(ProtocolError::NotAnObject("array")),
            Value::String(_) => Err(ProtocolError::NotAnObject("string")),
            Value::Number(_) => Err(ProtocolError::NotAnObject("number")),
            Value::Bool(_) => Err(ProtocolError::NotAnObject("bool")),
            Value::Null => Err(ProtocolError::NotAnObject("null")),
        }
    }

    /// Serialize for a text frame
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// Raw `type` field, if present
    pub fn type_str(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.type_str().map(MessageType::from)
    }

    pub fn is_type(&self, message_type: &MessageType) -> bool {
        self.type_str() == Some(message_type.as_str())
    }

    pub fn state(&self) -> Option<&str> {
        self.0.get("state").and_then(Value::as_str)
    }

    /// TTS start/stop signal; `None` for anything that is not a `tts` message
    /// with a recognised state.
    pub fn tts_state(&self) -> Option<TtsState> {
        if !self.is_type(&MessageType::Tts) {
            return None;
        }
        self.state().and_then(|s| s.parse().ok())
    }

    /// Session id assigned by the server in its `hello`
    pub fn session_id(&self) -> Option<&str> {
        self.0.get("session_id").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Client `hello` announcing protocol version, features and audio format
    pub fn hello(params: &AudioParams) -> Self {
        Self::new(MessageType::Hello)
            .with("version", PROTOCOL_VERSION)
            .with("features", json!({ "mcp": true }))
            .with("transport", TRANSPORT_NAME)
            .with(
                "audio_params",
                json!({
                    "format": params.format,
                    "sample_rate": params.sample_rate,
                    "channels": params.channels,
                    "frame_duration": params.frame_duration,
                }),
            )
    }

    pub fn listen_start(mode: &str) -> Self {
        Self::new(MessageType::Listen)
            .with("state", ListenState::Start.to_string())
            .with("mode", mode)
    }

    pub fn listen_stop() -> Self {
        Self::new(MessageType::Listen).with("state", ListenState::Stop.to_string())
    }
}

impl From<Map<String, Value>> for ControlMessage {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(text) => f.write_str(&text),
            Err(_) => Err(fmt::Error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_shape() {
        let hello = ControlMessage::hello(&AudioParams::default());
        let value: Value = serde_json::from_str(&hello.to_text().unwrap()).unwrap();

        assert_eq!(value["type"], "hello");
        assert_eq!(value["version"], 1);
        assert_eq!(value["features"]["mcp"], true);
        assert_eq!(value["transport"], "websocket");
        assert_eq!(value["audio_params"]["format"], "opus");
        assert_eq!(value["audio_params"]["sample_rate"], 16000);
        assert_eq!(value["audio_params"]["channels"], 1);
        assert_eq!(value["audio_params"]["frame_duration"], 20);
    }

    #[test]
    fn test_listen_messages() {
        let start = ControlMessage::listen_start(listen_mode::REALTIME);
        assert_eq!(start.message_type(), Some(MessageType::Listen));
        assert_eq!(start.state(), Some("start"));
        assert_eq!(start.get("mode").and_then(Value::as_str), Some("realtime"));

        let stop = ControlMessage::listen_stop();
        assert_eq!(stop.state(), Some("stop"));
        assert!(stop.get("mode").is_none());
    }

    #[test]
    fn test_parse_tts_state() {
        let msg = ControlMessage::parse(r#"{"type":"tts","state":"start"}"#).unwrap();
        assert_eq!(msg.tts_state(), Some(TtsState::Start));

        let msg = ControlMessage::parse(r#"{"type":"tts","state":"sentence_start","text":"hi"}"#)
            .unwrap();
        assert_eq!(msg.tts_state(), None);

        // state only counts on tts messages
        let msg = ControlMessage::parse(r#"{"type":"listen","state":"stop"}"#).unwrap();
        assert_eq!(msg.tts_state(), None);
    }

    #[test]
    fn test_parse_unknown_and_missing_type() {
        let msg = ControlMessage::parse(r#"{"type":"iot","commands":[]}"#).unwrap();
        assert_eq!(msg.message_type(), Some(MessageType::Other("iot".to_string())));
        assert_eq!(msg.message_type().unwrap().to_string(), "iot");

        let msg = ControlMessage::parse(r#"{"text":"no type here"}"#).unwrap();
        assert_eq!(msg.message_type(), None);
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!("mcp".parse::<MessageType>().unwrap(), MessageType::Mcp);
        assert_eq!(MessageType::from("tts"), MessageType::Tts);
        assert_eq!(MessageType::Llm.to_string(), "llm");
        assert_eq!(MessageType::Hello.as_str(), "hello");

        // names are case sensitive
        assert_eq!(
            MessageType::from("Hello"),
            MessageType::Other("Hello".to_string())
        );
        assert_eq!(MessageType::Other("alert".to_string()).as_str(), "alert");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            ControlMessage::parse("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            ControlMessage::parse("[1,2,3]"),
            Err(ProtocolError::NotAnObject("array"))
        ));
    }

    #[test]
    fn test_server_hello_session_id() {
        let msg = ControlMessage::parse(
            r#"{"type":"hello","transport":"websocket","session_id":"abc123"}"#,
        )
        .unwrap();
        assert!(msg.is_type(&MessageType::Hello));
        assert_eq!(msg.session_id(), Some("abc123"));
    }
}
