use secrecy::{ExposeSecret, SecretBox};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;
use xiaozhi_protocol::{listen_mode, AudioParams};

/// Config file consulted when no `--config` is given
pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

/// Default root for cached TTS audio, relative to the working directory
pub const DEFAULT_CACHE_DIR: &str = "cache/tts";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing config values: {}", .0.join(", "))]
    MissingValues(Vec<String>),
    #[error("Invalid WebSocket URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("Failed to read config file {}: {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed config file {}: {source}", .path.display())]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A setting readable from the environment or from the JSON config file
struct Key {
    env: &'static str,
    path: &'static [&'static str],
}

const WEBSOCKET_URL: Key = Key {
    env: "WEBSOCKET_URL",
    path: &["SYSTEM_OPTIONS", "NETWORK", "WEBSOCKET_URL"],
};
const WEBSOCKET_ACCESS_TOKEN: Key = Key {
    env: "WEBSOCKET_ACCESS_TOKEN",
    path: &["SYSTEM_OPTIONS", "NETWORK", "WEBSOCKET_ACCESS_TOKEN"],
};
const DEVICE_ID: Key = Key {
    env: "DEVICE_ID",
    path: &["SYSTEM_OPTIONS", "DEVICE_ID"],
};
const CLIENT_ID: Key = Key {
    env: "CLIENT_ID",
    path: &["SYSTEM_OPTIONS", "CLIENT_ID"],
};
const TTS_CACHE_ENABLED: Key = Key {
    env: "TTS_CACHE_ENABLED",
    path: &["TTS_CACHE", "ENABLED"],
};
const TTS_CACHE_DIR: Key = Key {
    env: "TTS_CACHE_DIR",
    path: &["TTS_CACHE", "CACHE_DIR"],
};

/// Connection parameters for the voice service
#[derive(Debug)]
pub struct NetworkSettings {
    pub websocket_url: Url,
    access_token: SecretBox<String>,
    pub device_id: String,
    pub client_id: String,
}

impl NetworkSettings {
    /// Get the bearer token (use only when building the upgrade request)
    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }

    pub fn is_secure(&self) -> bool {
        self.websocket_url.scheme() == "wss"
    }
}

/// TTS audio cache settings
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub cache_dir: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }
}

/// Fixed audio format parameters
#[derive(Debug, Clone)]
pub struct AudioSettings {
    /// Sample rate of audio we send (Hz)
    pub input_sample_rate: u32,
    /// Sample rate of decoded TTS audio we receive (Hz)
    pub output_sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
    /// Outbound frame queue capacity
    pub queue_capacity: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            channels: 1,
            frame_duration_ms: 20,
            queue_capacity: 200,
        }
    }
}

impl AudioSettings {
    /// Parameters announced in `hello` for the given wire codec
    pub fn audio_params(&self, format: &str) -> AudioParams {
        AudioParams {
            format: format.to_string(),
            sample_rate: self.input_sample_rate,
            channels: self.channels,
            frame_duration: self.frame_duration_ms,
        }
    }
}

/// Everything the client needs for one run. Built once at startup and
/// shared read-only.
#[derive(Debug)]
pub struct ClientSettings {
    pub network: NetworkSettings,
    pub cache: CacheSettings,
    pub audio: AudioSettings,
    pub listen_mode: String,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl ClientSettings {
    /// Build settings directly, bypassing file and environment lookup
    pub fn new(
        websocket_url: &str,
        access_token: &str,
        device_id: &str,
        client_id: &str,
    ) -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        for (key, value) in [
            (&WEBSOCKET_URL, websocket_url),
            (&WEBSOCKET_ACCESS_TOKEN, access_token),
            (&DEVICE_ID, device_id),
            (&CLIENT_ID, client_id),
        ] {
            if value.trim().is_empty() {
                missing.push(key.env.to_string());
            }
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingValues(missing));
        }

        Ok(Self {
            network: NetworkSettings {
                websocket_url: parse_websocket_url(websocket_url)?,
                access_token: SecretBox::new(Box::new(access_token.to_string())),
                device_id: device_id.to_string(),
                client_id: client_id.to_string(),
            },
            cache: CacheSettings::default(),
            audio: AudioSettings::default(),
            listen_mode: listen_mode::REALTIME.to_string(),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(20),
        })
    }

    /// Load settings from `.env`, the environment and the JSON config file.
    ///
    /// An explicitly named config file must exist; the default one is optional.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let file = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Some(read_config_file(path)?)
                } else {
                    log::debug!("No config file at {}, using environment only", path.display());
                    None
                }
            }
        };

        Self::from_sources(file.as_ref(), |key| env::var(key).ok())
    }

    /// Resolve settings from a parsed config file and an environment lookup.
    /// Environment values win over file values.
    pub fn from_sources<F>(file: Option<&Value>, env_lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &Key| -> Option<String> {
            env_lookup(key.env)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| file.and_then(|f| file_string(f, key.path)))
        };

        let url = lookup(&WEBSOCKET_URL).unwrap_or_default();
        let token = lookup(&WEBSOCKET_ACCESS_TOKEN).unwrap_or_default();
        let device_id = lookup(&DEVICE_ID).unwrap_or_default();
        let client_id = lookup(&CLIENT_ID).unwrap_or_default();

        let mut settings = Self::new(&url, &token, &device_id, &client_id)?;

        if let Some(enabled) = lookup(&TTS_CACHE_ENABLED) {
            settings.cache.enabled = parse_bool(TTS_CACHE_ENABLED.env, &enabled)?;
        }
        if let Some(dir) = lookup(&TTS_CACHE_DIR) {
            settings.cache.cache_dir = PathBuf::from(dir);
        }

        Ok(settings)
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache.cache_dir = cache_dir.into();
        self
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache.enabled = enabled;
        self
    }

    pub fn with_listen_mode(mut self, mode: &str) -> Self {
        self.listen_mode = mode.to_string();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

fn read_config_file(path: &Path) -> Result<Value, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let value = serde_json::from_str(&text).map_err(|source| ConfigError::ParseFile {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("Loaded config file {}", path.display());
    Ok(value)
}

/// Walk a dotted key path; scalars are rendered as strings, null is absent
fn file_string(root: &Value, path: &[&str]) -> Option<String> {
    let value = path.iter().try_fold(root, |node, key| node.get(*key))?;
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_websocket_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}', expected ws or wss", other),
        }),
    }
}

/// Load configuration with helpful error messages
pub fn load_config(config_path: Option<&Path>) -> Result<ClientSettings, ConfigError> {
    match ClientSettings::load(config_path) {
        Ok(settings) => {
            log::info!(
                "Successfully loaded configuration (endpoint: {}, device: {})",
                settings.network.websocket_url,
                settings.network.device_id
            );
            Ok(settings)
        }
        Err(ConfigError::MissingValues(keys)) => {
            log::error!("Missing required configuration: {}", keys.join(", "));
            log::error!("Set them in a .env file or in {}:", DEFAULT_CONFIG_PATH);
            for key in &keys {
                log::error!("{}=...", key);
            }
            Err(ConfigError::MissingValues(keys))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}
