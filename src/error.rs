use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::pipeline::PipelineError;
use crate::transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether this failure came from the handshake acknowledgment wait
    pub fn is_handshake_timeout(&self) -> bool {
        matches!(self, ClientError::Transport(TransportError::HandshakeTimeout(_)))
    }
}
