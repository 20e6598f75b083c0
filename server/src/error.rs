use shared::ProtocolError;
use thiserror::Error;

/// Failures that prevent a session from being created or the server from running
#[derive(Debug, Error)]
pub enum GameError {
    #[error("map data missing or unusable: {0}")]
    MissingMapData(String),
    #[error("game version {0} is not supported by this map")]
    UnsupportedVersion(u8),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}
