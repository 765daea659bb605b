use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("datagram truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("query decode failed: {0}")]
    Query(#[from] bincode::Error),
    #[error("content filter is not valid json: {0}")]
    Filter(#[from] serde_json::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket send buffer is full")]
    WouldBlock,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("no tokio runtime to spawn send workers on: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

pub type StreamResult<T> = Result<T, StreamError>;
