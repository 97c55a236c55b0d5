use std::net::SocketAddr;

/// Errors raised by the PeerTalk network core.
#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
    #[error("Invalid peer descriptor: {0}")]
    Normalization(String),
    #[error("Failed to decode datagram: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Failed to encode message: {0}")]
    Encode(String),
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("Transport is closed")]
    Closed,
    #[error("Socket is not listening")]
    NotListening,
    #[error("Socket already bound to {0}")]
    AlreadyBound(SocketAddr),
    #[error("Event loop already started")]
    AlreadyStarted,
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<rmp_serde::encode::Error> for NetworkError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
