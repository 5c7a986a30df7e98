use crate::types::Status;

/// Errors raised by the server plumbing (sockets, codecs, threads, config).
///
/// Hardware outcomes are reported as [`Status`] codes inside RPC responses and
/// only become a `ServerError` when a Rust caller asks for one via
/// [`Status::into_result`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Sensor returned {status} during {operation}")]
    Sensor {
        operation: &'static str,
        status: Status,
    },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown codec tag {0:?}")]
    UnknownCodec([u8; 3]),

    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(String),

    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("Peer disconnected")]
    Disconnected,
}

impl From<toml::de::Error> for ServerError {
    fn from(e: toml::de::Error) -> Self {
        ServerError::Config(e.to_string())
    }
}
