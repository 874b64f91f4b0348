use thiserror::Error;

/// Errors surfaced by the wire protocol, the secure channel and the client.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Declared frame length exceeds the accepted maximum
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Peer closed the stream part way through a frame
    #[error("truncated frame: expected {expected} bytes, got {received}")]
    Truncated { expected: usize, received: usize },

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Key exchange, OAEP or key encoding failure
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Error reported by the server; displays the server's message verbatim
    #[error("{0}")]
    Application(String),

    #[error("invalid operation code: {0}")]
    InvalidOperation(i64),

    /// Acknowledgement other than the single success byte
    #[error("upload rejected by server (ack {0:02x?})")]
    UploadRejected(Vec<u8>),

    #[error("body size mismatch: declared {declared} bytes, sent {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rsa::Error> for ProtocolError {
    fn from(e: rsa::Error) -> Self {
        ProtocolError::Crypto(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::InvalidMetadata(e.to_string())
    }
}
