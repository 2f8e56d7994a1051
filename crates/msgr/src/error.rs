use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Denc error: {0}")]
    Denc(#[from] denc::DencError),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    BadCrc { expected: u32, actual: u32 },
    #[error("Frame payload of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("Unknown frame tag: {0}")]
    UnknownTag(u16),
    #[error("Connection closed by peer")]
    Closed,
}

impl Error {
    pub fn protocol_error(msg: &str) -> Self {
        Self::Protocol(msg.to_string())
    }

    pub fn connection_error(msg: &str) -> Self {
        Self::Connection(msg.to_string())
    }

    /// Check if this error represents a recoverable connection issue
    ///
    /// Recoverable errors are transient transport failures: reconnecting and
    /// re-issuing the request may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Connection(_) | Error::Closed => true,
            _ => false,
        }
    }

    /// Check if this error means the byte stream can no longer be trusted
    ///
    /// Once a frame fails to decode, frame boundaries are lost and nothing
    /// read afterwards from the same stream is meaningful.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::Denc(_)
                | Error::BadCrc { .. }
                | Error::FrameTooLarge(_)
                | Error::UnknownTag(_)
        ) || matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }

    /// Get a human-readable category for this error
    pub fn category(&self) -> &'static str {
        match self {
            Error::Protocol(_) | Error::UnknownTag(_) => "Protocol",
            Error::Io(_) => "I/O",
            Error::Denc(_) => "Encoding",
            Error::Connection(_) | Error::Closed => "Connection",
            Error::BadCrc { .. } | Error::FrameTooLarge(_) => "Framing",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
