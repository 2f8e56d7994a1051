use denc::ObjectId;
use msgr::{ErrorCode, ErrorReply};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Object {0} already exists")]
    ObjectExists(ObjectId),

    #[error("Store full: {message}")]
    StoreFull { message: String },

    #[error("Not connected to a manager")]
    NotConnected,

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Notification stream closed")]
    StreamClosed,

    /// No reply in time; the store may still have applied the request
    #[error("{request} request timed out after {after:?}")]
    Timeout {
        request: &'static str,
        after: Duration,
        retry_safe: bool,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Messenger error: {0}")]
    Msgr(#[from] msgr::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Store error {code:?}: {message}")]
    Store { code: ErrorCode, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] storeconfig::ConfigError),
}

impl ClientError {
    pub fn contract(msg: impl Into<String>) -> Self {
        ClientError::ContractViolation(msg.into())
    }

    /// Map an error reply for a request about `object_id`
    pub fn from_reply(reply: ErrorReply, object_id: Option<ObjectId>) -> Self {
        match (reply.code, object_id) {
            (ErrorCode::ObjectExists, Some(id)) => ClientError::ObjectExists(id),
            (ErrorCode::StoreFull, _) => ClientError::StoreFull {
                message: reply.message,
            },
            (ErrorCode::NotConnected, _) => ClientError::NotConnected,
            (ErrorCode::ContractViolation, _) => ClientError::ContractViolation(reply.message),
            (code, _) => ClientError::Store {
                code,
                message: reply.message,
            },
        }
    }

    /// An expected condition the caller may handle and retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::ObjectExists(_)
            | ClientError::StoreFull { .. }
            | ClientError::NotConnected => true,
            ClientError::Timeout { retry_safe, .. } => *retry_safe,
            ClientError::Msgr(e) => e.is_recoverable(),
            ClientError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotFound
            ),
            _ => false,
        }
    }

    /// A caller bug or a corrupted channel; never retried
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::ContractViolation(_)
            | ClientError::StreamClosed
            | ClientError::Protocol(_) => true,
            ClientError::Msgr(e) => e.is_fatal(),
            _ => false,
        }
    }
}

impl From<denc::DencError> for ClientError {
    fn from(e: denc::DencError) -> Self {
        ClientError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_mapping() {
        let id = ObjectId::new([1; 20]);
        let exists = ErrorReply::new(ErrorCode::ObjectExists, "x");
        assert!(matches!(
            ClientError::from_reply(exists, Some(id)),
            ClientError::ObjectExists(got) if got == id
        ));

        let full = ClientError::from_reply(ErrorReply::new(ErrorCode::StoreFull, "full"), None);
        assert!(full.is_recoverable());
        assert!(!full.is_fatal());

        let violation =
            ClientError::from_reply(ErrorReply::new(ErrorCode::ContractViolation, "bad"), None);
        assert!(violation.is_fatal());

        let internal = ClientError::from_reply(ErrorReply::new(ErrorCode::Internal, "?"), None);
        assert!(matches!(internal, ClientError::Store { code: ErrorCode::Internal, .. }));
    }

    #[test]
    fn test_timeout_recoverable_only_when_retry_safe() {
        let contains = ClientError::Timeout {
            request: "contains",
            after: Duration::from_secs(1),
            retry_safe: true,
        };
        assert!(contains.is_recoverable());

        let create = ClientError::Timeout {
            request: "create",
            after: Duration::from_secs(1),
            retry_safe: false,
        };
        assert!(!create.is_recoverable());
        assert!(!create.is_fatal());
    }

    #[test]
    fn test_stream_closed_is_fatal() {
        assert!(ClientError::StreamClosed.is_fatal());
        assert!(!ClientError::StreamClosed.is_recoverable());
    }
}
