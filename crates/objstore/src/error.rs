use denc::ObjectId;
use msgr::{ErrorCode, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object {0} already exists")]
    ObjectExists(ObjectId),

    #[error("Store full: {requested} bytes requested, {available} of {capacity} available after eviction")]
    StoreFull {
        requested: u64,
        available: u64,
        capacity: u64,
    },

    #[error("Object {0} not found")]
    ObjectNotFound(ObjectId),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Messenger error: {0}")]
    Msgr(#[from] msgr::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Peer store error {code:?}: {message}")]
    Peer { code: ErrorCode, message: String },
}

impl StoreError {
    pub fn contract(msg: impl Into<String>) -> Self {
        StoreError::ContractViolation(msg.into())
    }

    /// Error code reported to the remote side
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::ObjectExists(_) => ErrorCode::ObjectExists,
            StoreError::StoreFull { .. } => ErrorCode::StoreFull,
            StoreError::ObjectNotFound(_) => ErrorCode::ObjectNotFound,
            StoreError::NotConnected(_) => ErrorCode::NotConnected,
            StoreError::ContractViolation(_) => ErrorCode::ContractViolation,
            StoreError::Peer { code, .. } => *code,
            StoreError::Msgr(_) | StoreError::Io(_) | StoreError::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    pub fn into_response(self) -> Response {
        Response::error(self.code(), self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
