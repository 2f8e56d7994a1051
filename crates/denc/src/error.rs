use thiserror::Error;

#[derive(Error, Debug)]
pub enum DencError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Encoding/Decoding error: {0}")]
    Denc(String),
}

impl DencError {
    pub fn short_read(what: &str, need: usize, have: usize) -> Self {
        DencError::Protocol(format!(
            "Insufficient bytes: need {} for {}, have {}",
            need, what, have
        ))
    }
}
