//! Object store messenger
//!
//! This crate defines how clients, the store and the manager talk to each
//! other: a length-prefixed, crc32c-protected frame format, the catalogue of
//! request/response/notification messages carried in those frames, and
//! framed reader/writer halves over any tokio byte stream.

pub mod connection;
pub mod error;
pub mod frames;
pub mod message;

pub use connection::*;
pub use error::*;
pub use frames::*;
pub use message::*;
