//! Client protocol for the shared-memory object store
//!
//! An [`ObjectStoreClient`] creates, seals, gets, releases and deletes
//! immutable objects held by a store, either in this process
//! ([`ObjectStoreClient::local`]) or behind a Unix socket
//! ([`ObjectStoreClient::connect`]). With a manager link it can also wait on
//! objects across stores and move objects between them.
//!
//! ```no_run
//! use storeclient::ObjectStoreClient;
//! use storeconfig::ClientOptions;
//!
//! # async fn demo() -> storeclient::Result<()> {
//! let client = ObjectStoreClient::connect(&ClientOptions::default()).await?;
//! let id = denc::ObjectId::from_content(b"hello");
//! let mut buffer = client.create(id, 5, &b""[..]).await?;
//! buffer.copy_from_slice(b"hello");
//! client.seal(buffer).await?;
//! client.release(id).await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod notification;
pub mod transfer;
pub mod transport;
pub mod wait;

pub use buffer::{BufferView, MutableBuffer};
pub use client::ObjectStoreClient;
pub use config::load_client_options;
pub use error::{ClientError, Result};
pub use notification::NotificationStream;
pub use transfer::TransferAgent;
pub use transport::{LocalTransport, SocketTransport, Transport};
pub use wait::{WaitCoordinator, WaitResult};
