//! Object store and manager
//!
//! The store owns the object table: it reserves space on Create, freezes
//! objects on Seal, hands out reference-counted views on Get, reclaims
//! zero-reference objects under memory pressure and broadcasts lifecycle
//! events to subscribers. The manager sits next to a store and answers the
//! cross-store requests (Fetch, Transfer, Wait) using a registry of peer
//! stores.
//!
//! Both are reachable in-process through the [`Service`] trait and over a
//! Unix socket through [`server::serve`].

pub mod error;
pub mod eviction;
pub mod manager;
pub mod notifier;
pub mod peer;
pub mod server;
pub mod service;
pub mod store;
pub mod table;
pub mod wait_helper;

pub use error::{Result, StoreError};
pub use manager::Manager;
pub use peer::{Peer, PeerAddr, RemoteStore};
pub use service::Service;
pub use store::{Store, StoreStats};
pub use table::{ClientId, ObjectState};
