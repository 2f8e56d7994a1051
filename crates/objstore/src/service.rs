//! Request-serving seam shared by the store and the manager
//!
//! Transports (the in-process client link and the socket server) only talk
//! to a `Service`; they never reach into the store's table.

use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::table::ClientId;
use async_trait::async_trait;
use denc::NotificationEvent;
use msgr::{Request, Response};
use tokio::sync::mpsc;

#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Allocate an id for a new connection
    fn register_client(&self) -> ClientId;

    /// Serve one request; failures are carried in `Response::Error`
    async fn dispatch(&self, client: ClientId, request: Request) -> Response;

    /// Open a notification channel
    fn subscribe(&self) -> Result<mpsc::Receiver<NotificationEvent>>;

    /// Release everything held on behalf of `client`
    fn disconnect(&self, client: ClientId);
}

#[async_trait]
impl Service for Store {
    fn name(&self) -> &'static str {
        "store"
    }

    fn register_client(&self) -> ClientId {
        Store::register_client(self)
    }

    async fn dispatch(&self, client: ClientId, request: Request) -> Response {
        self.handle_request(client, request).await
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<NotificationEvent>> {
        Ok(Store::subscribe(self))
    }

    fn disconnect(&self, client: ClientId) {
        Store::disconnect(self, client)
    }
}

/// Error for requests a service does not handle
pub(crate) fn unsupported(service: &str, request: &Request) -> StoreError {
    StoreError::contract(format!("{} does not serve {} requests", service, request.name()))
}
