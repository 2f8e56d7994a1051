//! Cross-store object movement through the manager

use crate::error::{ClientError, Result};
use crate::transport::Transport;
use denc::ObjectId;
use msgr::{Request, Response};
use std::sync::Arc;
use tracing::debug;

pub struct TransferAgent {
    manager: Option<Arc<dyn Transport>>,
}

impl TransferAgent {
    pub fn new(manager: Option<Arc<dyn Transport>>) -> Self {
        Self { manager }
    }

    fn manager(&self) -> Result<&Arc<dyn Transport>> {
        self.manager.as_ref().ok_or(ClientError::NotConnected)
    }

    /// Ask the manager to pull `ids` into the local store
    ///
    /// Returns once the request is accepted; the objects arrive later and
    /// can be awaited with Get or Wait.
    pub async fn fetch(&self, ids: &[ObjectId]) -> Result<()> {
        let manager = self.manager()?;
        debug!("Fetching {} objects", ids.len());
        match manager
            .call(Request::Fetch {
                object_ids: ids.to_vec(),
            })
            .await?
        {
            Response::Fetch => Ok(()),
            other => Err(unexpected(other, None)),
        }
    }

    /// Push a locally sealed object to the store at `address:port`
    pub async fn transfer(&self, address: &str, port: u16, object_id: ObjectId) -> Result<()> {
        let manager = self.manager()?;
        debug!("Transferring {} to {}:{}", object_id, address, port);
        match manager
            .call(Request::Transfer {
                address: address.to_string(),
                port,
                object_id,
            })
            .await?
        {
            Response::Transfer => Ok(()),
            other => Err(unexpected(other, Some(object_id))),
        }
    }
}

/// Turn any reply but the expected one into an error
pub(crate) fn unexpected(response: Response, object_id: Option<ObjectId>) -> ClientError {
    match response {
        Response::Error(reply) => ClientError::from_reply(reply, object_id),
        other => ClientError::Protocol(format!("unexpected reply {:?}", other.tag())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_manager() {
        let agent = TransferAgent::new(None);
        let id = ObjectId::new([1; 20]);
        assert!(matches!(
            agent.fetch(&[id]).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            agent.transfer("127.0.0.1", 7000, id).await,
            Err(ClientError::NotConnected)
        ));
    }
}
