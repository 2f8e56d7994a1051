//! Multi-object readiness waits through the manager
//!
//! Arguments are checked before anything is sent, so a malformed call fails
//! immediately instead of blocking. The manager reports a status per object;
//! the partition into ready and remaining is done here, in input order.

use crate::error::{ClientError, Result};
use crate::transport::Transport;
use denc::ObjectId;
use msgr::{timeout_to_wire, ObjectRequest, Request, Response, WAIT_TIMEOUT_CEILING_MS};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outcome of a wait: `(ready, remaining)`, disjoint and covering the input
pub type WaitResult = (HashSet<ObjectId>, HashSet<ObjectId>);

pub struct WaitCoordinator {
    manager: Option<Arc<dyn Transport>>,
}

impl WaitCoordinator {
    pub fn new(manager: Option<Arc<dyn Transport>>) -> Self {
        Self { manager }
    }

    /// Wait until `num_returns` of `ids` are sealed locally or on a peer,
    /// or `timeout` passes
    pub async fn wait(
        &self,
        ids: &[ObjectId],
        num_returns: usize,
        timeout: Duration,
    ) -> Result<WaitResult> {
        let manager = self.manager.as_ref().ok_or(ClientError::NotConnected)?;
        validate(ids.len(), num_returns, timeout)?;

        let unique = dedup(ids);
        let requests: Vec<ObjectRequest> =
            unique.iter().copied().map(ObjectRequest::anywhere).collect();
        let reply = manager
            .call(Request::Wait {
                requests,
                num_ready: num_returns.try_into().unwrap_or(u32::MAX),
                timeout_ms: timeout_to_wire(Some(timeout)),
            })
            .await?;

        let resolved = match reply {
            Response::Wait { requests } => requests,
            Response::Error(reply) => return Err(ClientError::from_reply(reply, None)),
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected a wait reply, got {:?}",
                    other.tag()
                )))
            }
        };
        let result = partition(&unique, &resolved, num_returns)?;
        debug!(
            "Wait for {} of {} objects: {} ready",
            num_returns,
            unique.len(),
            result.0.len()
        );
        Ok(result)
    }
}

fn validate(num_ids: usize, num_returns: usize, timeout: Duration) -> Result<()> {
    if num_returns > num_ids {
        return Err(ClientError::contract(format!(
            "num_returns {} exceeds the {} ids given",
            num_returns, num_ids
        )));
    }
    if timeout > Duration::from_millis(WAIT_TIMEOUT_CEILING_MS) {
        return Err(ClientError::contract(format!(
            "timeout {:?} exceeds the {} ms ceiling",
            timeout, WAIT_TIMEOUT_CEILING_MS
        )));
    }
    Ok(())
}

fn dedup(ids: &[ObjectId]) -> Vec<ObjectId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn partition(
    unique: &[ObjectId],
    resolved: &[ObjectRequest],
    num_returns: usize,
) -> Result<WaitResult> {
    if resolved.len() != unique.len()
        || resolved.iter().zip(unique).any(|(r, id)| r.object_id != *id)
    {
        return Err(ClientError::Protocol(
            "wait reply does not match the requested objects".into(),
        ));
    }

    let ready: HashSet<ObjectId> = resolved
        .iter()
        .filter(|r| r.status.is_available())
        .map(|r| r.object_id)
        .take(num_returns)
        .collect();
    let remaining = unique
        .iter()
        .filter(|id| !ready.contains(*id))
        .copied()
        .collect();
    Ok((ready, remaining))
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgr::ObjectStatus;

    fn id(b: u8) -> ObjectId {
        ObjectId::new([b; 20])
    }

    fn with_status(b: u8, status: ObjectStatus) -> ObjectRequest {
        ObjectRequest {
            status,
            ..ObjectRequest::anywhere(id(b))
        }
    }

    #[test]
    fn test_validation() {
        assert!(validate(2, 2, Duration::from_secs(1)).is_ok());
        assert!(matches!(
            validate(2, 3, Duration::ZERO),
            Err(ClientError::ContractViolation(_))
        ));
        assert!(validate(1, 1, Duration::from_millis(WAIT_TIMEOUT_CEILING_MS)).is_ok());
        assert!(matches!(
            validate(1, 1, Duration::from_millis(WAIT_TIMEOUT_CEILING_MS + 1)),
            Err(ClientError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_partition_takes_first_available_in_input_order() {
        let unique = [id(1), id(2), id(3), id(4)];
        let resolved = [
            with_status(1, ObjectStatus::Nonexistent),
            with_status(2, ObjectStatus::Remote),
            with_status(3, ObjectStatus::Local),
            with_status(4, ObjectStatus::Local),
        ];
        let (ready, remaining) = partition(&unique, &resolved, 2).unwrap();
        assert_eq!(ready, HashSet::from([id(2), id(3)]));
        assert_eq!(remaining, HashSet::from([id(1), id(4)]));

        // Fewer available than asked for
        let (ready, remaining) = partition(&unique[..2], &resolved[..2], 2).unwrap();
        assert_eq!(ready, HashSet::from([id(2)]));
        assert_eq!(remaining, HashSet::from([id(1)]));
    }

    #[test]
    fn test_partition_rejects_mismatched_reply() {
        let resolved = [with_status(9, ObjectStatus::Local)];
        assert!(matches!(
            partition(&[id(1)], &resolved, 1),
            Err(ClientError::Protocol(_))
        ));
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        assert_eq!(dedup(&[id(2), id(1), id(2)]), vec![id(2), id(1)]);
    }

    #[tokio::test]
    async fn test_no_manager_link() {
        let waiter = WaitCoordinator::new(None);
        assert!(matches!(
            waiter.wait(&[id(1)], 1, Duration::ZERO).await,
            Err(ClientError::NotConnected)
        ));
    }
}
