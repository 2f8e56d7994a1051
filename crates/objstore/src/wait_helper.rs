//! Generic helper for the snapshot-then-wait pattern
//!
//! Blocking store calls (Get, Wait) check a predicate against the current
//! table, and if it does not hold, sleep until the table changes or the
//! deadline passes. No lock is held while sleeping.

use futures::future::{self, Either};
use futures::FutureExt;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Wait until `check_fn` yields a value or `timeout` elapses
///
/// # Pattern
///
/// 1. Register interest in `notify` before looking, so a change between the
///    check and the sleep is not lost
/// 2. Check the condition (fast path when it already holds)
/// 3. Sleep until notified or the deadline, then go back to 1
/// 4. At the deadline, check one final time before giving up
///
/// # Arguments
///
/// * `check_fn` - Returns `Some(T)` once the condition holds
/// * `notify` - Woken (with `notify_waiters`) whenever the state changes
/// * `timeout` - Maximum time to wait; `None` waits forever
/// * `timeout_error` - Error to return on timeout
pub async fn wait_for_condition<T, E, CheckFn>(
    check_fn: CheckFn,
    notify: &Notify,
    timeout: Option<Duration>,
    timeout_error: E,
) -> Result<T, E>
where
    CheckFn: FnMut() -> Option<T>,
{
    wait_for_any(check_fn, &[notify], timeout, timeout_error).await
}

/// Like [`wait_for_condition`], but woken by any of several notifiers
pub async fn wait_for_any<T, E, CheckFn>(
    mut check_fn: CheckFn,
    notifies: &[&Notify],
    timeout: Option<Duration>,
    timeout_error: E,
) -> Result<T, E>
where
    CheckFn: FnMut() -> Option<T>,
{
    // A deadline too far away to represent is the same as none
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

    loop {
        // Notified futures observe notify_waiters() from creation, not first poll
        let changed = if notifies.is_empty() {
            Either::Left(future::pending::<()>())
        } else {
            Either::Right(
                future::select_all(notifies.iter().map(|n| Box::pin(n.notified()))).map(|_| ()),
            )
        };

        if let Some(value) = check_fn() {
            return Ok(value);
        }

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = changed => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        return check_fn().ok_or(timeout_error);
                    }
                }
            }
            None => {
                changed.await;
            }
        }
    }
}
