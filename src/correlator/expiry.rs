//! Expiry task servicing request deadlines.
//!
//! A single task sleeps until the earliest deadline in the pending set, expires
//! everything due, and goes back to sleep. Issuing a request with an earlier
//! deadline wakes it through `Shared::wake`. Expiry removes entries under the
//! same mutex as `resolve`, so whichever reaches an entry first wins.

use std::sync::Arc;

use log::debug;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{LOG_TARGET, Shared};

/// Handle to the running expiry task. Dropping it stops the task.
pub(super) struct ExpiryTaskHandle {
    _join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl Drop for ExpiryTaskHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Spawn the expiry task. Must be called from within a Tokio runtime.
pub(super) fn spawn_expiry_task(shared: Arc<Shared>) -> ExpiryTaskHandle {
    let cancel_token = CancellationToken::new();
    let join_handle = tokio::spawn(expiry_loop(shared, cancel_token.clone()));

    ExpiryTaskHandle {
        _join_handle: join_handle,
        cancel_token,
    }
}

async fn expiry_loop(shared: Arc<Shared>, cancel_token: CancellationToken) {
    loop {
        let next_deadline = shared.expire_due(Instant::now());

        let sleep = async move {
            match next_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                debug!(target: LOG_TARGET, "Expiry task cancelled, shutting down");
                break;
            }
            _ = shared.wake.notified() => {}
            _ = sleep => {}
        }
    }
}
