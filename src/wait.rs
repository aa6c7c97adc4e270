//! Bounded polling with cancellation.
//!
//! Every blocking wait in the driver goes through here so that both the
//! interval and the number of attempts are explicit, and so that a caller can
//! abort a long wait through a [CancellationToken].

use crate::error::{DriverError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often and how many times to poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    pub attempts: u32,
    pub interval: Duration,
}

impl Poll {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

/// Sleep unless cancelled first
pub async fn sleep(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(DriverError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run `check` until it returns `true`, at most `poll.attempts` times.
///
/// Returns `Ok(false)` when every attempt came back negative, errors from
/// `check` abort the wait immediately.
pub async fn wait_for<F, Fut>(cancel: &CancellationToken, poll: Poll, mut check: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for attempt in 1..=poll.attempts {
        if cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        if check().await? {
            return Ok(true);
        }
        if attempt < poll.attempts {
            sleep(cancel, poll.interval).await?;
        }
    }
    Ok(false)
}
