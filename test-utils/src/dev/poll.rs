// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for polling for a condition in the test suite

use std::future::Future;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Result of [`wait_for_condition`]
#[derive(Debug, Error)]
pub enum Error<E: std::fmt::Debug + Send + Sync + 'static> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("permanent error: {0:?}")]
    PermanentError(E),
}

/// Result of one attempt to check a condition (see [`wait_for_condition`])
#[derive(Debug, Error)]
pub enum CondCheckError<E: std::fmt::Debug + Send + Sync + 'static> {
    /// the condition we're waiting for is not true
    #[error("poll condition not yet ready")]
    NotYet,
    #[error("non-retryable error while polling on condition: {0:?}")]
    Failed(E),
}

impl<E> From<E> for CondCheckError<E>
where
    E: std::fmt::Debug + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        CondCheckError::Failed(error)
    }
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// a given time has expired
///
/// `cond` is invoked every `poll_interval` until it returns `Ok` (in which
/// case the value is returned to the caller) or `Err(CondCheckError::Failed)`
/// (in which case the wrapped error is returned as a permanent error).  After
/// `poll_max` has elapsed, `Error::TimedOut` is returned.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
    E: std::fmt::Debug + Send + Sync + 'static,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }

        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
            Err(CondCheckError::NotYet) => (),
        }

        tokio::time::sleep(*poll_interval).await;
    }
}
