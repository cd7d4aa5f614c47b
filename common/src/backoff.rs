// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Return a backoff policy for polling a node lease that is held by somebody
/// else
///
/// Lease acquisition never blocks indefinitely: the policy gives up once
/// `timeout` has elapsed, after which the caller sees the last `NodeLocked`
/// error.
pub fn lease_acquire_policy(timeout: Duration) -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(20);
    const MAX_INTERVAL: Duration = Duration::from_secs(1);
    let mut policy =
        internal_service_policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL);
    policy.max_elapsed_time = Some(timeout);
    policy
}

/// Return a backoff policy for redelivering step completions, which may race
/// with the holder of the node's lease for a relatively short amount of time.
pub fn internal_service_policy_short() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(50);
    const MAX_INTERVAL: Duration = Duration::from_secs(1);
    internal_service_policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL)
}

fn internal_service_policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
) -> ::backoff::ExponentialBackoff {
    let current_interval = initial_interval;
    ::backoff::ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time: None,
        ..backoff::ExponentialBackoff::default()
    }
}
