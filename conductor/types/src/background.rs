// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Status of the conductor's periodic background tasks

use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Serialize;
use std::time::Duration;
use std::time::Instant;

/// What started an activation
///
/// Reported in the task status for operators; tasks themselves never see it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationReason {
    /// somebody called `activate()`
    Signaled,
    /// the task's period elapsed
    Timeout,
}

/// Snapshot of one background task, as published by the task driver
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct TaskStatus {
    pub current: CurrentStatus,
    pub last: LastResult,
    /// periodic activations dropped because the previous one had not
    /// finished and the task does not allow overlap
    pub skipped: u64,
}

#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", tag = "current_status", content = "details")]
pub enum CurrentStatus {
    /// waiting for the period to elapse or for an explicit activation
    Idle,
    /// one or more activations are in progress
    Running(CurrentStatusRunning),
}

impl CurrentStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, CurrentStatus::Idle)
    }

    /// Returns the in-progress activation, if any
    pub fn running(&self) -> Option<&CurrentStatusRunning> {
        match self {
            CurrentStatus::Running(running) => Some(running),
            CurrentStatus::Idle => None,
        }
    }
}

#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct CurrentStatusRunning {
    /// when the newest in-progress activation started
    pub start_time: DateTime<Utc>,
    #[serde(skip)]
    pub start_instant: Instant,
    pub reason: ActivationReason,
    /// activation counter, starting at 1
    pub iteration: u64,
    /// activations started and not yet finished
    pub in_flight: u64,
}

#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", tag = "last_result", content = "details")]
pub enum LastResult {
    NeverCompleted,
    Completed(LastResultCompleted),
}

impl LastResult {
    pub fn has_completed(&self) -> bool {
        matches!(self, LastResult::Completed(_))
    }

    /// Returns the most recent finished activation, if there was one
    pub fn completion(self) -> Option<LastResultCompleted> {
        match self {
            LastResult::Completed(completed) => Some(completed),
            LastResult::NeverCompleted => None,
        }
    }
}

/// Outcome of a finished activation
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct LastResultCompleted {
    pub iteration: u64,
    pub start_time: DateTime<Utc>,
    pub reason: ActivationReason,
    pub elapsed: Duration,
    /// whatever the task reported for this activation; `{"error": ...}` if
    /// the activation panicked
    pub details: serde_json::Value,
}
