// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Conductor Background Tasks
//!
//! A **background task** in the conductor is any operation that runs
//! periodically rather than on behalf of a caller: heartbeating, reclaiming
//! leases left behind by workers that went away, keeping recorded power
//! states honest, and failing nodes whose asynchronous steps never reported
//! back.
//!
//! Each task implements [`BackgroundTask`] and is registered with the
//! [`Driver`] when the conductor starts (see [`BackgroundTasks::start()`]).
//! The Driver activates every task once at startup, then on its configured
//! period and whenever somebody asks for an activation explicitly.
//!
//! Unless a task allows overlapping activations, a periodic activation that
//! comes due while the previous one is still running is skipped and counted.  A
//! failing activation reports its error in the JSON value it returns, and a
//! panicking one is caught, so neither affects later activations or other
//! tasks.

mod driver;
mod init;
mod tasks;

pub use driver::Driver;
pub use driver::TaskDefinition;
pub use driver::TaskMode;
pub use driver::TaskName;
pub use init::BackgroundTasks;
pub use init::BackgroundTasksData;
pub use init::CallbackTimeouts;

use conductor_db_queries::context::OpContext;
use futures::future::BoxFuture;

/// An operation activated both periodically and on demand
///
/// Background tasks return a JSON value describing what they did.  This is
/// intended for debugging and shows up in the task's status.
pub trait BackgroundTask: Send + Sync {
    fn activate<'a>(
        &'a self,
        opctx: &'a OpContext,
    ) -> BoxFuture<'a, serde_json::Value>;
}
