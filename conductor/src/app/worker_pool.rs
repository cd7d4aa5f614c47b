// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded execution of node operations
//!
//! Every operation that does work on a node after its caller has been
//! answered runs on the [`WorkerPool`].  The pool has a fixed number of
//! slots.  A slot is reserved with [`WorkerPool::try_reserve()`] before the
//! operation takes a lease or changes anything, so that a conductor with no
//! free worker turns the request away with [`Error::NoFreeWorker`] instead of
//! leaving a node half-started.

use conductor_common::api::external::Error;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::sync::TryAcquireError;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;

#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

/// A reserved slot in the [`WorkerPool`]
///
/// Dropping the permit without spawning anything gives the slot back.
#[derive(Debug)]
pub struct WorkerPermit {
    permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    pub fn new(size: usize) -> WorkerPool {
        WorkerPool { slots: Arc::new(Semaphore::new(size)), size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of slots not currently reserved
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn try_reserve(&self) -> Result<WorkerPermit, Error> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => Ok(WorkerPermit { permit }),
            Err(TryAcquireError::NoPermits) => Err(Error::NoFreeWorker),
            Err(TryAcquireError::Closed) => {
                Err(Error::unavail("conductor is shutting down"))
            }
        }
    }

    /// Runs `operation` in the slot reserved by `permit`
    pub fn spawn<F, T>(
        &self,
        permit: WorkerPermit,
        operation: F,
    ) -> OperationHandle<T>
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        let WorkerPermit { permit } = permit;
        let join = tokio::spawn(async move {
            let result = operation.await;
            drop(permit);
            result
        });
        OperationHandle { join }
    }

    /// Stops handing out slots; operations already running are unaffected
    pub fn close(&self) {
        self.slots.close();
    }
}

/// Handle to an operation running on the [`WorkerPool`]
///
/// Dropping the handle detaches the operation; it keeps running.
#[must_use = "dropping an OperationHandle detaches the operation"]
pub struct OperationHandle<T> {
    join: JoinHandle<Result<T, Error>>,
}

impl<T> std::fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("finished", &self.join.is_finished())
            .finish_non_exhaustive()
    }
}

impl<T> OperationHandle<T> {
    /// Waits for the operation to finish
    pub async fn wait(self) -> Result<T, Error> {
        match self.join.await {
            Ok(result) => result,
            Err(error) if error.is_cancelled() => {
                Err(Error::unavail("operation was cancelled"))
            }
            Err(error) => Err(Error::internal_error(&format!(
                "operation panicked: {}",
                error
            ))),
        }
    }

    /// Cancels the operation at its next suspension point
    ///
    /// Any node lease the operation held is released in the background, and
    /// a node it left in a running state is moved to the matching failure
    /// state.
    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// A set of tasks of which at most a fixed number run at once
///
/// Background tasks that fan out over many nodes use this so that one
/// activation cannot swamp the conductor.
pub struct BoundedTaskSet<T> {
    semaphore: Arc<Semaphore>,
    set: JoinSet<T>,
}

impl<T: Send + 'static> BoundedTaskSet<T> {
    pub fn new(max_parallelism: usize) -> BoundedTaskSet<T> {
        BoundedTaskSet {
            semaphore: Arc::new(Semaphore::new(max_parallelism.max(1))),
            set: JoinSet::new(),
        }
    }

    /// Spawns `future` right away; it starts running once fewer than the
    /// maximum number of tasks are running
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        self.set.spawn(async move {
            // The semaphore is never closed, so this only fails if it is.
            let _permit = semaphore.acquire_owned().await.ok();
            future.await
        });
    }

    /// Waits for every task, returning the outputs of those that finished
    /// and the number that panicked
    pub async fn join_all(mut self) -> (Vec<T>, usize) {
        let mut outputs = Vec::new();
        let mut panicked = 0;
        while let Some(result) = self.set.join_next().await {
            match result {
                Ok(output) => outputs.push(output),
                Err(_) => panicked += 1,
            }
        }
        (outputs, panicked)
    }
}
