// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A unit of work on one node, performed under a lease
//!
//! A [`Task`] bundles the node snapshot, the resolved [`Driver`], and the
//! lease that makes the snapshot trustworthy.  Tasks are handed out by the
//! [`TaskManager`](super::task_manager::TaskManager) and must be given back
//! with [`Task::release()`].  A task that is dropped without being released
//! (because its operation panicked or was cancelled) releases its lease from
//! a background task, first moving the node out of any in-progress state.

use super::drivers::Driver;
use super::lifecycle::machine;
use super::lifecycle::machine::Event;
use super::lifecycle::machine::Provision;
use super::task_manager::release_lease;
use conductor_common::api::external::Error;
use conductor_db_queries::context::OpContext;
use conductor_db_queries::db::DataStore;
use conductor_types::node::Node;
use conductor_types::node::NodeUpdate;
use conductor_types::reservation::HolderId;
use conductor_types::reservation::LeaseMode;
use conductor_types::step::StepCompletion;
use futures::future::BoxFuture;
use futures::FutureExt;
use slog::Logger;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// How many times an interrupted operation retries moving its node to a
/// failure state before giving up on it
const ABORT_ATTEMPTS: usize = 3;

pub struct Task {
    opctx: OpContext,
    datastore: Arc<DataStore>,
    node: Node,
    /// the node's data as of the last load or save, used to rebase changes
    /// when a shared-lease save races with another writer
    loaded: NodeUpdate,
    driver: Arc<Driver>,
    holder: HolderId,
    mode: LeaseMode,
    save_retry_limit: u32,
    /// whether the last saved provisioning state is a running state
    in_operation: bool,
    released: bool,
    after_release: Mutex<Vec<BoxFuture<'static, ()>>>,
    step_completions: mpsc::UnboundedSender<StepCompletion>,
}

pub(super) struct TaskParams {
    pub opctx: OpContext,
    pub datastore: Arc<DataStore>,
    pub node: Node,
    pub driver: Arc<Driver>,
    pub holder: HolderId,
    pub mode: LeaseMode,
    pub save_retry_limit: u32,
    pub step_completions: mpsc::UnboundedSender<StepCompletion>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("node_id", &self.node.id)
            .field("provision_state", &self.node.provision_state)
            .field("holder", &self.holder)
            .field("mode", &self.mode)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub(super) fn new(params: TaskParams) -> Task {
        let TaskParams {
            opctx,
            datastore,
            node,
            driver,
            holder,
            mode,
            save_retry_limit,
            step_completions,
        } = params;
        let loaded = node.to_update();
        Task {
            opctx,
            datastore,
            node,
            loaded,
            driver,
            holder,
            mode,
            save_retry_limit,
            in_operation: false,
            released: false,
            after_release: Mutex::new(Vec::new()),
            step_completions,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Returns the node snapshot for modification
    ///
    /// Changes are not stored until [`Task::save()`].
    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    pub fn node_id(&self) -> Uuid {
        self.node.id
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    /// Switches the node to another driver
    ///
    /// Like other changes to the node, the switch is only stored by
    /// [`Task::save()`], but the task uses `driver` right away.
    pub fn set_driver(&mut self, driver: Arc<Driver>) {
        self.node.driver = driver.name().to_owned();
        self.driver = driver;
    }

    pub fn opctx(&self) -> &OpContext {
        &self.opctx
    }

    pub fn log(&self) -> &Logger {
        &self.opctx.log
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    pub fn mode(&self) -> LeaseMode {
        self.mode
    }

    pub fn is_shared(&self) -> bool {
        self.mode == LeaseMode::Shared
    }

    pub(super) fn set_mode(&mut self, mode: LeaseMode) {
        self.mode = mode;
    }

    /// Returns a sender for reporting asynchronous step completions back to
    /// this conductor
    pub fn step_completions(&self) -> mpsc::UnboundedSender<StepCompletion> {
        self.step_completions.clone()
    }

    /// Arranges for `future` to be spawned once this task's lease has been
    /// released
    ///
    /// If the task is dropped without being released, `future` is dropped
    /// without being run.
    pub fn spawn_after_release<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending =
            self.after_release.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(future.boxed());
    }

    /// Fails unless this task holds an exclusive lease
    pub fn require_exclusive(&self) -> Result<(), Error> {
        match self.mode {
            LeaseMode::Exclusive => Ok(()),
            LeaseMode::Shared => {
                Err(Error::ExclusiveLockRequired { node_id: self.node.id })
            }
        }
    }

    /// Stores the changes made to the node snapshot
    ///
    /// The write only succeeds if nobody else changed the node since it was
    /// loaded.  Under an exclusive lease, nobody else can have, so a conflict
    /// is reported as an error.  Under a shared lease, other holders may have
    /// made unrelated changes: our changes are replayed onto theirs and the
    /// write is retried up to the configured limit.
    pub async fn save(&mut self) -> Result<(), Error> {
        let desired = self.node.to_update();
        let mut update = desired.clone();
        let mut expected = self.node.generation;
        let mut attempts = 0;

        loop {
            let result = self
                .datastore
                .node_update_if_current(
                    &self.opctx,
                    self.node.id,
                    expected,
                    update.clone(),
                )
                .await?;
            if result.was_updated() {
                self.set_node(result.found);
                return Ok(());
            }

            let found = result.found;
            let conflict = Error::VersionConflict {
                node_id: self.node.id,
                expected,
                found: found.generation,
            };
            if self.mode == LeaseMode::Exclusive {
                error!(
                    self.opctx.log,
                    "node changed while held under an exclusive lease \
                    (this is a bug!)";
                    "expected_generation" => %expected,
                    "found_generation" => %found.generation,
                );
                return Err(conflict);
            }
            if attempts >= self.save_retry_limit {
                warn!(
                    self.opctx.log,
                    "giving up on saving node after repeated conflicts";
                    "attempts" => attempts + 1,
                );
                return Err(conflict);
            }

            attempts += 1;
            debug!(
                self.opctx.log,
                "node changed under shared lease, rebasing";
                "found_generation" => %found.generation,
                "attempt" => attempts,
            );
            let mut rebased = found.to_update();
            rebased.rebase(&self.loaded, &desired);
            update = rebased;
            expected = found.generation;
        }
    }

    /// Replaces the node snapshot with the stored node, discarding unsaved
    /// changes
    pub async fn reload(&mut self) -> Result<(), Error> {
        let node = self.datastore.node_fetch(&self.opctx, self.node.id).await?;
        self.set_node(node);
        Ok(())
    }

    fn set_node(&mut self, node: Node) {
        self.loaded = node.to_update();
        self.in_operation = node.provision_state.is_running();
        self.node = node;
    }

    /// Releases the task's lease
    ///
    /// If the node was left in a running state (because the operation
    /// failed partway through), it is first moved to the corresponding
    /// failure state.  Work queued with [`Task::spawn_after_release()`] starts
    /// once the lease is gone.
    pub async fn release(mut self) -> Result<(), Error> {
        self.released = true;

        if self.in_operation {
            warn!(
                self.opctx.log,
                "releasing node with an operation in progress";
                "provision_state" => %self.node.provision_state,
            );
            abort_interrupted(
                &self.opctx,
                &self.datastore,
                self.node.id,
                "operation was interrupted",
            )
            .await;
        }

        let result = release_lease(
            &self.opctx,
            &self.datastore,
            self.node.id,
            &self.holder,
        )
        .await;

        let pending = std::mem::take(
            self.after_release.get_mut().unwrap_or_else(|e| e.into_inner()),
        );
        for future in pending {
            tokio::spawn(future);
        }

        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(self.opctx.log, "lease was gone before release");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let pending = std::mem::take(
            self.after_release.get_mut().unwrap_or_else(|e| e.into_inner()),
        );
        if !pending.is_empty() {
            debug!(
                self.opctx.log,
                "discarding work queued for after release";
                "count" => pending.len(),
            );
        }

        let opctx = self.opctx.clone();
        let datastore = Arc::clone(&self.datastore);
        let node_id = self.node.id;
        let holder = self.holder.clone();
        let in_operation = self.in_operation;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    opctx.log,
                    "task dropped without releasing its lease";
                    "in_operation" => in_operation,
                );
                handle.spawn(async move {
                    if in_operation {
                        abort_interrupted(
                            &opctx,
                            &datastore,
                            node_id,
                            "operation was cancelled",
                        )
                        .await;
                    }
                    if let Err(error) =
                        release_lease(&opctx, &datastore, node_id, &holder)
                            .await
                    {
                        error!(
                            opctx.log,
                            "failed to release lease of dropped task";
                            "error" => %error,
                        );
                    }
                });
            }
            Err(_) => {
                error!(
                    opctx.log,
                    "task dropped outside of a runtime; its lease will be \
                    left for reclamation";
                    "holder" => %holder,
                );
            }
        }
    }
}

/// Moves a node whose operation was interrupted out of its running state
///
/// Only the changes to the node record are made: the driver is not called,
/// since the operation that would have cleaned up is the one that went away.
/// Failures are logged; the node will then be found by the reservation
/// reaper once the lease is gone.
async fn abort_interrupted(
    opctx: &OpContext,
    datastore: &DataStore,
    node_id: Uuid,
    reason: &str,
) {
    for _ in 0..ABORT_ATTEMPTS {
        let mut node = match datastore.node_fetch(opctx, node_id).await {
            Ok(node) => node,
            Err(error) => {
                warn!(
                    opctx.log,
                    "failed to load interrupted node";
                    "error" => %error,
                );
                return;
            }
        };
        if !node.provision_state.is_running() {
            return;
        }

        let event = Event::Abort { error: reason.to_owned() };
        let transition = match machine::transition(Provision::of(&node), &event)
        {
            Ok(transition) => transition,
            Err(error) => {
                error!(
                    opctx.log,
                    "cannot abort interrupted node";
                    "error" => %error,
                );
                return;
            }
        };
        transition.apply(&mut node);
        match datastore
            .node_update_if_current(
                opctx,
                node_id,
                node.generation,
                node.to_update(),
            )
            .await
        {
            Ok(result) if result.was_updated() => {
                info!(
                    opctx.log,
                    "aborted interrupted operation";
                    "from" => %transition.from,
                    "to" => %transition.to,
                );
                return;
            }
            Ok(_) => continue,
            Err(error) => {
                warn!(
                    opctx.log,
                    "failed to abort interrupted node";
                    "error" => %error,
                );
                return;
            }
        }
    }
    warn!(opctx.log, "gave up aborting interrupted node after conflicts");
}
