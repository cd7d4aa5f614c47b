// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lease management: acquiring, upgrading, reclaiming, and releasing node
//! leases
//!
//! A lease is the `reservation` field of the node record.  Every change to it
//! goes through a compare-and-set on the node's `reservation_gen`, so two
//! workers racing for the same node cannot both believe they won.  A lease
//! whose holder has gone away is reclaimed by whoever next wants the node,
//! but only after the lease's grace period has passed.

use super::drivers::DriverRegistry;
use super::task::Task;
use super::task::TaskParams;
use chrono::Utc;
use conductor_common::api::external::Error;
use conductor_common::backoff::lease_acquire_policy;
use conductor_common::backoff::retry_notify;
use conductor_common::backoff::BackoffError;
use conductor_config::ConductorConfig;
use conductor_db_queries::context::OpContext;
use conductor_db_queries::db::DataStore;
use conductor_db_queries::db::WorkerRegistry;
use conductor_types::node::Node;
use conductor_types::reservation::HolderId;
use conductor_types::reservation::LeaseHolder;
use conductor_types::reservation::LeaseMode;
use conductor_types::reservation::Reservation;
use conductor_types::step::StepCompletion;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// What came of an attempt to reclaim stale leases on a node
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReclaimOutcome {
    /// at least one stale holder was removed
    Reclaimed,
    /// every holder is still entitled to its lease
    NotReclaimed,
    /// the reservation changed while we were looking at it
    Raced,
}

pub struct TaskManager {
    log: Logger,
    datastore: Arc<DataStore>,
    drivers: Arc<DriverRegistry>,
    workers: Arc<dyn WorkerRegistry>,
    hostname: String,
    /// this conductor process's registry instance, stamped on every holder
    /// it mints
    instance: Uuid,
    grace_period: Duration,
    lease_timeout: Option<Duration>,
    acquire_timeout: Duration,
    save_retry_limit: u32,
    step_completions: mpsc::UnboundedSender<StepCompletion>,
}

impl TaskManager {
    pub fn new(
        log: &Logger,
        datastore: Arc<DataStore>,
        drivers: Arc<DriverRegistry>,
        workers: Arc<dyn WorkerRegistry>,
        config: &ConductorConfig,
        instance: Uuid,
        step_completions: mpsc::UnboundedSender<StepCompletion>,
    ) -> TaskManager {
        TaskManager {
            log: log.new(o!("component" => "TaskManager")),
            datastore,
            drivers,
            workers,
            hostname: config.hostname.clone(),
            instance,
            grace_period: config.reservation_grace_period,
            lease_timeout: config.lease_timeout,
            acquire_timeout: config.lease_acquire_timeout,
            save_retry_limit: config.save_retry_limit,
            step_completions,
        }
    }

    /// Returns a fresh lease-holder identity for a worker of this conductor
    pub fn new_holder(&self) -> HolderId {
        HolderId::new(&self.hostname, self.instance)
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    /// Acquires a lease on `node_id` for `holder` and returns the [`Task`]
    /// that holds it
    ///
    /// While the node is locked by somebody else, acquisition is retried
    /// with backoff for up to `timeout` (the configured acquire timeout if
    /// `None`), after which the caller sees [`Error::NodeLocked`].  Any other
    /// error is returned right away.
    pub async fn acquire(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        mode: LeaseMode,
        holder: &HolderId,
        timeout: Option<Duration>,
    ) -> Result<Task, Error> {
        let timeout = timeout.unwrap_or(self.acquire_timeout);
        let node = retry_notify(
            lease_acquire_policy(timeout),
            || async {
                self.try_acquire(opctx, node_id, mode, holder)
                    .await
                    .map_err(retry_if_locked)
            },
            |error: Error, delay: Duration| {
                debug!(
                    opctx.log,
                    "node is locked, will retry";
                    "node_id" => %node_id,
                    "error" => %error,
                    "retry_after" => ?delay,
                );
            },
        )
        .await?;

        let driver = match self.drivers.get(&node.driver) {
            Ok(driver) => driver,
            Err(error) => {
                warn!(
                    opctx.log,
                    "node's driver is not loaded";
                    "node_id" => %node_id,
                    "driver" => &node.driver,
                );
                if let Err(release_error) =
                    release_lease(opctx, &self.datastore, node_id, holder).await
                {
                    error!(
                        opctx.log,
                        "failed to release lease";
                        "node_id" => %node_id,
                        "error" => %release_error,
                    );
                }
                return Err(error);
            }
        };

        let opctx = opctx.child(BTreeMap::from([
            (String::from("node_id"), node_id.to_string()),
            (String::from("driver"), node.driver.clone()),
            (String::from("holder"), holder.to_string()),
        ]));
        debug!(opctx.log, "acquired node lease"; "mode" => %mode);
        Ok(Task::new(TaskParams {
            opctx,
            datastore: Arc::clone(&self.datastore),
            node,
            driver,
            holder: holder.clone(),
            mode,
            save_retry_limit: self.save_retry_limit,
            step_completions: self.step_completions.clone(),
        }))
    }

    async fn try_acquire(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        mode: LeaseMode,
        holder: &HolderId,
    ) -> Result<Node, Error> {
        loop {
            let node = self.datastore.node_fetch(opctx, node_id).await?;
            let now = Utc::now();
            let proposed = match (&node.reservation, mode) {
                (None, LeaseMode::Exclusive) => {
                    Reservation::exclusive(holder.clone(), now)
                }
                (None, LeaseMode::Shared) => {
                    Reservation::shared(holder.clone(), now)
                }
                (Some(reservation), _) if reservation.is_held_by(holder) => {
                    // The holder already has a lease at least as strong as
                    // the one it is asking for.  The new task takes its own
                    // reference, so that the lease outlives whichever of the
                    // holder's tasks is released first.
                    if reservation.mode() != mode
                        && reservation.mode() != LeaseMode::Exclusive
                    {
                        return Err(Error::invalid_request(
                            "holder already has a shared lease on this node \
                            and must upgrade it",
                        ));
                    }
                    reservation.with_reference(holder)
                }
                (
                    Some(Reservation::Shared { holders }),
                    LeaseMode::Shared,
                ) => {
                    let mut holders = holders.clone();
                    holders.push(LeaseHolder::new(holder.clone(), now));
                    Reservation::Shared { holders }
                }
                (Some(reservation), _) => {
                    match self.reclaim(opctx, &node, None).await? {
                        ReclaimOutcome::Reclaimed | ReclaimOutcome::Raced => {
                            continue;
                        }
                        ReclaimOutcome::NotReclaimed => {
                            return Err(Error::NodeLocked {
                                node_id,
                                holder: reservation.describe_holders(),
                            });
                        }
                    }
                }
            };

            let result = self
                .datastore
                .node_reservation_cas(
                    opctx,
                    node_id,
                    node.reservation_gen,
                    Some(proposed),
                )
                .await?;
            if result.was_updated() {
                return Ok(result.found);
            }
            trace!(opctx.log, "lost lease race, looking again";
                "node_id" => %node_id);
        }
    }

    /// Converts the task's shared lease into an exclusive one
    ///
    /// This only succeeds once the task is the node's sole holder.  Other
    /// holders are waited on (and reclaimed if stale) the same way lease
    /// acquisition does.
    pub async fn upgrade(&self, task: &mut Task) -> Result<(), Error> {
        if task.mode() == LeaseMode::Exclusive {
            return Ok(());
        }

        let opctx = task.opctx().clone();
        let holder = task.holder().clone();
        let node_id = task.node_id();
        retry_notify(
            lease_acquire_policy(self.acquire_timeout),
            || async {
                self.try_upgrade(&opctx, node_id, &holder)
                    .await
                    .map_err(retry_if_locked)
            },
            |error: Error, delay: Duration| {
                debug!(
                    opctx.log,
                    "cannot upgrade lease yet, will retry";
                    "error" => %error,
                    "retry_after" => ?delay,
                );
            },
        )
        .await?;

        task.set_mode(LeaseMode::Exclusive);
        debug!(opctx.log, "upgraded node lease to exclusive");
        task.reload().await
    }

    async fn try_upgrade(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        holder: &HolderId,
    ) -> Result<(), Error> {
        loop {
            let node = self.datastore.node_fetch(opctx, node_id).await?;
            let Some(reservation) = &node.reservation else {
                return Err(lease_lost(node_id, holder));
            };
            if !reservation.is_held_by(holder) {
                return Err(lease_lost(node_id, holder));
            }
            if reservation.holders().len() > 1 {
                match self.reclaim(opctx, &node, Some(holder)).await? {
                    ReclaimOutcome::Reclaimed | ReclaimOutcome::Raced => {
                        continue;
                    }
                    ReclaimOutcome::NotReclaimed => {
                        let others = reservation
                            .without(|h| &h.holder == holder)
                            .map(|r| r.describe_holders())
                            .unwrap_or_default();
                        return Err(Error::NodeLocked {
                            node_id,
                            holder: others,
                        });
                    }
                }
            }

            // Every task of the holder keeps its reference.
            let references = reservation
                .holders()
                .iter()
                .find(|h| &h.holder == holder)
                .map_or(1, |h| h.references);
            let exclusive = Reservation::Exclusive {
                holder: LeaseHolder {
                    holder: holder.clone(),
                    acquired_at: Utc::now(),
                    references,
                },
            };
            let result = self
                .datastore
                .node_reservation_cas(
                    opctx,
                    node_id,
                    node.reservation_gen,
                    Some(exclusive),
                )
                .await?;
            if result.was_updated() {
                return Ok(());
            }
        }
    }

    /// Removes every stale holder from the node's lease
    ///
    /// A holder is stale once its lease is older than the grace period and
    /// either the holder is no longer alive or the lease has outlived the
    /// configured lease timeout.
    pub async fn reclaim_stale(
        &self,
        opctx: &OpContext,
        node: &Node,
    ) -> Result<ReclaimOutcome, Error> {
        self.reclaim(opctx, node, None).await
    }

    async fn reclaim(
        &self,
        opctx: &OpContext,
        node: &Node,
        keep: Option<&HolderId>,
    ) -> Result<ReclaimOutcome, Error> {
        let Some(reservation) = &node.reservation else {
            return Ok(ReclaimOutcome::Raced);
        };

        let now = Utc::now();
        let mut stale = Vec::new();
        for lease in reservation.holders() {
            if Some(&lease.holder) == keep {
                continue;
            }
            if self.is_stale(opctx, lease, now).await? {
                stale.push(lease.holder.clone());
            }
        }
        if stale.is_empty() {
            return Ok(ReclaimOutcome::NotReclaimed);
        }

        let remaining = reservation.without(|h| stale.contains(&h.holder));
        let result = self
            .datastore
            .node_reservation_cas(
                opctx,
                node.id,
                node.reservation_gen,
                remaining,
            )
            .await?;
        if !result.was_updated() {
            return Ok(ReclaimOutcome::Raced);
        }

        info!(
            self.log,
            "reclaimed stale lease";
            "node_id" => %node.id,
            "holders" => stale
                .iter()
                .map(|h| h.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        );
        Ok(ReclaimOutcome::Reclaimed)
    }

    async fn is_stale(
        &self,
        opctx: &OpContext,
        lease: &LeaseHolder,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, Error> {
        let age = (now - lease.acquired_at).to_std().unwrap_or(Duration::ZERO);
        if age < self.grace_period {
            return Ok(false);
        }
        if let Some(timeout) = self.lease_timeout {
            if age > timeout {
                return Ok(true);
            }
        }
        Ok(!self.workers.is_alive(opctx, &lease.holder).await?)
    }
}

fn retry_if_locked(error: Error) -> BackoffError<Error> {
    match error {
        Error::NodeLocked { .. } => BackoffError::transient(error),
        _ => BackoffError::permanent(error),
    }
}

fn lease_lost(node_id: Uuid, holder: &HolderId) -> Error {
    Error::internal_error(&format!(
        "lease on node {} is no longer held by {}",
        node_id, holder
    ))
}

/// Gives back one of `holder`'s references to the node's lease, removing the
/// holder once its last reference is gone
///
/// Returns `Ok(false)` if the node is gone or `holder` no longer holds a
/// lease on it (because it was reclaimed).
pub(crate) async fn release_lease(
    opctx: &OpContext,
    datastore: &DataStore,
    node_id: Uuid,
    holder: &HolderId,
) -> Result<bool, Error> {
    loop {
        let node = match datastore.node_fetch(opctx, node_id).await {
            Ok(node) => node,
            Err(error) if error.is_node_not_found() => return Ok(false),
            Err(error) => return Err(error),
        };
        let Some(reservation) = &node.reservation else {
            return Ok(false);
        };
        if !reservation.is_held_by(holder) {
            return Ok(false);
        }

        let remaining = reservation.released_by(holder);
        let result = match datastore
            .node_reservation_cas(opctx, node_id, node.reservation_gen, remaining)
            .await
        {
            Ok(result) => result,
            Err(error) if error.is_node_not_found() => return Ok(false),
            Err(error) => return Err(error),
        };
        if result.was_updated() {
            debug!(opctx.log, "released node lease";
                "node_id" => %node_id, "holder" => %holder);
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::app::test_util::TestHarness;
    use assert_matches::assert_matches;
    use conductor_test_utils::dev;
    use conductor_test_utils::dev::poll::wait_for_condition;
    use conductor_test_utils::dev::poll::CondCheckError;
    use conductor_types::node::NodeCreate;
    use conductor_types::node::PowerState;

    const NO_WAIT: Option<Duration> = Some(Duration::ZERO);

    async fn reservation_of(h: &TestHarness, node_id: Uuid) -> Option<Reservation> {
        h.datastore.node_fetch(&h.opctx, node_id).await.unwrap().reservation
    }

    #[tokio::test]
    async fn test_exclusive_excludes_everyone() {
        let logctx = dev::test_setup_log("test_exclusive_excludes_everyone");
        let h = TestHarness::new(&logctx.log, |_| ()).await;
        let node = h.create_node("fake").await;
        let (h1, h2) = (h.tasks.new_holder(), h.tasks.new_holder());

        let task = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &h1, NO_WAIT)
            .await
            .unwrap();
        for mode in [LeaseMode::Exclusive, LeaseMode::Shared] {
            let error = h
                .tasks
                .acquire(&h.opctx, node.id, mode, &h2, NO_WAIT)
                .await
                .unwrap_err();
            assert_matches!(
                error,
                Error::NodeLocked { node_id, ref holder }
                    if node_id == node.id && holder == &h1.to_string()
            );
        }

        task.release().await.unwrap();
        assert_eq!(reservation_of(&h, node.id).await, None);
        let task = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &h2, NO_WAIT)
            .await
            .unwrap();
        assert!(reservation_of(&h, node.id).await.unwrap().is_held_by(&h2));
        task.release().await.unwrap();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_shared_leases_and_upgrade() {
        let logctx = dev::test_setup_log("test_shared_leases_and_upgrade");
        let h = TestHarness::new(&logctx.log, |config| {
            config.conductor.lease_acquire_timeout = Duration::ZERO;
        })
        .await;
        let node = h.create_node("fake").await;
        let (h1, h2, h3) =
            (h.tasks.new_holder(), h.tasks.new_holder(), h.tasks.new_holder());

        let mut t1 = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Shared, &h1, NO_WAIT)
            .await
            .unwrap();
        let t2 = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Shared, &h2, NO_WAIT)
            .await
            .unwrap();
        let reservation = reservation_of(&h, node.id).await.unwrap();
        assert_eq!(reservation.mode(), LeaseMode::Shared);
        assert_eq!(reservation.holders().len(), 2);

        // Shared holders keep out an exclusive one...
        let error = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &h3, NO_WAIT)
            .await
            .unwrap_err();
        assert_matches!(error, Error::NodeLocked { .. });

        // ...and each other, when one of them wants to upgrade.
        let error = h.tasks.upgrade(&mut t1).await.unwrap_err();
        assert_matches!(
            error,
            Error::NodeLocked { ref holder, .. } if holder == &h2.to_string()
        );
        assert!(t1.is_shared());

        // Asking again for an exclusive lease as a shared holder is a misuse.
        let error = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &h1, NO_WAIT)
            .await
            .unwrap_err();
        assert_matches!(error, Error::InvalidRequest { .. });

        t2.release().await.unwrap();
        h.tasks.upgrade(&mut t1).await.unwrap();
        assert_eq!(t1.mode(), LeaseMode::Exclusive);
        let reservation = reservation_of(&h, node.id).await.unwrap();
        assert_eq!(reservation.mode(), LeaseMode::Exclusive);
        assert!(reservation.is_held_by(&h1));

        t1.release().await.unwrap();
        assert_eq!(reservation_of(&h, node.id).await, None);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let logctx = dev::test_setup_log("test_acquire_waits_for_release");
        let h = TestHarness::new(&logctx.log, |_| ()).await;
        let node = h.create_node("fake").await;
        let (h1, h2) = (h.tasks.new_holder(), h.tasks.new_holder());

        let task = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &h1, NO_WAIT)
            .await
            .unwrap();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            task.release().await.unwrap();
        });

        let task = h
            .tasks
            .acquire(
                &h.opctx,
                node.id,
                LeaseMode::Exclusive,
                &h2,
                Some(Duration::from_secs(30)),
            )
            .await
            .unwrap();
        releaser.await.unwrap();
        assert!(reservation_of(&h, node.id).await.unwrap().is_held_by(&h2));
        task.release().await.unwrap();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_reclaim_dead_holder() {
        let logctx = dev::test_setup_log("test_reclaim_dead_holder");
        let h = TestHarness::new(&logctx.log, |config| {
            config.conductor.reservation_grace_period = Duration::ZERO;
        })
        .await;
        let node = h.create_node("fake").await;

        // A lease held by a conductor that never registered (or crashed and
        // stopped heartbeating) is fair game.
        let dead = HolderId::new("conductor-gone", Uuid::new_v4());
        h.datastore
            .node_reservation_cas(
                &h.opctx,
                node.id,
                node.reservation_gen,
                Some(Reservation::exclusive(dead.clone(), Utc::now())),
            )
            .await
            .unwrap();

        let me = h.tasks.new_holder();
        let task = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &me, NO_WAIT)
            .await
            .unwrap();
        let reservation = reservation_of(&h, node.id).await.unwrap();
        assert!(reservation.is_held_by(&me));
        assert!(!reservation.is_held_by(&dead));
        task.release().await.unwrap();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_reclaim_after_restart_under_same_hostname() {
        let logctx =
            dev::test_setup_log("test_reclaim_after_restart_under_same_hostname");
        let h = TestHarness::new(&logctx.log, |config| {
            config.conductor.reservation_grace_period = Duration::ZERO;
            config.conductor.lease_timeout = None;
        })
        .await;
        let node = h.create_node("fake").await;

        // A worker of an earlier process with our hostname left its lease
        // behind.  Our own heartbeat keeps the hostname's registry entry
        // fresh, but that does not keep the earlier process's workers alive.
        let before_restart =
            HolderId::new(&h.config.conductor.hostname, Uuid::new_v4());
        assert_ne!(before_restart.instance, h.tasks.instance());
        h.datastore
            .node_reservation_cas(
                &h.opctx,
                node.id,
                node.reservation_gen,
                Some(Reservation::exclusive(before_restart.clone(), Utc::now())),
            )
            .await
            .unwrap();
        h.datastore
            .conductor_touch(&h.opctx, &h.config.conductor.hostname)
            .await
            .unwrap();

        let node = h.datastore.node_fetch(&h.opctx, node.id).await.unwrap();
        assert_eq!(
            h.tasks.reclaim_stale(&h.opctx, &node).await.unwrap(),
            ReclaimOutcome::Reclaimed
        );
        assert_eq!(reservation_of(&h, node.id).await, None);

        let me = h.tasks.new_holder();
        let task = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &me, NO_WAIT)
            .await
            .unwrap();
        assert!(reservation_of(&h, node.id).await.unwrap().is_held_by(&me));
        task.release().await.unwrap();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_same_holder_tasks_release_independently() {
        let logctx =
            dev::test_setup_log("test_same_holder_tasks_release_independently");
        let h = TestHarness::new(&logctx.log, |_| ()).await;
        let node = h.create_node("fake").await;
        let (h1, h2) = (h.tasks.new_holder(), h.tasks.new_holder());

        // Two shared tasks of one holder: the lease lasts until both are
        // given back.
        let t1 = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Shared, &h1, NO_WAIT)
            .await
            .unwrap();
        let t2 = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Shared, &h1, NO_WAIT)
            .await
            .unwrap();
        let reservation = reservation_of(&h, node.id).await.unwrap();
        assert_eq!(reservation.holders().len(), 1);
        assert_eq!(reservation.holders()[0].references, 2);

        t1.release().await.unwrap();
        assert!(reservation_of(&h, node.id).await.unwrap().is_held_by(&h1));
        let error = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &h2, NO_WAIT)
            .await
            .unwrap_err();
        assert_matches!(error, Error::NodeLocked { .. });
        t2.release().await.unwrap();
        assert_eq!(reservation_of(&h, node.id).await, None);

        // The same goes for a reentrant exclusive lease.
        let t1 = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &h1, NO_WAIT)
            .await
            .unwrap();
        let t2 = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &h1, NO_WAIT)
            .await
            .unwrap();
        t2.release().await.unwrap();
        let reservation = reservation_of(&h, node.id).await.unwrap();
        assert_eq!(reservation.mode(), LeaseMode::Exclusive);
        assert!(reservation.is_held_by(&h1));
        t1.release().await.unwrap();
        assert_eq!(reservation_of(&h, node.id).await, None);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_no_reclaim_within_grace_or_from_live_holder() {
        let logctx = dev::test_setup_log(
            "test_no_reclaim_within_grace_or_from_live_holder",
        );
        let h = TestHarness::new(&logctx.log, |config| {
            config.conductor.reservation_grace_period =
                Duration::from_secs(3600);
        })
        .await;
        let node = h.create_node("fake").await;
        let dead = HolderId::new("conductor-gone", Uuid::new_v4());
        h.datastore
            .node_reservation_cas(
                &h.opctx,
                node.id,
                node.reservation_gen,
                Some(Reservation::exclusive(dead, Utc::now())),
            )
            .await
            .unwrap();
        let node = h.datastore.node_fetch(&h.opctx, node.id).await.unwrap();
        assert_eq!(
            h.tasks.reclaim_stale(&h.opctx, &node).await.unwrap(),
            ReclaimOutcome::NotReclaimed
        );

        // A live holder keeps its lease however old it is, absent a lease
        // timeout.
        let h = TestHarness::new(&logctx.log, |config| {
            config.conductor.reservation_grace_period = Duration::ZERO;
        })
        .await;
        let node = h.create_node("fake").await;
        let live = h.tasks.new_holder();
        let task = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &live, NO_WAIT)
            .await
            .unwrap();
        let node = h.datastore.node_fetch(&h.opctx, node.id).await.unwrap();
        assert_eq!(
            h.tasks.reclaim_stale(&h.opctx, &node).await.unwrap(),
            ReclaimOutcome::NotReclaimed
        );
        task.release().await.unwrap();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_reclaim_after_lease_timeout() {
        let logctx = dev::test_setup_log("test_reclaim_after_lease_timeout");
        let h = TestHarness::new(&logctx.log, |config| {
            config.conductor.reservation_grace_period = Duration::ZERO;
            config.conductor.lease_timeout = Some(Duration::from_secs(60));
        })
        .await;
        let node = h.create_node("fake").await;

        // The holder's conductor is alive, but the lease is ancient.
        let stuck = h.tasks.new_holder();
        let long_ago = Utc::now() - chrono::Duration::seconds(3600);
        h.datastore
            .node_reservation_cas(
                &h.opctx,
                node.id,
                node.reservation_gen,
                Some(Reservation::shared(stuck.clone(), long_ago)),
            )
            .await
            .unwrap();
        let fresh = h.tasks.new_holder();
        let task = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Shared, &fresh, NO_WAIT)
            .await
            .unwrap();
        let reservation = reservation_of(&h, node.id).await.unwrap();
        assert!(!reservation.is_held_by(&stuck));
        assert!(reservation.is_held_by(&fresh));
        task.release().await.unwrap();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_unknown_driver_releases_lease() {
        let logctx = dev::test_setup_log("test_unknown_driver_releases_lease");
        let h = TestHarness::new(&logctx.log, |_| ()).await;
        let node = h
            .datastore
            .node_create(
                &h.opctx,
                NodeCreate {
                    driver: String::from("nonexistent"),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let holder = h.tasks.new_holder();
        let error = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &holder, NO_WAIT)
            .await
            .unwrap_err();
        assert_matches!(error, Error::ObjectNotFound { .. });
        assert_eq!(reservation_of(&h, node.id).await, None);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_dropped_task_releases_lease() {
        let logctx = dev::test_setup_log("test_dropped_task_releases_lease");
        let h = TestHarness::new(&logctx.log, |_| ()).await;
        let node = h.create_node("fake").await;
        let holder = h.tasks.new_holder();
        let task = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &holder, NO_WAIT)
            .await
            .unwrap();
        drop(task);

        wait_for_condition::<_, Error, _, _>(
            || async {
                match reservation_of(&h, node.id).await {
                    None => Ok(()),
                    Some(_) => Err(CondCheckError::NotYet),
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(10),
        )
        .await
        .unwrap();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_shared_save_rebases() {
        let logctx = dev::test_setup_log("test_shared_save_rebases");
        let h = TestHarness::new(&logctx.log, |_| ()).await;
        let node = h.create_node("fake").await;
        let (h1, h2) = (h.tasks.new_holder(), h.tasks.new_holder());

        let mut t1 = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Shared, &h1, NO_WAIT)
            .await
            .unwrap();
        let mut t2 = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Shared, &h2, NO_WAIT)
            .await
            .unwrap();

        t1.node_mut().power_state = Some(PowerState::PowerOn);
        t1.save().await.unwrap();
        // t2 loaded the node before t1's save; its unrelated change is
        // replayed on top of t1's.
        t2.node_mut().console_enabled = true;
        t2.save().await.unwrap();

        let stored = h.datastore.node_fetch(&h.opctx, node.id).await.unwrap();
        assert_eq!(stored.power_state, Some(PowerState::PowerOn));
        assert!(stored.console_enabled);
        assert_eq!(stored.generation, node.generation.next().next());

        t1.release().await.unwrap();
        t2.release().await.unwrap();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_exclusive_save_conflict() {
        let logctx = dev::test_setup_log("test_exclusive_save_conflict");
        let h = TestHarness::new(&logctx.log, |_| ()).await;
        let node = h.create_node("fake").await;
        let holder = h.tasks.new_holder();
        let mut task = h
            .tasks
            .acquire(&h.opctx, node.id, LeaseMode::Exclusive, &holder, NO_WAIT)
            .await
            .unwrap();

        // Somebody wrote behind the lease's back.
        let mut update = node.to_update();
        update.maintenance = true;
        h.datastore
            .node_update_if_current(&h.opctx, node.id, node.generation, update)
            .await
            .unwrap();

        task.node_mut().console_enabled = true;
        let error = task.save().await.unwrap_err();
        assert_matches!(error, Error::VersionConflict { .. });
        task.release().await.unwrap();
        logctx.cleanup_successful();
    }
}
