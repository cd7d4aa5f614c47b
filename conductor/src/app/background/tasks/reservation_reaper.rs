// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reclaims leases left behind by workers that went away
//!
//! Lease acquisition reclaims stale leases by itself, but only on nodes that
//! somebody wants.  This task sweeps every reserved node so that leases of
//! dead conductors do not linger, then deals with what those workers left
//! behind:
//!
//! - An ACTIVE node whose lease was reclaimed is taken over: its deploy
//!   capability re-establishes whatever this conductor needs to manage it.
//! - A node in a running state (VERIFYING, DEPLOYING, CLEANING, ...) with no
//!   lease at all was orphaned mid-operation.  Nobody will ever finish that
//!   operation, so the node is moved to the corresponding failure state.

use crate::app::background::BackgroundTask;
use crate::app::lifecycle::Engine;
use crate::app::lifecycle::Event;
use crate::app::task::Task;
use crate::app::task_manager::ReclaimOutcome;
use crate::app::task_manager::TaskManager;
use anyhow::Context;
use conductor_common::api::external::Error;
use conductor_db_queries::context::OpContext;
use conductor_db_queries::db::DataStore;
use conductor_db_queries::db::NodeFilter;
use conductor_types::node::Node;
use conductor_types::node::ProvisionState;
use conductor_types::reservation::LeaseMode;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use uuid::Uuid;

const ORPHANED_ERROR: &str =
    "the worker running this operation went away before finishing it";

pub struct ReservationReaper {
    datastore: Arc<DataStore>,
    tasks: Arc<TaskManager>,
    engine: Arc<Engine>,
}

#[derive(Debug, Default, Serialize)]
struct ActivationResults {
    reserved: usize,
    reclaimed: usize,
    taken_over: usize,
    orphans_found: usize,
    orphans_aborted: usize,
    errors: Vec<String>,
}

impl ReservationReaper {
    pub fn new(
        datastore: Arc<DataStore>,
        tasks: Arc<TaskManager>,
        engine: Arc<Engine>,
    ) -> ReservationReaper {
        ReservationReaper { datastore, tasks, engine }
    }

    async fn reap(
        &self,
        opctx: &OpContext,
        results: &mut ActivationResults,
    ) -> Result<(), anyhow::Error> {
        let reserved = self
            .datastore
            .node_list(
                opctx,
                &NodeFilter { reserved: Some(true), ..Default::default() },
            )
            .await
            .context("failed to list reserved nodes")?;
        results.reserved = reserved.len();

        for node in &reserved {
            match self.reclaim(opctx, node).await {
                Ok(true) => results.reclaimed += 1,
                Ok(false) => continue,
                Err(error) => {
                    warn!(
                        opctx.log,
                        "failed to reclaim lease";
                        "node_id" => %node.id,
                        "error" => format!("{:#}", error),
                    );
                    results.errors.push(format!("{:#}", error));
                    continue;
                }
            }
            if node.provision_state != ProvisionState::Active {
                continue;
            }
            match self.take_over(opctx, node.id).await {
                Ok(true) => results.taken_over += 1,
                Ok(false) => (),
                Err(error) => {
                    warn!(
                        opctx.log,
                        "failed to take over node";
                        "node_id" => %node.id,
                        "error" => format!("{:#}", error),
                    );
                    results.errors.push(format!("{:#}", error));
                }
            }
        }

        let running: Vec<_> =
            ProvisionState::iter().filter(|s| s.is_running()).collect();
        let orphans = self
            .datastore
            .node_list(
                opctx,
                &NodeFilter {
                    provision_states: Some(running),
                    reserved: Some(false),
                    ..Default::default()
                },
            )
            .await
            .context("failed to list unreserved nodes in running states")?;
        results.orphans_found = orphans.len();

        for node in &orphans {
            match self.abort_orphan(opctx, node.id).await {
                Ok(true) => results.orphans_aborted += 1,
                Ok(false) => (),
                Err(error) => {
                    warn!(
                        opctx.log,
                        "failed to fail orphaned node";
                        "node_id" => %node.id,
                        "error" => format!("{:#}", error),
                    );
                    results.errors.push(format!("{:#}", error));
                }
            }
        }

        Ok(())
    }

    /// Returns whether a stale lease was removed from `node`
    async fn reclaim(
        &self,
        opctx: &OpContext,
        node: &Node,
    ) -> Result<bool, anyhow::Error> {
        let outcome = self
            .tasks
            .reclaim_stale(opctx, node)
            .await
            .with_context(|| format!("reclaiming lease on node {}", node.id))?;
        Ok(outcome == ReclaimOutcome::Reclaimed)
    }

    /// Takes over an ACTIVE node whose lease has been reclaimed
    ///
    /// Returns `false` if somebody else got to the node first.
    async fn take_over(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> Result<bool, anyhow::Error> {
        let Some(mut task) = self.try_lock(opctx, node_id).await? else {
            return Ok(false);
        };
        if task.node().provision_state != ProvisionState::Active {
            task.release().await?;
            return Ok(false);
        }

        let driver = Arc::clone(task.driver());
        if let Err(error) = driver.deploy().take_over(&mut task).await {
            error!(
                task.log(),
                "take over failed";
                "error" => %error,
            );
            task.node_mut().last_error =
                Some(format!("failed to take over node: {}", error));
        }
        let saved = task.save().await;
        task.release().await?;
        saved.with_context(|| {
            format!("saving node {} after take over", node_id)
        })?;
        info!(opctx.log, "took over node"; "node_id" => %node_id);
        Ok(true)
    }

    /// Moves an orphaned node out of its running state
    ///
    /// Returns `false` if the node turned out not to be orphaned.
    async fn abort_orphan(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> Result<bool, anyhow::Error> {
        let Some(mut task) = self.try_lock(opctx, node_id).await? else {
            return Ok(false);
        };
        // The listing may be out of date by now: make sure the node is still
        // running an operation that nobody holds a lease for.
        if !task.node().provision_state.is_running() {
            task.release().await?;
            return Ok(false);
        }

        let from = task.node().provision_state;
        let result = self
            .engine
            .process_event(
                &mut task,
                Event::Abort { error: String::from(ORPHANED_ERROR) },
            )
            .await;
        task.release().await?;
        let state = result
            .with_context(|| format!("failing orphaned node {}", node_id))?;
        info!(
            opctx.log,
            "failed orphaned operation";
            "node_id" => %node_id,
            "from" => %from,
            "to" => %state,
        );
        Ok(true)
    }

    /// Takes an exclusive lease on the node without waiting for one
    ///
    /// Returns `None` if the node is locked or gone.
    async fn try_lock(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> Result<Option<Task>, anyhow::Error> {
        let holder = self.tasks.new_holder();
        match self
            .tasks
            .acquire(
                opctx,
                node_id,
                LeaseMode::Exclusive,
                &holder,
                Some(Duration::ZERO),
            )
            .await
        {
            Ok(task) => Ok(Some(task)),
            Err(Error::NodeLocked { .. }) => Ok(None),
            Err(error) if error.is_node_not_found() => Ok(None),
            Err(error) => Err(anyhow::Error::new(error)
                .context(format!("locking node {}", node_id))),
        }
    }
}

impl BackgroundTask for ReservationReaper {
    fn activate<'a>(
        &'a self,
        opctx: &'a OpContext,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            let mut results = ActivationResults::default();
            if let Err(error) = self.reap(opctx, &mut results).await {
                error!(
                    opctx.log,
                    "reservation reaper activation failed";
                    "error" => format!("{:#}", error),
                );
                results.errors.push(format!("{:#}", error));
            }
            if results.reclaimed > 0 || results.orphans_aborted > 0 {
                info!(
                    opctx.log,
                    "reservation reaper cleaned up";
                    "reclaimed" => results.reclaimed,
                    "taken_over" => results.taken_over,
                    "orphans_aborted" => results.orphans_aborted,
                );
            }
            serde_json::to_value(&results).unwrap_or_else(|error| {
                serde_json::json!({
                    "error": format!("failed to serialize results: {}", error)
                })
            })
        }
        .boxed()
    }
}
