// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task that keeps recorded power states in line with the
//! hardware
//!
//! Machines get powered on and off behind the conductor's back.  This task
//! asks each idle node's power capability for the actual state and records
//! it when it differs from the stored one.  Nodes that are reserved, in
//! maintenance, or in the middle of an operation are left alone.
//!
//! Each node is first read under a shared lease; the lease is only upgraded
//! to an exclusive one for nodes whose state actually needs recording.

use crate::app::background::BackgroundTask;
use crate::app::lifecycle::Engine;
use crate::app::lifecycle::Event;
use crate::app::task::Task;
use crate::app::task_manager::TaskManager;
use crate::app::worker_pool::BoundedTaskSet;
use anyhow::Context;
use conductor_common::api::external::Error;
use conductor_db_queries::context::OpContext;
use conductor_db_queries::db::DataStore;
use conductor_db_queries::db::NodeFilter;
use conductor_types::node::Node;
use conductor_types::reservation::LeaseMode;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct PowerStateSync {
    datastore: Arc<DataStore>,
    tasks: Arc<TaskManager>,
    engine: Arc<Engine>,
    max_concurrent_nodes: usize,
}

#[derive(Debug)]
enum NodeSync {
    Unchanged,
    Updated,
    /// the node was busy by the time we got to it
    Skipped,
}

#[derive(Debug, Default, Serialize)]
struct ActivationResults {
    nodes_checked: usize,
    unchanged: usize,
    updated: usize,
    skipped: usize,
    errors: Vec<String>,
}

impl PowerStateSync {
    pub fn new(
        datastore: Arc<DataStore>,
        tasks: Arc<TaskManager>,
        engine: Arc<Engine>,
        max_concurrent_nodes: usize,
    ) -> PowerStateSync {
        PowerStateSync { datastore, tasks, engine, max_concurrent_nodes }
    }

    async fn sync_all(
        &self,
        opctx: &OpContext,
        results: &mut ActivationResults,
    ) -> Result<(), anyhow::Error> {
        let nodes = self
            .datastore
            .node_list(
                opctx,
                &NodeFilter {
                    reserved: Some(false),
                    maintenance: Some(false),
                    ..Default::default()
                },
            )
            .await
            .context("failed to list nodes")?;

        let mut set = BoundedTaskSet::new(self.max_concurrent_nodes);
        for node in nodes.iter().filter(|n| is_idle(n)) {
            results.nodes_checked += 1;
            let tasks = Arc::clone(&self.tasks);
            let engine = Arc::clone(&self.engine);
            let opctx = opctx.clone();
            let node_id = node.id;
            set.spawn(async move {
                sync_node(&tasks, &engine, &opctx, node_id)
                    .await
                    .with_context(|| format!("node {}", node_id))
            });
        }

        let (outcomes, panicked) = set.join_all().await;
        for outcome in outcomes {
            match outcome {
                Ok(NodeSync::Unchanged) => results.unchanged += 1,
                Ok(NodeSync::Updated) => results.updated += 1,
                Ok(NodeSync::Skipped) => results.skipped += 1,
                Err(error) => {
                    warn!(
                        opctx.log,
                        "failed to sync power state";
                        "error" => format!("{:#}", error),
                    );
                    results.errors.push(format!("{:#}", error));
                }
            }
        }
        if panicked > 0 {
            results
                .errors
                .push(format!("{} node sync(s) panicked", panicked));
        }
        Ok(())
    }
}

fn is_idle(node: &Node) -> bool {
    !node.maintenance
        && !node.provision_state.is_running()
        && node.target_power_state.is_none()
}

async fn sync_node(
    tasks: &TaskManager,
    engine: &Engine,
    opctx: &OpContext,
    node_id: Uuid,
) -> Result<NodeSync, anyhow::Error> {
    let holder = tasks.new_holder();
    let mut task = match tasks
        .acquire(
            opctx,
            node_id,
            LeaseMode::Shared,
            &holder,
            Some(Duration::ZERO),
        )
        .await
    {
        Ok(task) => task,
        Err(Error::NodeLocked { .. }) => return Ok(NodeSync::Skipped),
        Err(error) if error.is_node_not_found() => {
            return Ok(NodeSync::Skipped)
        }
        Err(error) => return Err(error).context("taking shared lease"),
    };

    let result = sync_locked(tasks, engine, &mut task).await;
    let released = task.release().await;
    let outcome = result?;
    released.context("releasing lease")?;
    Ok(outcome)
}

async fn sync_locked(
    tasks: &TaskManager,
    engine: &Engine,
    task: &mut Task,
) -> Result<NodeSync, anyhow::Error> {
    if !is_idle(task.node()) {
        return Ok(NodeSync::Skipped);
    }

    let driver = Arc::clone(task.driver());
    let observed = driver
        .power()
        .get_power_state(task)
        .await
        .context("reading power state")?;
    let recorded = task.node().power_state;
    if recorded == Some(observed) {
        return Ok(NodeSync::Unchanged);
    }

    tasks.upgrade(task).await.context("upgrading lease")?;
    // The upgrade reloaded the node: somebody may have started working on
    // it while we held only a shared lease.
    if !is_idle(task.node()) {
        return Ok(NodeSync::Skipped);
    }
    engine
        .process_event(task, Event::PowerSync { observed })
        .await
        .context("recording power state")?;
    info!(
        task.log(),
        "power state changed outside of the conductor";
        "recorded" => recorded.map(|s| s.to_string()),
        "observed" => %observed,
    );
    Ok(NodeSync::Updated)
}

impl BackgroundTask for PowerStateSync {
    fn activate<'a>(
        &'a self,
        opctx: &'a OpContext,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            let mut results = ActivationResults::default();
            if let Err(error) = self.sync_all(opctx, &mut results).await {
                error!(
                    opctx.log,
                    "power state sync activation failed";
                    "error" => format!("{:#}", error),
                );
                results.errors.push(format!("{:#}", error));
            }
            debug!(
                opctx.log,
                "power state sync done";
                "nodes_checked" => results.nodes_checked,
                "updated" => results.updated,
            );
            serde_json::to_value(&results).unwrap_or_else(|error| {
                serde_json::json!({
                    "error": format!("failed to serialize results: {}", error)
                })
            })
        }
        .boxed()
    }
}
