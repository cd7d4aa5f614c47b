// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task that fails nodes whose asynchronous steps never reported
//! back
//!
//! A node in DEPLOYWAIT, CLEANWAIT, or RESCUEWAIT is waiting on a completion
//! callback.  If none arrives within the configured timeout (measured from
//! the last change of provisioning state), the operation is aborted and the
//! node moves to the matching failure state.  A timeout of zero disables the
//! check for that kind of wait.

use crate::app::background::BackgroundTask;
use crate::app::lifecycle::Engine;
use crate::app::lifecycle::Event;
use crate::app::task::Task;
use crate::app::task_manager::TaskManager;
use anyhow::Context;
use chrono::DateTime;
use chrono::Utc;
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
use uuid::Uuid;

const TIMEOUT_ERROR: &str = "timeout reached while waiting for callback";

/// Callback timeouts for each wait state
#[derive(Clone, Copy, Debug)]
pub struct CallbackTimeouts {
    pub deploy: Duration,
    pub clean: Duration,
    pub rescue: Duration,
}

impl CallbackTimeouts {
    fn for_state(&self, state: ProvisionState) -> Option<Duration> {
        let timeout = match state {
            ProvisionState::DeployWait => self.deploy,
            ProvisionState::CleanWait => self.clean,
            ProvisionState::RescueWait => self.rescue,
            _ => return None,
        };
        (!timeout.is_zero()).then_some(timeout)
    }

    /// Returns whether `node` has waited on its callback for too long
    fn expired(&self, node: &Node, now: DateTime<Utc>) -> bool {
        let Some(timeout) = self.for_state(node.provision_state) else {
            return false;
        };
        // A clock that went backwards counts as no time waited.
        let waited =
            (now - node.provision_updated_at).to_std().unwrap_or_default();
        waited > timeout
    }
}

pub struct AsyncStepTimeouts {
    datastore: Arc<DataStore>,
    tasks: Arc<TaskManager>,
    engine: Arc<Engine>,
    timeouts: CallbackTimeouts,
}

#[derive(Debug, Default, Serialize)]
struct ActivationResults {
    waiting: usize,
    expired: usize,
    aborted: usize,
    errors: Vec<String>,
}

impl AsyncStepTimeouts {
    pub fn new(
        datastore: Arc<DataStore>,
        tasks: Arc<TaskManager>,
        engine: Arc<Engine>,
        timeouts: CallbackTimeouts,
    ) -> AsyncStepTimeouts {
        AsyncStepTimeouts { datastore, tasks, engine, timeouts }
    }

    async fn check_all(
        &self,
        opctx: &OpContext,
        results: &mut ActivationResults,
    ) -> Result<(), anyhow::Error> {
        let states: Vec<_> = [
            ProvisionState::DeployWait,
            ProvisionState::CleanWait,
            ProvisionState::RescueWait,
        ]
        .into_iter()
        .filter(|s| self.timeouts.for_state(*s).is_some())
        .collect();
        if states.is_empty() {
            return Ok(());
        }

        let waiting = self
            .datastore
            .node_list(opctx, &NodeFilter::in_states(&states))
            .await
            .context("failed to list waiting nodes")?;
        results.waiting = waiting.len();

        let now = Utc::now();
        for node in waiting.iter().filter(|n| self.timeouts.expired(n, now)) {
            results.expired += 1;
            match self.abort_expired(opctx, node.id).await {
                Ok(true) => results.aborted += 1,
                Ok(false) => (),
                Err(error) => {
                    warn!(
                        opctx.log,
                        "failed to abort timed-out node";
                        "node_id" => %node.id,
                        "error" => format!("{:#}", error),
                    );
                    results.errors.push(format!("{:#}", error));
                }
            }
        }
        Ok(())
    }

    /// Aborts the operation of a node whose callback timed out
    ///
    /// Returns `false` if the node was busy, or if its callback arrived after
    /// it was listed.
    async fn abort_expired(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> Result<bool, anyhow::Error> {
        let Some(mut task) = self.try_lock(opctx, node_id).await? else {
            return Ok(false);
        };
        if !self.timeouts.expired(task.node(), Utc::now()) {
            task.release().await?;
            return Ok(false);
        }

        let from = task.node().provision_state;
        let result = self
            .engine
            .process_event(
                &mut task,
                Event::Abort { error: String::from(TIMEOUT_ERROR) },
            )
            .await;
        task.release().await?;
        let state = result
            .with_context(|| format!("aborting timed-out node {}", node_id))?;
        warn!(
            opctx.log,
            "callback timed out";
            "node_id" => %node_id,
            "from" => %from,
            "to" => %state,
        );
        Ok(true)
    }

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

impl BackgroundTask for AsyncStepTimeouts {
    fn activate<'a>(
        &'a self,
        opctx: &'a OpContext,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            let mut results = ActivationResults::default();
            if let Err(error) = self.check_all(opctx, &mut results).await {
                error!(
                    opctx.log,
                    "callback timeout check failed";
                    "error" => format!("{:#}", error),
                );
                results.errors.push(format!("{:#}", error));
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::app::test_util::TestHarness;
    use conductor_test_utils::dev;

    #[tokio::test]
    async fn test_callback_timeouts() {
        let logctx = dev::test_setup_log("test_callback_timeouts");
        let h = TestHarness::new(&logctx.log, |_| ()).await;
        let task = AsyncStepTimeouts::new(
            Arc::clone(&h.datastore),
            Arc::clone(&h.tasks),
            Arc::new(Engine::new(false)),
            CallbackTimeouts {
                deploy: Duration::from_millis(50),
                clean: Duration::ZERO,
                rescue: Duration::from_secs(3600),
            },
        );

        let deploying = h
            .create_node_in(
                "fake-async",
                ProvisionState::DeployWait,
                std::iter::empty(),
            )
            .await;
        // A zero timeout never expires.
        let cleaning = h
            .create_node_in(
                "fake-async",
                ProvisionState::CleanWait,
                std::iter::empty(),
            )
            .await;
        let rescuing = h
            .create_node_in(
                "fake-async",
                ProvisionState::RescueWait,
                std::iter::empty(),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = task.activate(&h.opctx).await;
        assert_eq!(result["waiting"], 2);
        assert_eq!(result["expired"], 1);
        assert_eq!(result["aborted"], 1);

        let found =
            h.datastore.node_fetch(&h.opctx, deploying.id).await.unwrap();
        assert_eq!(found.provision_state, ProvisionState::DeployFail);
        assert_eq!(found.last_error.as_deref(), Some(TIMEOUT_ERROR));
        assert_eq!(found.reservation, None);

        let found =
            h.datastore.node_fetch(&h.opctx, cleaning.id).await.unwrap();
        assert_eq!(found.provision_state, ProvisionState::CleanWait);
        let found =
            h.datastore.node_fetch(&h.opctx, rescuing.id).await.unwrap();
        assert_eq!(found.provision_state, ProvisionState::RescueWait);

        logctx.cleanup_successful();
    }
}
