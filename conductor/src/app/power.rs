// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Power management of nodes

use super::finish;
use super::task::Task;
use super::worker_pool::OperationHandle;
use super::Conductor;
use conductor_common::api::external::Error;
use conductor_common::api::external::LookupResult;
use conductor_db_queries::context::OpContext;
use conductor_types::node::PowerAction;
use conductor_types::node::PowerState;
use conductor_types::reservation::LeaseMode;
use std::sync::Arc;
use uuid::Uuid;

impl Conductor {
    /// Asks the node's power capability for its actual power state
    ///
    /// Nothing is recorded; see the power state sync background task for
    /// that.
    pub async fn get_node_power_state(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LookupResult<PowerState> {
        let task = self.lease(opctx, node_id, LeaseMode::Shared).await?;
        let driver = Arc::clone(task.driver());
        let result = driver.power().get_power_state(&task).await;
        finish(task, result.map_err(Error::from)).await
    }

    /// Starts changing the node's power state
    ///
    /// The change runs on a worker.  While it is in progress the node's
    /// target power state is set.
    pub async fn change_node_power_state(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        action: PowerAction,
    ) -> Result<OperationHandle<PowerState>, Error> {
        let (permit, task) = self.lease_for_operation(opctx, node_id).await?;
        if task.node().provision_state.is_running() {
            let state = task.node().provision_state;
            return finish(
                task,
                Err(Error::invalid_request(&format!(
                    "cannot change power state of node in state \"{}\"",
                    state
                ))),
            )
            .await;
        }

        info!(task.log(), "changing power state"; "action" => %action);
        Ok(self.workers.spawn(permit, async move {
            let mut task = task;
            let result = change_power_state(&mut task, action).await;
            finish(task, result).await
        }))
    }
}

async fn change_power_state(
    task: &mut Task,
    action: PowerAction,
) -> Result<PowerState, Error> {
    let driver = Arc::clone(task.driver());
    let power = driver.power();
    let target = action.target_state();

    let current = match power.get_power_state(task).await {
        Ok(state) => state,
        Err(error) => {
            return record_power_failure(task, target, error.into()).await
        }
    };
    if current == target && action != PowerAction::Reboot {
        debug!(task.log(), "node already in requested power state";
            "power_state" => %current);
        let node = task.node_mut();
        node.power_state = Some(current);
        node.last_error = None;
        task.save().await?;
        return Ok(current);
    }

    task.node_mut().target_power_state = Some(target);
    task.save().await?;

    let result = match action {
        PowerAction::Reboot => power.reboot(task).await,
        PowerAction::PowerOn | PowerAction::PowerOff => {
            power.set_power_state(task, target).await
        }
    };
    if let Err(error) = result {
        return record_power_failure(task, target, error.into()).await;
    }

    let node = task.node_mut();
    node.power_state = Some(target);
    node.target_power_state = None;
    node.last_error = None;
    task.save().await?;
    info!(task.log(), "power state changed"; "power_state" => %target);
    Ok(target)
}

/// Records a failed power change on the node, then returns the failure
async fn record_power_failure(
    task: &mut Task,
    target: PowerState,
    error: Error,
) -> Result<PowerState, Error> {
    error!(task.log(), "failed to change power state";
        "target" => %target, "error" => %error);
    let node = task.node_mut();
    node.target_power_state = None;
    node.last_error =
        Some(format!("failed to change power state to {}: {}", target, error));
    task.save().await?;
    Err(error)
}

#[cfg(test)]
mod test {
    use crate::app::test_util::test_conductor;
    use assert_matches::assert_matches;
    use conductor_common::api::external::Error;
    use conductor_test_utils::dev;
    use conductor_types::node::PowerAction;
    use conductor_types::node::PowerState;
    use conductor_types::node::ProvisionState;
    use serde_json::json;

    #[tokio::test]
    async fn test_change_power_state() {
        let logctx = dev::test_setup_log("test_change_power_state");
        let c = test_conductor(&logctx.log, |_| ()).await;
        let node = c.create_node_in("fake", ProvisionState::Available).await;

        let state = c
            .conductor
            .change_node_power_state(&c.opctx, node.id, PowerAction::PowerOn)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(state, PowerState::PowerOn);
        assert_eq!(c.hardware.power_state(node.id), PowerState::PowerOn);
        let found = c.conductor.node_fetch(&c.opctx, node.id).await.unwrap();
        assert_eq!(found.power_state, Some(PowerState::PowerOn));
        assert_eq!(found.target_power_state, None);
        assert_eq!(found.reservation, None);

        // Powering off a node that was turned off behind our back only
        // records the state.
        c.hardware.set_power_state(node.id, PowerState::PowerOff);
        let state = c
            .conductor
            .change_node_power_state(&c.opctx, node.id, PowerAction::PowerOff)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(state, PowerState::PowerOff);
        assert_eq!(
            c.conductor
                .get_node_power_state(&c.opctx, node.id)
                .await
                .unwrap(),
            PowerState::PowerOff
        );

        let state = c
            .conductor
            .change_node_power_state(&c.opctx, node.id, PowerAction::Reboot)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(state, PowerState::PowerOn);

        c.conductor.shutdown().await.unwrap();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_power_failure_recorded() {
        let logctx = dev::test_setup_log("test_power_failure_recorded");
        let c = test_conductor(&logctx.log, |_| ()).await;
        let node = c
            .create_node_with(
                "fake",
                ProvisionState::Available,
                [(String::from("fake_power_fail"), json!(true))],
            )
            .await;

        let error = c
            .conductor
            .change_node_power_state(&c.opctx, node.id, PowerAction::PowerOn)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_matches!(error, Error::InternalError { .. });

        let found = c.conductor.node_fetch(&c.opctx, node.id).await.unwrap();
        assert_eq!(found.target_power_state, None);
        assert!(found
            .last_error
            .as_deref()
            .unwrap()
            .starts_with("failed to change power state to power on"));
        assert_eq!(found.reservation, None);

        c.conductor.shutdown().await.unwrap();
        logctx.cleanup_successful();
    }
}
