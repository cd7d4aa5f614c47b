// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operations that move nodes through the provisioning state machine
//!
//! Each operation takes a worker and an exclusive lease, checks that the
//! node's state allows the event, and hands the rest of the work to the
//! worker pool.  The caller gets an [`OperationHandle`] back as soon as the
//! operation has started.

use super::finish;
use super::lifecycle::steps;
use super::lifecycle::Engine;
use super::lifecycle::Event;
use super::task::Task;
use super::worker_pool::OperationHandle;
use super::worker_pool::WorkerPermit;
use super::Conductor;
use conductor_common::api::external::Error;
use conductor_common::api::external::ListResultVec;
use conductor_db_queries::context::OpContext;
use conductor_types::node::Node;
use conductor_types::node::ProvisionState;
use conductor_types::node::RESCUE_PASSWORD;
use conductor_types::reservation::LeaseMode;
use conductor_types::step::StepCompletion;
use conductor_types::step::StepCompletionOutcome;
use conductor_types::step::StepKind;
use conductor_types::step::StepRecord;
use conductor_types::step::StepRequest;
use std::sync::Arc;
use uuid::Uuid;

type LifecycleResult = Result<OperationHandle<ProvisionState>, Error>;

impl Conductor {
    /// Verifies an ENROLLED node, or returns a node to MANAGEABLE
    pub async fn manage(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LifecycleResult {
        self.start_lifecycle(opctx, node_id, |_, _| Ok(Event::Manage)).await
    }

    /// Makes a MANAGEABLE node available, cleaning it first when automated
    /// cleaning is enabled
    pub async fn provide(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LifecycleResult {
        self.start_lifecycle(opctx, node_id, |task, engine| {
            Ok(Event::Provide {
                automated_clean: engine.automated_clean(),
                steps: steps::automated_steps(task.driver(), StepKind::Clean),
            })
        })
        .await
    }

    pub async fn inspect(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LifecycleResult {
        self.start_lifecycle(opctx, node_id, |task, _| {
            task.driver().inspect()?;
            Ok(Event::InspectStart)
        })
        .await
    }

    pub async fn deploy(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LifecycleResult {
        self.start_lifecycle(opctx, node_id, |task, _| {
            Ok(Event::DeployStart {
                steps: steps::automated_steps(task.driver(), StepKind::Deploy),
            })
        })
        .await
    }

    /// Deploys an ACTIVE (or failed) node again
    pub async fn rebuild(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LifecycleResult {
        self.start_lifecycle(opctx, node_id, |task, _| {
            Ok(Event::Rebuild {
                steps: steps::automated_steps(task.driver(), StepKind::Deploy),
            })
        })
        .await
    }

    /// Tears down a node's deployment
    pub async fn tear_down(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LifecycleResult {
        self.start_lifecycle(opctx, node_id, |_, _| Ok(Event::Delete)).await
    }

    /// Runs the requested clean steps, in the order given, on a MANAGEABLE
    /// node
    ///
    /// Unlike automated cleaning, steps with a priority of zero or less may
    /// be requested.
    pub async fn clean(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        requests: Vec<StepRequest>,
    ) -> LifecycleResult {
        self.start_lifecycle(opctx, node_id, move |task, _| {
            Ok(Event::CleanStart {
                steps: steps::manual_clean_steps(task.driver(), &requests)?,
            })
        })
        .await
    }

    /// Boots an ACTIVE node into its rescue environment
    pub async fn rescue(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        password: String,
    ) -> LifecycleResult {
        if password.is_empty() {
            return Err(Error::invalid_value(
                RESCUE_PASSWORD,
                "a rescue password is required",
            ));
        }
        self.start_lifecycle(opctx, node_id, move |task, _| {
            task.driver().rescue()?;
            task.node_mut()
                .instance_info
                .insert(String::from(RESCUE_PASSWORD), password.into());
            Ok(Event::RescueStart)
        })
        .await
    }

    /// Returns a rescued node to ACTIVE
    pub async fn unrescue(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LifecycleResult {
        let (permit, task, event) = self
            .begin(opctx, node_id, |task, _| {
                task.driver().rescue()?;
                Ok(Event::Unrescue)
            })
            .await?;
        let engine = Arc::clone(&self.engine);
        Ok(self.workers.spawn(permit, async move {
            let mut task = task;
            let result = unrescue(&engine, &mut task, event).await;
            finish(task, result).await
        }))
    }

    /// Lists every clean step the node's driver offers, including those only
    /// available to manual cleaning
    pub async fn get_clean_steps(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> ListResultVec<StepRecord> {
        let task = self.lease(opctx, node_id, LeaseMode::Shared).await?;
        let steps = steps::all_steps(task.driver(), StepKind::Clean);
        finish(task, Ok(steps)).await
    }

    /// Delivers the outcome of an asynchronous step
    ///
    /// Returns the state the node settled in, or `None` if the completion
    /// does not match what the node is waiting for.  Such completions are
    /// stale or duplicates and change nothing.
    pub async fn continue_node_step(
        &self,
        opctx: &OpContext,
        completion: StepCompletion,
    ) -> Result<Option<ProvisionState>, Error> {
        let (permit, task) =
            self.lease_for_operation(opctx, completion.node_id).await?;
        let Some(event) = completion_event(task.node(), &completion) else {
            debug!(
                task.log(),
                "ignoring step completion";
                "provision_state" => %task.node().provision_state,
                "kind" => %completion.kind,
                "step_index" => completion.step_index,
            );
            return finish(task, Ok(None)).await;
        };

        info!(task.log(), "continuing after asynchronous step";
            "event" => event.name());
        let engine = Arc::clone(&self.engine);
        self.workers
            .spawn(permit, async move {
                let mut task = task;
                let result = engine.process_event(&mut task, event).await;
                finish(task, result).await
            })
            .wait()
            .await
            .map(Some)
    }

    async fn start_lifecycle<F>(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        prepare: F,
    ) -> LifecycleResult
    where
        F: FnOnce(&mut Task, &Engine) -> Result<Event, Error>,
    {
        let (permit, task, event) = self.begin(opctx, node_id, prepare).await?;
        let engine = Arc::clone(&self.engine);
        Ok(self.workers.spawn(permit, async move {
            let mut task = task;
            let result = engine.process_event(&mut task, event).await;
            finish(task, result).await
        }))
    }

    /// Takes a worker and an exclusive lease, and builds the event that
    /// starts the operation
    ///
    /// Nothing has been saved when this returns: a refused request leaves
    /// the node as it was.
    async fn begin<F>(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        prepare: F,
    ) -> Result<(WorkerPermit, Task, Event), Error>
    where
        F: FnOnce(&mut Task, &Engine) -> Result<Event, Error>,
    {
        let (permit, mut task) = self.lease_for_operation(opctx, node_id).await?;
        match starting_event(&mut task, &self.engine, prepare) {
            Ok(event) => {
                info!(task.log(), "starting operation";
                    "event" => event.name(),
                    "provision_state" => %task.node().provision_state);
                Ok((permit, task, event))
            }
            Err(error) => finish(task, Err(error)).await,
        }
    }
}

fn starting_event<F>(
    task: &mut Task,
    engine: &Engine,
    prepare: F,
) -> Result<Event, Error>
where
    F: FnOnce(&mut Task, &Engine) -> Result<Event, Error>,
{
    let event = prepare(task, engine)?;
    // Manage is how a node that failed (and was put into maintenance) gets
    // back to a stable state.
    if task.node().maintenance && event != Event::Manage {
        return Err(Error::invalid_request(&format!(
            "node is in maintenance: {}",
            task.node().maintenance_reason.as_deref().unwrap_or("no reason")
        )));
    }
    engine.check(task.node(), &event)?;
    Ok(event)
}

async fn unrescue(
    engine: &Engine,
    task: &mut Task,
    event: Event,
) -> Result<ProvisionState, Error> {
    let driver = Arc::clone(task.driver());
    driver.rescue()?.unrescue(task).await?;
    engine.process_event(task, event).await
}

/// Returns the event a step completion should produce, or `None` if the node
/// is not waiting on that step
fn completion_event(node: &Node, completion: &StepCompletion) -> Option<Event> {
    let state = node.provision_state;
    let index = completion.step_index;
    if completion.kind == StepKind::Rescue {
        if state != ProvisionState::RescueWait || index != 0 {
            return None;
        }
        return Some(match &completion.outcome {
            StepCompletionOutcome::Success => Event::RescueDone,
            StepCompletionOutcome::Failure { error } => {
                Event::RescueFail { error: error.clone() }
            }
        });
    }

    let waiting = match completion.kind {
        StepKind::Deploy => ProvisionState::DeployWait,
        StepKind::Clean => ProvisionState::CleanWait,
        StepKind::Rescue => return None,
    };
    if state != waiting {
        return None;
    }
    let progress = node
        .step_progress
        .as_ref()
        .filter(|p| p.kind == completion.kind && p.current == index)?;
    Some(match &completion.outcome {
        StepCompletionOutcome::Success => {
            Event::StepResume { kind: completion.kind, index }
        }
        StepCompletionOutcome::Failure { error } => Event::StepFail {
            kind: completion.kind,
            step: progress.steps.get(index).map(|s| s.name.clone()),
            error: error.clone(),
        },
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::app::test_util::test_conductor;
    use crate::app::test_util::TestConductor;
    use assert_matches::assert_matches;
    use conductor_test_utils::dev;
    use conductor_test_utils::dev::poll::wait_for_condition;
    use conductor_test_utils::dev::poll::CondCheckError;
    use conductor_types::node::NodeCreate;
    use conductor_types::step::InterfaceType;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn settle(handle: LifecycleResult) -> ProvisionState {
        handle.unwrap().wait().await.unwrap()
    }

    fn names(steps: &[StepRecord]) -> Vec<&str> {
        steps.iter().map(|s| s.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let logctx = dev::test_setup_log("test_full_lifecycle");
        let c = test_conductor(&logctx.log, |_| ()).await;
        let (conductor, opctx) = (&c.conductor, &c.opctx);
        let node = conductor
            .node_enroll(
                opctx,
                NodeCreate { driver: String::from("fake"), ..Default::default() },
            )
            .await
            .unwrap();
        let id = node.id;

        assert_eq!(
            settle(conductor.manage(opctx, id).await).await,
            ProvisionState::Manageable
        );
        assert_eq!(
            settle(conductor.inspect(opctx, id).await).await,
            ProvisionState::Manageable
        );
        let found = conductor.node_fetch(opctx, id).await.unwrap();
        assert_eq!(found.properties.get("cpus"), Some(&json!(8)));

        // Automated cleaning runs on the way to AVAILABLE.
        assert_eq!(
            settle(conductor.provide(opctx, id).await).await,
            ProvisionState::Available
        );
        assert_eq!(
            settle(conductor.deploy(opctx, id).await).await,
            ProvisionState::Active
        );
        assert_eq!(
            settle(conductor.rebuild(opctx, id).await).await,
            ProvisionState::Active
        );
        assert_eq!(
            settle(conductor.tear_down(opctx, id).await).await,
            ProvisionState::Available
        );

        let found = conductor.node_fetch(opctx, id).await.unwrap();
        assert_eq!(found.target_provision_state, None);
        assert_eq!(found.step_progress, None);
        assert_eq!(found.reservation, None);
        assert_eq!(found.last_error, None);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_manual_clean() {
        let logctx = dev::test_setup_log("test_manual_clean");
        let c = test_conductor(&logctx.log, |_| ()).await;
        let node = c.create_node_in("fake", ProvisionState::Manageable).await;

        let clean_steps =
            c.conductor.get_clean_steps(&c.opctx, node.id).await.unwrap();
        assert_eq!(
            names(&clean_steps),
            ["reset_bios", "erase_disk", "zap_firmware"]
        );

        let error = c
            .conductor
            .clean(&c.opctx, node.id, vec![])
            .await
            .unwrap_err();
        assert_matches!(error, Error::InvalidValue { .. });

        // A step left out of automated cleaning can be requested.
        let state = settle(
            c.conductor
                .clean(
                    &c.opctx,
                    node.id,
                    vec![StepRequest {
                        interface: InterfaceType::Management,
                        step: String::from("zap_firmware"),
                        args: BTreeMap::new(),
                    }],
                )
                .await,
        )
        .await;
        assert_eq!(state, ProvisionState::Manageable);
        let found = c.conductor.node_fetch(&c.opctx, node.id).await.unwrap();
        assert_eq!(
            found.extra.get("fake_steps_run"),
            Some(&json!(["management.zap_firmware"]))
        );

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_refused_operations() {
        let logctx = dev::test_setup_log("test_refused_operations");
        let c = test_conductor(&logctx.log, |_| ()).await;
        let node = c.create_node_in("fake", ProvisionState::Enrolled).await;

        let error = c.conductor.deploy(&c.opctx, node.id).await.unwrap_err();
        assert_matches!(error, Error::InvalidRequest { .. });
        let found = c.conductor.node_fetch(&c.opctx, node.id).await.unwrap();
        assert_eq!(found.provision_state, ProvisionState::Enrolled);
        assert_eq!(found.reservation, None);

        let node = c.create_node_in("fake", ProvisionState::Available).await;
        c.conductor
            .node_set_maintenance(&c.opctx, node.id, true, None)
            .await
            .unwrap();
        let error = c.conductor.deploy(&c.opctx, node.id).await.unwrap_err();
        assert_matches!(error, Error::InvalidRequest { .. });

        let error = c
            .conductor
            .deploy(&c.opctx, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(error.is_node_not_found());

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_async_deploy() {
        let logctx = dev::test_setup_log("test_async_deploy");
        let c = test_conductor(&logctx.log, |_| ()).await;
        let node =
            c.create_node_in("fake-async", ProvisionState::Available).await;

        // The operation ends once the asynchronous step has been started; the
        // completion it reports later finishes the deployment.
        let state = settle(c.conductor.deploy(&c.opctx, node.id).await).await;
        assert_eq!(state, ProvisionState::DeployWait);
        let found = c.wait_for_state(node.id, ProvisionState::Active).await;
        assert_eq!(found.step_progress, None);
        assert_eq!(found.target_provision_state, None);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_async_clean_failure() {
        let logctx = dev::test_setup_log("test_async_clean_failure");
        let c = test_conductor(&logctx.log, |_| ()).await;
        let node = c
            .create_node_with(
                "fake-async",
                ProvisionState::Manageable,
                [(String::from("fake_fail_step"), json!("erase_disk"))],
            )
            .await;

        settle(c.conductor.provide(&c.opctx, node.id).await).await;
        let found = c.wait_for_state(node.id, ProvisionState::CleanFail).await;
        let progress = found.step_progress.unwrap();
        assert_eq!(progress.failed_step.as_deref(), Some("erase_disk"));
        assert!(found.last_error.unwrap().contains("erase_disk"));
        assert!(found.maintenance);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_stale_step_completion() {
        let logctx = dev::test_setup_log("test_stale_step_completion");
        let c = test_conductor(&logctx.log, |_| ()).await;
        let node = c
            .create_node_with(
                "fake-async",
                ProvisionState::Available,
                [(String::from("fake_no_callback"), json!(true))],
            )
            .await;
        let state = settle(c.conductor.deploy(&c.opctx, node.id).await).await;
        assert_eq!(state, ProvisionState::DeployWait);
        let before = c.conductor.node_fetch(&c.opctx, node.id).await.unwrap();

        let completion = |kind, step_index| StepCompletion {
            node_id: node.id,
            kind,
            step_index,
            outcome: StepCompletionOutcome::Success,
        };
        for stale in [
            completion(StepKind::Deploy, 3),
            completion(StepKind::Clean, 0),
            completion(StepKind::Rescue, 0),
        ] {
            let result =
                c.conductor.continue_node_step(&c.opctx, stale).await.unwrap();
            assert_eq!(result, None);
        }
        let after = c.conductor.node_fetch(&c.opctx, node.id).await.unwrap();
        assert_eq!(after.provision_state, ProvisionState::DeployWait);
        assert_eq!(after.step_progress, before.step_progress);
        assert_eq!(after.provision_updated_at, before.provision_updated_at);

        let result = c
            .conductor
            .continue_node_step(&c.opctx, completion(StepKind::Deploy, 0))
            .await
            .unwrap();
        assert_eq!(result, Some(ProvisionState::Active));

        // Delivering it again is a no-op.
        let result = c
            .conductor
            .continue_node_step(&c.opctx, completion(StepKind::Deploy, 0))
            .await
            .unwrap();
        assert_eq!(result, None);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_no_free_worker() {
        let logctx = dev::test_setup_log("test_no_free_worker");
        let c = test_conductor(&logctx.log, |config| {
            config.conductor.workers_pool_size = 1;
        })
        .await;
        let slow = c
            .create_node_with(
                "fake",
                ProvisionState::Available,
                [(String::from("fake_step_delay_ms"), json!(500))],
            )
            .await;
        let other = c.create_node_in("fake", ProvisionState::Available).await;

        let handle = c.conductor.deploy(&c.opctx, slow.id).await.unwrap();
        let error = c.conductor.deploy(&c.opctx, other.id).await.unwrap_err();
        assert_matches!(error, Error::NoFreeWorker);
        assert!(error.retryable());

        // The refused request left the node as it was.
        let found = c.conductor.node_fetch(&c.opctx, other.id).await.unwrap();
        assert_eq!(found.provision_state, ProvisionState::Available);
        assert_eq!(found.provision_updated_at, other.provision_updated_at);
        assert_eq!(found.reservation, None);

        assert_eq!(handle.wait().await.unwrap(), ProvisionState::Active);
        assert_eq!(
            settle(c.conductor.deploy(&c.opctx, other.id).await).await,
            ProvisionState::Active
        );

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_cancelled_operation() {
        let logctx = dev::test_setup_log("test_cancelled_operation");
        let c = test_conductor(&logctx.log, |_| ()).await;
        let node = c
            .create_node_with(
                "fake",
                ProvisionState::Available,
                [(String::from("fake_step_delay_ms"), json!(60_000))],
            )
            .await;

        let handle = c.conductor.deploy(&c.opctx, node.id).await.unwrap();
        wait_for_condition::<_, Error, _, _>(
            || async {
                let node = c.conductor.node_fetch(&c.opctx, node.id).await?;
                if node.provision_state == ProvisionState::Deploying {
                    Ok(())
                } else {
                    Err(CondCheckError::NotYet)
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(10),
        )
        .await
        .unwrap();

        handle.abort();
        let found = c.wait_for_state(node.id, ProvisionState::DeployFail).await;
        assert!(found.last_error.is_some());
        assert_eq!(found.target_provision_state, None);

        logctx.cleanup_successful();
    }

    async fn rescue_and_check(c: &TestConductor, node_id: Uuid) {
        let found = c.wait_for_state(node_id, ProvisionState::Rescued).await;
        assert_eq!(
            found.instance_info.get(RESCUE_PASSWORD),
            Some(&json!("hunter2"))
        );

        let state = settle(c.conductor.unrescue(&c.opctx, node_id).await).await;
        assert_eq!(state, ProvisionState::Active);
        let found = c.conductor.node_fetch(&c.opctx, node_id).await.unwrap();
        assert_eq!(found.instance_info.get(RESCUE_PASSWORD), None);
    }

    #[tokio::test]
    async fn test_rescue() {
        let logctx = dev::test_setup_log("test_rescue");
        let c = test_conductor(&logctx.log, |_| ()).await;
        let node = c.create_node_in("fake", ProvisionState::Active).await;

        let error = c
            .conductor
            .rescue(&c.opctx, node.id, String::new())
            .await
            .unwrap_err();
        assert_matches!(error, Error::InvalidValue { .. });

        let state = settle(
            c.conductor
                .rescue(&c.opctx, node.id, String::from("hunter2"))
                .await,
        )
        .await;
        assert_eq!(state, ProvisionState::Rescued);
        rescue_and_check(&c, node.id).await;

        // The asynchronous driver finishes rescuing through a completion.
        let node =
            c.create_node_in("fake-async", ProvisionState::Active).await;
        let state = settle(
            c.conductor
                .rescue(&c.opctx, node.id, String::from("hunter2"))
                .await,
        )
        .await;
        assert_eq!(state, ProvisionState::RescueWait);
        rescue_and_check(&c, node.id).await;

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failed_rescue_forgets_password() {
        let logctx = dev::test_setup_log("test_failed_rescue_forgets_password");
        let c = test_conductor(&logctx.log, |_| ()).await;

        for driver in ["fake", "fake-async"] {
            let node = c
                .create_node_with(
                    driver,
                    ProvisionState::Active,
                    [(String::from("fake_fail_rescue"), json!(true))],
                )
                .await;
            let handle = c
                .conductor
                .rescue(&c.opctx, node.id, String::from("hunter2"))
                .await
                .unwrap();
            handle.wait().await.unwrap();

            let found =
                c.wait_for_state(node.id, ProvisionState::RescueFail).await;
            assert_eq!(found.instance_info.get(RESCUE_PASSWORD), None);
            assert!(found.last_error.as_deref().unwrap().contains("fake failure"));
        }

        logctx.cleanup_successful();
    }
}
