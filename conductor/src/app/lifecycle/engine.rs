// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives a node through the state machine
//!
//! The [`Engine`] feeds an event to [`machine::transition()`], saves the new
//! state, and then makes the driver calls the transition asked for.  A driver
//! call usually produces the next event (a step finishing, or failing), which
//! is processed in turn until the node settles in a state that waits on
//! somebody else: a stable state, a failure state, or a WAIT state whose
//! asynchronous step reports back through the step-continuation callback.

use super::machine;
use super::machine::Directive;
use super::machine::Event;
use super::machine::Provision;
use super::machine::Transition;
use super::steps;
use crate::app::drivers::Driver;
use crate::app::drivers::DriverError;
use crate::app::drivers::StepOutcome;
use crate::app::task::Task;
use conductor_common::api::external::Error;
use conductor_types::node::Node;
use conductor_types::node::ProvisionState;
use conductor_types::step::StepKind;
use conductor_types::step::StepRecord;
use std::sync::Arc;

pub struct Engine {
    automated_clean: bool,
}

impl Engine {
    pub fn new(automated_clean: bool) -> Engine {
        Engine { automated_clean }
    }

    pub fn automated_clean(&self) -> bool {
        self.automated_clean
    }

    /// Checks whether `event` is allowed for `node` without changing anything
    pub fn check(&self, node: &Node, event: &Event) -> Result<(), Error> {
        machine::transition(Provision::of(node), event)?;
        Ok(())
    }

    /// Processes `event` and every event that follows from it
    ///
    /// Returns the provisioning state the node settled in.  Driver failures
    /// become failure events and end up recorded on the node; only errors
    /// from the store (and events the node's state does not allow) are
    /// returned.
    pub async fn process_event(
        &self,
        task: &mut Task,
        event: Event,
    ) -> Result<ProvisionState, Error> {
        task.require_exclusive()?;

        let mut next = Some(event);
        while let Some(event) = next.take() {
            let transition =
                machine::transition(Provision::of(task.node()), &event)?;
            debug!(
                task.log(),
                "exiting state";
                "state" => %transition.from,
                "event" => transition.event,
            );
            transition.apply(task.node_mut());
            task.save().await?;
            debug!(
                task.log(),
                "entering state";
                "state" => %transition.to,
                "target" => ?transition.target,
                "event" => transition.event,
            );

            next = self.run_driver_calls(task, &transition).await?;
        }
        Ok(task.node().provision_state)
    }

    async fn run_driver_calls(
        &self,
        task: &mut Task,
        transition: &Transition,
    ) -> Result<Option<Event>, Error> {
        let driver = Arc::clone(task.driver());
        for directive in transition.driver_calls() {
            let error = match self
                .call_driver(&driver, task, transition, directive)
                .await
            {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) => continue,
                Err(DriverError::Store(error)) => return Err(error),
                Err(error) => error,
            };

            let step = match directive {
                Directive::ExecuteStep { index, .. } => task
                    .node()
                    .step_progress
                    .as_ref()
                    .and_then(|p| p.steps.get(*index))
                    .cloned(),
                _ => None,
            };
            // Once the node is headed for a failure state, cleanup is best
            // effort.
            if transition.to.is_failed() {
                warn!(
                    task.log(),
                    "driver cleanup failed";
                    "operation" => ?directive,
                    "error" => %error,
                );
                continue;
            }

            error!(
                task.log(),
                "driver operation failed";
                "operation" => ?directive,
                "step" => step.as_ref().map(|s| s.to_string()),
                "error" => %error,
            );
            match failure_event(directive, step.as_ref(), &error) {
                Some(event) => return Ok(Some(event)),
                None => return Err(error.into()),
            }
        }
        Ok(None)
    }

    /// Makes one driver call, returning the event that follows from its
    /// success (if any)
    async fn call_driver(
        &self,
        driver: &Driver,
        task: &mut Task,
        transition: &Transition,
        directive: &Directive,
    ) -> Result<Option<Event>, DriverError> {
        match directive {
            Directive::Verify => {
                driver.power().validate(task).await?;
                driver.deploy().validate(task).await?;
                Ok(Some(Event::VerifyDone))
            }
            Directive::PrepareDeploy => {
                driver.deploy().prepare(task).await?;
                Ok(None)
            }
            Directive::PrepareCleaning => {
                driver.deploy().prepare_cleaning(task).await?;
                Ok(None)
            }
            Directive::ExecuteStep { kind, index } => {
                self.execute_step(driver, task, *kind, *index).await
            }
            Directive::TearDown => {
                driver.deploy().tear_down(task).await?;
                Ok(Some(Event::DeleteDone {
                    automated_clean: self.automated_clean,
                    steps: steps::automated_steps(driver, StepKind::Clean),
                }))
            }
            Directive::TearDownCleaning => {
                driver.deploy().tear_down_cleaning(task).await?;
                if transition.to == ProvisionState::Cleaning {
                    Ok(Some(Event::CleanDone))
                } else {
                    Ok(None)
                }
            }
            Directive::CleanUp => {
                driver.deploy().clean_up(task).await?;
                Ok(None)
            }
            Directive::InspectHardware => {
                driver.inspect()?.inspect_hardware(task).await?;
                Ok(Some(Event::InspectDone))
            }
            Directive::Rescue => match driver.rescue()?.rescue(task).await? {
                StepOutcome::Done => Ok(Some(Event::RescueDone)),
                StepOutcome::Wait => Ok(Some(Event::RescueWait)),
            },
            Directive::CleanUpRescue => {
                driver.rescue()?.clean_up(task).await?;
                Ok(None)
            }
            Directive::StartSteps { .. }
            | Directive::SetCurrentStep { .. }
            | Directive::RecordPowerState { .. }
            | Directive::RecordLastError { .. }
            | Directive::RecordStepFailure { .. }
            | Directive::ClearLastError
            | Directive::SetMaintenance { .. }
            | Directive::ClearStepProgress
            | Directive::ClearInstance
            | Directive::ClearRescuePassword => Ok(None),
        }
    }

    async fn execute_step(
        &self,
        driver: &Driver,
        task: &mut Task,
        kind: StepKind,
        index: usize,
    ) -> Result<Option<Event>, DriverError> {
        let step = task
            .node()
            .step_progress
            .as_ref()
            .filter(|progress| progress.kind == kind)
            .and_then(|progress| progress.steps.get(index))
            .cloned();
        let Some(step) = step else {
            return Ok(Some(Event::StepsComplete { kind }));
        };

        info!(
            task.log(),
            "executing step";
            "kind" => %kind,
            "step" => %step,
            "index" => index,
        );
        match driver.execute_step(task, &step).await? {
            StepOutcome::Done => Ok(Some(Event::StepDone { kind, index })),
            StepOutcome::Wait => {
                debug!(task.log(), "step continues asynchronously";
                    "step" => %step);
                Ok(Some(Event::StepWait { kind, index }))
            }
        }
    }
}

/// Returns the event that records the failure of a driver call
fn failure_event(
    directive: &Directive,
    step: Option<&StepRecord>,
    error: &DriverError,
) -> Option<Event> {
    let error = error.to_string();
    match directive {
        Directive::Verify => Some(Event::VerifyFail { error }),
        Directive::PrepareDeploy => Some(Event::StepFail {
            kind: StepKind::Deploy,
            step: None,
            error: format!("failed to prepare for deployment: {}", error),
        }),
        Directive::PrepareCleaning | Directive::TearDownCleaning => {
            Some(Event::StepFail { kind: StepKind::Clean, step: None, error })
        }
        Directive::ExecuteStep { kind, .. } => Some(Event::StepFail {
            kind: *kind,
            step: step.map(|s| s.name.clone()),
            error: match step {
                Some(step) => format!("step {} failed: {}", step, error),
                None => error,
            },
        }),
        Directive::TearDown => Some(Event::DeleteFail { error }),
        Directive::InspectHardware => Some(Event::InspectFail { error }),
        Directive::Rescue => Some(Event::RescueFail { error }),
        _ => None,
    }
}
