// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The "fake-async" driver
//!
//! This is the fake driver with asynchronous deploy, clean, and rescue steps.
//! An asynchronous step returns right away; its completion is delivered
//! through the step-continuation callback after the node's lease has been
//! released, the way an agent running on the node would report back.

use super::fake::FakeConsole;
use super::fake::FakeDeploy;
use super::fake::FakeHardware;
use super::fake::FakeInspect;
use super::fake::FakeManagement;
use super::fake::FakePower;
use super::fake::FakeRescue;
use super::fake::FakeVendor;
use super::interfaces::DriverError;
use super::registry::Driver;
use super::registry::DriverBuilder;
use super::registry::DriverLoadError;
use crate::app::task::Task;
use conductor_types::step::StepCompletion;
use conductor_types::step::StepCompletionOutcome;
use conductor_types::step::StepKind;
use std::time::Duration;

/// `driver_info` key: delay before a completion is reported, in milliseconds
const FAKE_CALLBACK_DELAY_MS: &str = "fake_callback_delay_ms";
/// `driver_info` key: never report completions (so that callbacks time out)
const FAKE_NO_CALLBACK: &str = "fake_no_callback";

const DEFAULT_CALLBACK_DELAY: Duration = Duration::from_millis(10);

/// Arranges for `outcome` to be reported for step `step_index` of the node's
/// current `kind` pass, once the task's lease has been released
pub(super) fn schedule_completion(
    task: &Task,
    kind: StepKind,
    step_index: usize,
    outcome: StepCompletionOutcome,
) -> Result<(), DriverError> {
    let node = task.node();
    if node
        .driver_info
        .get(FAKE_NO_CALLBACK)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        debug!(task.log(), "fake-async: not reporting step completion");
        return Ok(());
    }

    let delay = match node.driver_info.get(FAKE_CALLBACK_DELAY_MS) {
        None => DEFAULT_CALLBACK_DELAY,
        Some(value) => value.as_u64().map(Duration::from_millis).ok_or_else(
            || {
                DriverError::invalid_value(
                    FAKE_CALLBACK_DELAY_MS,
                    "expected a non-negative integer",
                )
            },
        )?,
    };

    let completion =
        StepCompletion { node_id: node.id, kind, step_index, outcome };
    let completions = task.step_completions();
    let log = task.log().clone();
    task.spawn_after_release(async move {
        tokio::time::sleep(delay).await;
        debug!(
            log,
            "fake-async: reporting step completion";
            "kind" => %completion.kind,
            "step_index" => completion.step_index,
        );
        if completions.send(completion).is_err() {
            warn!(log, "fake-async: conductor no longer accepts completions");
        }
    });
    Ok(())
}

/// Assembles the asynchronous fake driver
pub fn driver(
    name: &str,
    hardware: FakeHardware,
) -> Result<Driver, DriverLoadError> {
    DriverBuilder::new(name)
        .power(FakePower::new(hardware.clone()))
        .deploy(FakeDeploy::new(true))
        .management(FakeManagement::new(hardware))
        .console(FakeConsole)
        .rescue(FakeRescue::new(true))
        .inspect(FakeInspect)
        .vendor(FakeVendor)
        .build()
}
