// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Choosing and ordering deploy and clean steps

use crate::app::drivers::Driver;
use conductor_common::api::external::Error;
use conductor_types::step::StepKind;
use conductor_types::step::StepRecord;
use conductor_types::step::StepRequest;
use std::cmp::Reverse;

/// Orders steps by descending priority
///
/// The sort is stable: steps of equal priority keep the order in which the
/// driver declared them.
fn order(mut steps: Vec<StepRecord>) -> Vec<StepRecord> {
    steps.sort_by_key(|step| Reverse(step.priority));
    steps
}

/// Returns the steps of an automated pass, in execution order
///
/// Steps with a priority of zero or less are disabled for automated passes;
/// they can only be requested explicitly in a manual clean.
pub fn automated_steps(driver: &Driver, kind: StepKind) -> Vec<StepRecord> {
    order(
        driver
            .steps(kind)
            .filter(|step| step.priority > 0)
            .map(|step| step.to_record())
            .collect(),
    )
}

/// Returns every step the driver offers for `kind`, in the order an automated
/// pass would consider them
pub fn all_steps(driver: &Driver, kind: StepKind) -> Vec<StepRecord> {
    order(driver.steps(kind).map(|step| step.to_record()).collect())
}

/// Resolves a caller's manual clean request against the driver's clean steps
///
/// Manual steps run in exactly the order requested, regardless of priority.
pub fn manual_clean_steps(
    driver: &Driver,
    requests: &[StepRequest],
) -> Result<Vec<StepRecord>, Error> {
    if requests.is_empty() {
        return Err(Error::invalid_value(
            "clean_steps",
            "at least one clean step is required",
        ));
    }

    requests
        .iter()
        .map(|request| {
            let step = driver
                .find_step(StepKind::Clean, request.interface, &request.step)
                .ok_or_else(|| {
                    Error::invalid_value(
                        "clean_steps",
                        &format!(
                            "driver \"{}\" has no clean step \"{}.{}\"",
                            driver.name(),
                            request.interface,
                            request.step
                        ),
                    )
                })?;
            let mut record = step.to_record();
            record.args = request.args.clone();
            Ok(record)
        })
        .collect()
}
