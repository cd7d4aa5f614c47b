// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deploy and clean steps, and the persisted position of a step-driven pass

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// The capability interfaces a driver may provide
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    Power,
    Deploy,
    Management,
    Console,
    Rescue,
    Inspect,
    Vendor,
}

impl InterfaceType {
    pub const ALL: [InterfaceType; 7] = [
        InterfaceType::Power,
        InterfaceType::Deploy,
        InterfaceType::Management,
        InterfaceType::Console,
        InterfaceType::Rescue,
        InterfaceType::Inspect,
        InterfaceType::Vendor,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            InterfaceType::Power => "power",
            InterfaceType::Deploy => "deploy",
            InterfaceType::Management => "management",
            InterfaceType::Console => "console",
            InterfaceType::Rescue => "rescue",
            InterfaceType::Inspect => "inspect",
            InterfaceType::Vendor => "vendor",
        }
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which kind of lifecycle pass a step belongs to
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Deploy,
    Clean,
    /// the single implicit step of a rescue
    Rescue,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Deploy => write!(f, "deploy"),
            StepKind::Clean => write!(f, "clean"),
            StepKind::Rescue => write!(f, "rescue"),
        }
    }
}

/// A step as scheduled for one pass
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub interface: InterfaceType,
    pub priority: i32,
    /// whether the step is declared to finish through a completion callback
    pub asynchronous: bool,
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
}

impl fmt::Display for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.interface, self.name)
    }
}

/// Position of a deploy or clean pass, persisted on the node
///
/// The step queue is never kept only in memory across a lease release: a
/// worker that resumes the pass rebuilds its queue from this record.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct StepProgress {
    pub kind: StepKind,
    /// steps in execution order
    pub steps: Vec<StepRecord>,
    /// index of the step being executed (or waited on)
    pub current: usize,
    /// the step that failed, if the pass failed
    pub failed_step: Option<String>,
}

impl StepProgress {
    pub fn new(kind: StepKind, steps: Vec<StepRecord>) -> StepProgress {
        StepProgress { kind, steps, current: 0, failed_step: None }
    }

    pub fn current_step(&self) -> Option<&StepRecord> {
        self.steps.get(self.current)
    }

    /// Number of steps after `index`
    pub fn remaining_after(&self, index: usize) -> usize {
        self.steps.len().saturating_sub(index + 1)
    }
}

/// How an asynchronous step ended
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepCompletionOutcome {
    Success,
    Failure { error: String },
}

/// The step-continuation callback: reports that the step at `step_index` of a
/// node's current pass has finished
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct StepCompletion {
    pub node_id: Uuid,
    pub kind: StepKind,
    pub step_index: usize,
    pub outcome: StepCompletionOutcome,
}

/// A caller's request to run a particular step in a manual clean
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct StepRequest {
    pub interface: InterfaceType,
    pub step: String,
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
}
