// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The provisioning state machine
//!
//! [`transition()`] is a pure function of the node's provisioning state and an
//! [`Event`].  It returns the next state along with a list of [`Directive`]s:
//! changes to make to the node record and driver calls to make once the new
//! state has been saved.  Nothing in here performs I/O; the
//! [`Engine`](super::Engine) carries out the directives.

use conductor_common::api::external;
use conductor_types::node::Node;
use conductor_types::node::PowerState;
use conductor_types::node::ProvisionState;
use conductor_types::node::RESCUE_PASSWORD;
use conductor_types::step::StepKind;
use conductor_types::step::StepProgress;
use conductor_types::step::StepRecord;

/// The part of a node the state machine looks at
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Provision {
    pub state: ProvisionState,
    /// the state an in-progress operation is driving toward
    pub target: Option<ProvisionState>,
}

impl Provision {
    pub fn of(node: &Node) -> Provision {
        Provision {
            state: node.provision_state,
            target: node.target_provision_state,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// verify an enrolled node, or return a node to MANAGEABLE
    Manage,
    VerifyDone,
    VerifyFail { error: String },
    /// make a manageable node available, cleaning it first if
    /// `automated_clean` is set
    Provide { automated_clean: bool, steps: Vec<StepRecord> },
    InspectStart,
    InspectDone,
    InspectFail { error: String },
    DeployStart { steps: Vec<StepRecord> },
    Rebuild { steps: Vec<StepRecord> },
    /// start a manual clean with the caller's steps
    CleanStart { steps: Vec<StepRecord> },
    /// step `index` finished synchronously
    StepDone { kind: StepKind, index: usize },
    /// step `index` continues asynchronously
    StepWait { kind: StepKind, index: usize },
    /// asynchronous step `index` reported success
    StepResume { kind: StepKind, index: usize },
    /// there are no more steps to run
    StepsComplete { kind: StepKind },
    /// cleaning has been torn down after the last step
    CleanDone,
    StepFail { kind: StepKind, step: Option<String>, error: String },
    Delete,
    DeleteDone { automated_clean: bool, steps: Vec<StepRecord> },
    DeleteFail { error: String },
    RescueStart,
    RescueWait,
    RescueDone,
    RescueFail { error: String },
    Unrescue,
    PowerSync { observed: PowerState },
    /// give up on an in-progress operation (callback timeout, cancellation,
    /// or a worker that went away)
    Abort { error: String },
}

fn kinded(
    kind: StepKind,
    deploy: &'static str,
    clean: &'static str,
    rescue: &'static str,
) -> &'static str {
    match kind {
        StepKind::Deploy => deploy,
        StepKind::Clean => clean,
        StepKind::Rescue => rescue,
    }
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Manage => "manage",
            Event::VerifyDone => "verify.done",
            Event::VerifyFail { .. } => "verify.fail",
            Event::Provide { .. } => "provide",
            Event::InspectStart => "inspect.start",
            Event::InspectDone => "inspect.done",
            Event::InspectFail { .. } => "inspect.fail",
            Event::DeployStart { .. } => "deploy.start",
            Event::Rebuild { .. } => "deploy.rebuild",
            Event::CleanStart { .. } => "clean.start",
            Event::StepDone { kind, .. } => kinded(
                *kind,
                "deploy.step_done",
                "clean.step_done",
                "rescue.step_done",
            ),
            Event::StepWait { kind, .. } => {
                kinded(*kind, "deploy.wait", "clean.wait", "rescue.wait")
            }
            Event::StepResume { kind, .. } => {
                kinded(*kind, "deploy.resume", "clean.resume", "rescue.resume")
            }
            Event::StepsComplete { kind } => kinded(
                *kind,
                "deploy.done",
                "clean.steps_done",
                "rescue.steps_done",
            ),
            Event::CleanDone => "clean.done",
            Event::StepFail { kind, .. } => {
                kinded(*kind, "deploy.fail", "clean.fail", "rescue.fail")
            }
            Event::Delete => "delete",
            Event::DeleteDone { .. } => "delete.done",
            Event::DeleteFail { .. } => "delete.fail",
            Event::RescueStart => "rescue.start",
            Event::RescueWait => "rescue.wait",
            Event::RescueDone => "rescue.done",
            Event::RescueFail { .. } => "rescue.fail",
            Event::Unrescue => "unrescue",
            Event::PowerSync { .. } => "power.sync",
            Event::Abort { .. } => "abort",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Directive {
    // Changes to the node record.  These are applied together with the new
    // state, before it is saved.
    StartSteps { kind: StepKind, steps: Vec<StepRecord> },
    SetCurrentStep { index: usize },
    RecordPowerState { state: PowerState },
    RecordLastError { error: String },
    /// `step` defaults to the current step of the node's step pass
    RecordStepFailure { step: Option<String>, error: String },
    ClearLastError,
    SetMaintenance { reason: String },
    ClearStepProgress,
    ClearInstance,
    ClearRescuePassword,

    // Driver calls, made in order once the new state has been saved.
    Verify,
    PrepareDeploy,
    PrepareCleaning,
    ExecuteStep { kind: StepKind, index: usize },
    TearDown,
    TearDownCleaning,
    CleanUp,
    InspectHardware,
    Rescue,
    CleanUpRescue,
}

impl Directive {
    pub fn is_driver_call(&self) -> bool {
        matches!(
            self,
            Directive::Verify
                | Directive::PrepareDeploy
                | Directive::PrepareCleaning
                | Directive::ExecuteStep { .. }
                | Directive::TearDown
                | Directive::TearDownCleaning
                | Directive::CleanUp
                | Directive::InspectHardware
                | Directive::Rescue
                | Directive::CleanUpRescue
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transition {
    pub event: &'static str,
    pub from: ProvisionState,
    pub to: ProvisionState,
    pub target: Option<ProvisionState>,
    pub directives: Vec<Directive>,
}

impl Transition {
    /// Applies the new state and every record-changing directive to `node`
    pub fn apply(&self, node: &mut Node) {
        node.provision_state = self.to;
        node.target_provision_state = self.target;

        for directive in &self.directives {
            match directive {
                Directive::StartSteps { kind, steps } => {
                    node.step_progress =
                        Some(StepProgress::new(*kind, steps.clone()));
                }
                Directive::SetCurrentStep { index } => {
                    if let Some(progress) = node.step_progress.as_mut() {
                        progress.current = *index;
                    }
                }
                Directive::RecordPowerState { state } => {
                    node.power_state = Some(*state);
                }
                Directive::RecordLastError { error } => {
                    node.last_error = Some(error.clone());
                }
                Directive::RecordStepFailure { step, error } => {
                    if let Some(progress) = node.step_progress.as_mut() {
                        let step = step.clone().or_else(|| {
                            progress.current_step().map(|s| s.name.clone())
                        });
                        progress.failed_step = step;
                    }
                    node.last_error = Some(error.clone());
                }
                Directive::ClearLastError => node.last_error = None,
                Directive::SetMaintenance { reason } => {
                    node.maintenance = true;
                    node.maintenance_reason = Some(reason.clone());
                }
                Directive::ClearStepProgress => node.step_progress = None,
                Directive::ClearInstance => {
                    node.instance_info.clear();
                    node.instance_id = None;
                }
                Directive::ClearRescuePassword => {
                    node.instance_info.remove(RESCUE_PASSWORD);
                }
                _ => (),
            }
        }
    }

    /// Returns the driver calls to make once the transition has been saved
    pub fn driver_calls(&self) -> impl Iterator<Item = &Directive> {
        self.directives.iter().filter(|d| d.is_driver_call())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("event \"{event}\" is not allowed in provision state \"{state}\"")]
pub struct InvalidTransition {
    pub state: ProvisionState,
    pub event: &'static str,
}

impl From<InvalidTransition> for external::Error {
    fn from(error: InvalidTransition) -> external::Error {
        external::Error::invalid_request(&error.to_string())
    }
}

fn running_state(kind: StepKind) -> Option<ProvisionState> {
    match kind {
        StepKind::Deploy => Some(ProvisionState::Deploying),
        StepKind::Clean => Some(ProvisionState::Cleaning),
        StepKind::Rescue => None,
    }
}

fn wait_state(kind: StepKind) -> Option<ProvisionState> {
    match kind {
        StepKind::Deploy => Some(ProvisionState::DeployWait),
        StepKind::Clean => Some(ProvisionState::CleanWait),
        StepKind::Rescue => None,
    }
}

fn start_deploying(steps: &[StepRecord]) -> Vec<Directive> {
    vec![
        Directive::ClearLastError,
        Directive::StartSteps { kind: StepKind::Deploy, steps: steps.to_vec() },
        Directive::PrepareDeploy,
        Directive::ExecuteStep { kind: StepKind::Deploy, index: 0 },
    ]
}

fn start_cleaning(steps: &[StepRecord]) -> Vec<Directive> {
    vec![
        Directive::ClearLastError,
        Directive::StartSteps { kind: StepKind::Clean, steps: steps.to_vec() },
        Directive::PrepareCleaning,
        Directive::ExecuteStep { kind: StepKind::Clean, index: 0 },
    ]
}

fn clean_failed(reason: &str) -> Directive {
    Directive::SetMaintenance { reason: format!("cleaning failed: {}", reason) }
}

/// Computes the transition for `event` in `current`
pub fn transition(
    current: Provision,
    event: &Event,
) -> Result<Transition, InvalidTransition> {
    use ProvisionState::*;

    let state = current.state;
    let invalid = || InvalidTransition { state, event: event.name() };
    let same = |directives| (state, current.target, directives);

    let (to, target, directives) = match (state, event) {
        (Enrolled, Event::Manage) => (
            Verifying,
            Some(Manageable),
            vec![Directive::ClearLastError, Directive::Verify],
        ),
        (
            Available | CleanFail | DeployFail | InspectFail | RescueFail,
            Event::Manage,
        ) => (Manageable, None, vec![Directive::ClearStepProgress]),
        (Verifying, Event::VerifyDone) => (Manageable, None, vec![]),
        (Verifying, Event::VerifyFail { error }) => (
            Enrolled,
            None,
            vec![Directive::RecordLastError { error: error.clone() }],
        ),

        (Manageable, Event::Provide { automated_clean, steps }) => {
            if *automated_clean {
                (Cleaning, Some(Available), start_cleaning(steps))
            } else {
                (Available, None, vec![Directive::ClearLastError])
            }
        }
        (Manageable, Event::CleanStart { steps }) => {
            (Cleaning, Some(Manageable), start_cleaning(steps))
        }

        (Manageable | InspectFail, Event::InspectStart) => (
            Inspecting,
            Some(Manageable),
            vec![Directive::ClearLastError, Directive::InspectHardware],
        ),
        (Inspecting, Event::InspectDone) => (Manageable, None, vec![]),
        (Inspecting, Event::InspectFail { error }) => (
            InspectFail,
            None,
            vec![Directive::RecordLastError { error: error.clone() }],
        ),

        (Available, Event::DeployStart { steps })
        | (Active | DeployFail | Error, Event::Rebuild { steps }) => {
            (Deploying, Some(Active), start_deploying(steps))
        }

        (_, Event::StepDone { kind, index })
            if running_state(*kind) == Some(state) =>
        {
            same(vec![
                Directive::SetCurrentStep { index: index + 1 },
                Directive::ExecuteStep { kind: *kind, index: index + 1 },
            ])
        }
        (_, Event::StepWait { kind, index })
            if running_state(*kind) == Some(state) =>
        {
            let wait = wait_state(*kind).ok_or_else(invalid)?;
            (
                wait,
                current.target,
                vec![Directive::SetCurrentStep { index: *index }],
            )
        }
        (_, Event::StepResume { kind, index })
            if wait_state(*kind) == Some(state) =>
        {
            let running = running_state(*kind).ok_or_else(invalid)?;
            (
                running,
                current.target,
                vec![
                    Directive::SetCurrentStep { index: index + 1 },
                    Directive::ExecuteStep { kind: *kind, index: index + 1 },
                ],
            )
        }
        (Deploying, Event::StepsComplete { kind: StepKind::Deploy }) => {
            (Active, None, vec![Directive::ClearStepProgress])
        }
        (Cleaning, Event::StepsComplete { kind: StepKind::Clean }) => {
            same(vec![Directive::TearDownCleaning])
        }
        (Cleaning, Event::CleanDone) => {
            let done = current
                .target
                .filter(|t| matches!(t, Available | Manageable))
                .ok_or_else(invalid)?;
            (done, None, vec![Directive::ClearStepProgress])
        }
        (_, Event::StepFail { kind, step, error })
            if running_state(*kind) == Some(state)
                || wait_state(*kind) == Some(state) =>
        {
            let failure = Directive::RecordStepFailure {
                step: step.clone(),
                error: error.clone(),
            };
            match kind {
                StepKind::Deploy => (DeployFail, None, vec![failure]),
                StepKind::Clean => {
                    (CleanFail, None, vec![failure, clean_failed(error)])
                }
                StepKind::Rescue => return Err(invalid()),
            }
        }

        (
            Active | DeployFail | DeployWait | Error | Rescued | RescueFail,
            Event::Delete,
        ) => (
            Deleting,
            Some(Available),
            vec![
                Directive::ClearLastError,
                Directive::ClearStepProgress,
                Directive::TearDown,
            ],
        ),
        (Deleting, Event::DeleteDone { automated_clean, steps }) => {
            if *automated_clean {
                let mut directives = vec![Directive::ClearInstance];
                directives.extend(start_cleaning(steps));
                (Cleaning, Some(Available), directives)
            } else {
                (Available, None, vec![Directive::ClearInstance])
            }
        }
        (Deleting, Event::DeleteFail { error }) => (
            Error,
            None,
            vec![Directive::RecordLastError { error: error.clone() }],
        ),

        (Active | RescueFail, Event::RescueStart) => (
            Rescuing,
            Some(Rescued),
            vec![Directive::ClearLastError, Directive::Rescue],
        ),
        (Rescuing, Event::RescueWait) => (RescueWait, Some(Rescued), vec![]),
        (Rescuing | RescueWait, Event::RescueDone) => (Rescued, None, vec![]),
        (
            Rescuing | RescueWait | Rescued | RescueFail,
            Event::RescueFail { error },
        ) => {
            let mut directives = vec![
                Directive::RecordLastError { error: error.clone() },
                Directive::ClearRescuePassword,
            ];
            if state == RescueWait {
                directives.push(Directive::CleanUpRescue);
            }
            (RescueFail, None, directives)
        }
        (Rescued | RescueFail, Event::Unrescue) => (
            Active,
            None,
            vec![Directive::ClearLastError, Directive::ClearRescuePassword],
        ),

        (_, Event::PowerSync { observed }) if !state.is_running() => {
            same(vec![Directive::RecordPowerState { state: *observed }])
        }

        (_, Event::Abort { error }) => {
            let last_error = Directive::RecordLastError { error: error.clone() };
            let step_failure =
                Directive::RecordStepFailure { step: None, error: error.clone() };
            match state {
                Verifying => (Enrolled, None, vec![last_error]),
                Deploying => (DeployFail, None, vec![step_failure]),
                DeployWait => (
                    DeployFail,
                    None,
                    vec![step_failure, Directive::CleanUp],
                ),
                Cleaning => {
                    (CleanFail, None, vec![step_failure, clean_failed(error)])
                }
                CleanWait => (
                    CleanFail,
                    None,
                    vec![
                        step_failure,
                        clean_failed(error),
                        Directive::TearDownCleaning,
                    ],
                ),
                Inspecting => (InspectFail, None, vec![last_error]),
                Rescuing => (
                    RescueFail,
                    None,
                    vec![last_error, Directive::ClearRescuePassword],
                ),
                RescueWait => (
                    RescueFail,
                    None,
                    vec![
                        last_error,
                        Directive::ClearRescuePassword,
                        Directive::CleanUpRescue,
                    ],
                ),
                Deleting => (Error, None, vec![last_error]),
                _ => return Err(invalid()),
            }
        }

        _ => return Err(invalid()),
    };

    Ok(Transition { event: event.name(), from: state, to, target, directives })
}

#[cfg(test)]
mod test {
    use super::*;
    use conductor_types::step::InterfaceType;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use strum::IntoEnumIterator;

    fn step(name: &str, priority: i32) -> StepRecord {
        StepRecord {
            name: name.to_owned(),
            interface: InterfaceType::Deploy,
            priority,
            asynchronous: false,
            args: BTreeMap::new(),
        }
    }

    fn at(state: ProvisionState) -> Provision {
        Provision { state, target: None }
    }

    #[test]
    fn test_enroll_to_available() {
        let t = transition(at(ProvisionState::Enrolled), &Event::Manage)
            .unwrap();
        assert_eq!(t.to, ProvisionState::Verifying);
        assert_eq!(t.target, Some(ProvisionState::Manageable));
        assert_eq!(t.driver_calls().collect::<Vec<_>>(), [&Directive::Verify]);

        let verifying = Provision { state: t.to, target: t.target };
        let t = transition(verifying, &Event::VerifyDone).unwrap();
        assert_eq!(t.to, ProvisionState::Manageable);
        assert_eq!(t.target, None);

        let t = transition(
            at(ProvisionState::Manageable),
            &Event::Provide { automated_clean: false, steps: vec![] },
        )
        .unwrap();
        assert_eq!(t.to, ProvisionState::Available);
    }

    #[test]
    fn test_provide_with_automated_clean() {
        let steps = vec![step("erase_disk", 10)];
        let t = transition(
            at(ProvisionState::Manageable),
            &Event::Provide { automated_clean: true, steps: steps.clone() },
        )
        .unwrap();
        assert_eq!(t.to, ProvisionState::Cleaning);
        assert_eq!(t.target, Some(ProvisionState::Available));
        assert!(t.directives.contains(&Directive::StartSteps {
            kind: StepKind::Clean,
            steps
        }));
        assert_eq!(
            t.driver_calls().collect::<Vec<_>>(),
            [
                &Directive::PrepareCleaning,
                &Directive::ExecuteStep { kind: StepKind::Clean, index: 0 }
            ]
        );

        // When the steps run out, cleaning is torn down and the node lands in
        // the target state.
        let cleaning = Provision { state: t.to, target: t.target };
        let t = transition(
            cleaning,
            &Event::StepsComplete { kind: StepKind::Clean },
        )
        .unwrap();
        assert_eq!(t.to, ProvisionState::Cleaning);
        assert_eq!(t.directives, vec![Directive::TearDownCleaning]);
        let t = transition(cleaning, &Event::CleanDone).unwrap();
        assert_eq!(t.to, ProvisionState::Available);
        assert_eq!(t.target, None);
    }

    #[test]
    fn test_step_wait_and_resume() {
        let deploying = Provision {
            state: ProvisionState::Deploying,
            target: Some(ProvisionState::Active),
        };
        let t = transition(
            deploying,
            &Event::StepWait { kind: StepKind::Deploy, index: 2 },
        )
        .unwrap();
        assert_eq!(t.to, ProvisionState::DeployWait);
        assert_eq!(t.target, Some(ProvisionState::Active));
        assert_eq!(t.directives, vec![Directive::SetCurrentStep { index: 2 }]);

        let waiting = Provision { state: t.to, target: t.target };
        let t = transition(
            waiting,
            &Event::StepResume { kind: StepKind::Deploy, index: 2 },
        )
        .unwrap();
        assert_eq!(t.to, ProvisionState::Deploying);
        assert_eq!(
            t.directives,
            vec![
                Directive::SetCurrentStep { index: 3 },
                Directive::ExecuteStep { kind: StepKind::Deploy, index: 3 },
            ]
        );

        // A clean event cannot resume a deploy.
        transition(
            waiting,
            &Event::StepResume { kind: StepKind::Clean, index: 2 },
        )
        .unwrap_err();
    }

    #[test]
    fn test_step_failure() {
        let cleaning = Provision {
            state: ProvisionState::Cleaning,
            target: Some(ProvisionState::Available),
        };
        let t = transition(
            cleaning,
            &Event::StepFail {
                kind: StepKind::Clean,
                step: Some(String::from("erase_disk")),
                error: String::from("disk on fire"),
            },
        )
        .unwrap();
        assert_eq!(t.to, ProvisionState::CleanFail);
        assert_eq!(t.target, None);
        assert!(t.directives.contains(&Directive::RecordStepFailure {
            step: Some(String::from("erase_disk")),
            error: String::from("disk on fire"),
        }));
        assert!(t
            .directives
            .iter()
            .any(|d| matches!(d, Directive::SetMaintenance { .. })));
        assert_eq!(t.driver_calls().count(), 0);
    }

    #[test]
    fn test_abort_from_wait_states() {
        let error = String::from("timed out");
        let t = transition(
            at(ProvisionState::CleanWait),
            &Event::Abort { error: error.clone() },
        )
        .unwrap();
        assert_eq!(t.to, ProvisionState::CleanFail);
        assert_eq!(
            t.driver_calls().collect::<Vec<_>>(),
            [&Directive::TearDownCleaning]
        );

        let t = transition(
            at(ProvisionState::DeployWait),
            &Event::Abort { error: error.clone() },
        )
        .unwrap();
        assert_eq!(t.to, ProvisionState::DeployFail);
        assert_eq!(t.driver_calls().collect::<Vec<_>>(), [&Directive::CleanUp]);

        let error = transition(
            at(ProvisionState::Active),
            &Event::Abort { error },
        )
        .unwrap_err();
        assert_eq!(error.state, ProvisionState::Active);
        assert_eq!(error.event, "abort");
    }

    #[test]
    fn test_power_sync_only_when_idle() {
        for state in ProvisionState::iter() {
            let result = transition(
                at(state),
                &Event::PowerSync { observed: PowerState::PowerOn },
            );
            if state.is_running() {
                assert!(result.is_err(), "power sync allowed in {state}");
            } else {
                let t = result.unwrap();
                assert_eq!(t.to, state);
                assert_eq!(
                    t.directives,
                    vec![Directive::RecordPowerState {
                        state: PowerState::PowerOn
                    }]
                );
            }
        }
    }

    #[test]
    fn test_apply_records_failing_step() {
        let mut node = conductor_types::node::Node::new(
            uuid::Uuid::new_v4(),
            conductor_types::node::NodeCreate {
                driver: String::from("fake"),
                ..Default::default()
            },
            chrono::Utc::now(),
        );
        let start = transition(
            at(ProvisionState::Manageable),
            &Event::CleanStart {
                steps: vec![step("reset_bios", 20), step("erase_disk", 10)],
            },
        )
        .unwrap();
        start.apply(&mut node);
        assert_eq!(node.provision_state, ProvisionState::Cleaning);
        assert_eq!(node.step_progress.as_ref().unwrap().current, 0);

        let done = transition(
            Provision::of(&node),
            &Event::StepDone { kind: StepKind::Clean, index: 0 },
        )
        .unwrap();
        done.apply(&mut node);
        assert_eq!(node.step_progress.as_ref().unwrap().current, 1);

        // Without an explicit step name, the current step is blamed.
        let abort = transition(
            Provision::of(&node),
            &Event::Abort { error: String::from("cancelled") },
        )
        .unwrap();
        abort.apply(&mut node);
        assert_eq!(node.provision_state, ProvisionState::CleanFail);
        assert_eq!(node.last_error.as_deref(), Some("cancelled"));
        assert!(node.maintenance);
        assert_eq!(
            node.step_progress.unwrap().failed_step.as_deref(),
            Some("erase_disk")
        );
    }

    fn arb_state() -> impl Strategy<Value = ProvisionState> {
        prop::sample::select(ProvisionState::iter().collect::<Vec<_>>())
    }

    fn arb_kind() -> impl Strategy<Value = StepKind> {
        prop_oneof![
            Just(StepKind::Deploy),
            Just(StepKind::Clean),
            Just(StepKind::Rescue),
        ]
    }

    fn arb_event() -> impl Strategy<Value = Event> {
        let steps = prop::collection::vec(
            (0..3usize, -5..50i32).prop_map(|(n, p)| {
                step(["a", "b", "c"][n], p)
            }),
            0..4,
        );
        prop_oneof![
            Just(Event::Manage),
            Just(Event::VerifyDone),
            Just(Event::InspectStart),
            Just(Event::Delete),
            Just(Event::RescueStart),
            Just(Event::CleanDone),
            Just(Event::Unrescue),
            (any::<bool>(), steps.clone()).prop_map(|(automated_clean, steps)| {
                Event::Provide { automated_clean, steps }
            }),
            steps.clone().prop_map(|steps| Event::DeployStart { steps }),
            steps.prop_map(|steps| Event::CleanStart { steps }),
            (arb_kind(), 0..5usize)
                .prop_map(|(kind, index)| Event::StepDone { kind, index }),
            (arb_kind(), 0..5usize)
                .prop_map(|(kind, index)| Event::StepWait { kind, index }),
            (arb_kind(), 0..5usize)
                .prop_map(|(kind, index)| Event::StepResume { kind, index }),
            arb_kind().prop_map(|kind| Event::StepsComplete { kind }),
            arb_kind().prop_map(|kind| Event::StepFail {
                kind,
                step: None,
                error: String::from("boom"),
            }),
            Just(Event::Abort { error: String::from("gone") }),
            Just(Event::PowerSync { observed: PowerState::PowerOff }),
        ]
    }

    proptest! {
        #[test]
        fn test_transition_is_deterministic(
            state in arb_state(),
            target in prop::option::of(arb_state()),
            event in arb_event(),
        ) {
            let current = Provision { state, target };
            let first = transition(current, &event);
            let second = transition(current, &event);
            prop_assert_eq!(&first, &second);

            if let Ok(t) = first {
                prop_assert_eq!(t.from, state);
                prop_assert_eq!(t.event, event.name());
                // A step execution always comes last, since it produces the
                // next event.
                if let Some(position) = t.directives.iter().position(|d| {
                    matches!(d, Directive::ExecuteStep { .. })
                }) {
                    prop_assert_eq!(position, t.directives.len() - 1);
                }
                if matches!(event, Event::Abort { .. }) {
                    prop_assert!(!t.to.is_transient());
                }
            }
        }
    }
}
