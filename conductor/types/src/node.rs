// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The node record and the states it moves through

use crate::reservation::Reservation;
use crate::step::StepProgress;
use chrono::DateTime;
use chrono::Utc;
use conductor_common::api::external::Generation;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use strum::EnumIter;
use uuid::Uuid;

/// Free-form key/value data attached to a node
///
/// Apart from a few well-known keys like [`RESCUE_PASSWORD`], the conductor
/// never interprets these; drivers and callers do.
pub type Blob = BTreeMap<String, serde_json::Value>;

/// `instance_info` key holding the password of a node being rescued
pub const RESCUE_PASSWORD: &str = "rescue_password";

/// Provisioning state of a node
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    EnumIter,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    /// Newly enrolled; the conductor has not verified it can manage the node.
    Enrolled,
    Verifying,
    /// Verified, but not offered for deployment.
    Manageable,
    /// Ready to be deployed.
    Available,
    Deploying,
    /// Deploying, suspended until an asynchronous step reports completion.
    DeployWait,
    /// Deployed and in use.
    Active,
    DeployFail,
    Cleaning,
    /// Cleaning, suspended until an asynchronous step reports completion.
    CleanWait,
    CleanFail,
    Inspecting,
    InspectFail,
    Rescuing,
    RescueWait,
    Rescued,
    RescueFail,
    /// Tearing down a deployment.
    Deleting,
    /// Tearing down a deployment failed.
    Error,
}

impl ProvisionState {
    pub fn label(&self) -> &'static str {
        match self {
            ProvisionState::Enrolled => "enrolled",
            ProvisionState::Verifying => "verifying",
            ProvisionState::Manageable => "manageable",
            ProvisionState::Available => "available",
            ProvisionState::Deploying => "deploying",
            ProvisionState::DeployWait => "deploy_wait",
            ProvisionState::Active => "active",
            ProvisionState::DeployFail => "deploy_fail",
            ProvisionState::Cleaning => "cleaning",
            ProvisionState::CleanWait => "clean_wait",
            ProvisionState::CleanFail => "clean_fail",
            ProvisionState::Inspecting => "inspecting",
            ProvisionState::InspectFail => "inspect_fail",
            ProvisionState::Rescuing => "rescuing",
            ProvisionState::RescueWait => "rescue_wait",
            ProvisionState::Rescued => "rescued",
            ProvisionState::RescueFail => "rescue_fail",
            ProvisionState::Deleting => "deleting",
            ProvisionState::Error => "error",
        }
    }

    /// Returns true if a worker is actively running an operation on a node in
    /// this state
    ///
    /// A node in one of these states must be covered by an exclusive lease.  If
    /// it is not, the worker that owned the operation went away.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ProvisionState::Verifying
                | ProvisionState::Deploying
                | ProvisionState::Cleaning
                | ProvisionState::Inspecting
                | ProvisionState::Rescuing
                | ProvisionState::Deleting
        )
    }

    /// Returns true if the node is suspended waiting for an asynchronous
    /// completion callback
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            ProvisionState::DeployWait
                | ProvisionState::CleanWait
                | ProvisionState::RescueWait
        )
    }

    /// Returns true if the node is in the middle of a lifecycle pass
    pub fn is_transient(&self) -> bool {
        self.is_running() || self.is_waiting()
    }

    /// Returns true for the states that end a lifecycle pass unsuccessfully
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ProvisionState::DeployFail
                | ProvisionState::CleanFail
                | ProvisionState::InspectFail
                | ProvisionState::RescueFail
                | ProvisionState::Error
        )
    }

    /// Returns true for the states in which a node may be removed from the
    /// store
    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            ProvisionState::Enrolled
                | ProvisionState::Manageable
                | ProvisionState::Available
                | ProvisionState::DeployFail
                | ProvisionState::CleanFail
                | ProvisionState::InspectFail
                | ProvisionState::RescueFail
                | ProvisionState::Error
        )
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Last-known power state of a node
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PowerOn,
    PowerOff,
    /// The driver could not determine the power state.
    Error,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::PowerOn => write!(f, "power on"),
            PowerState::PowerOff => write!(f, "power off"),
            PowerState::Error => write!(f, "error"),
        }
    }
}

/// A requested change in power state
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    PowerOn,
    PowerOff,
    Reboot,
}

impl PowerAction {
    /// The power state the node should be in once the action completes
    pub fn target_state(&self) -> PowerState {
        match self {
            PowerAction::PowerOn | PowerAction::Reboot => PowerState::PowerOn,
            PowerAction::PowerOff => PowerState::PowerOff,
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerAction::PowerOn => write!(f, "power on"),
            PowerAction::PowerOff => write!(f, "power off"),
            PowerAction::Reboot => write!(f, "reboot"),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BootDevice {
    Pxe,
    Disk,
    Cdrom,
    Bios,
    Safe,
}

/// Current boot device, as reported by a management capability
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct BootDeviceInfo {
    pub boot_device: Option<BootDevice>,
    /// `None` if the driver cannot tell
    pub persistent: Option<bool>,
}

/// Parameters for enrolling a new node
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct NodeCreate {
    /// caller-chosen identity (generated if absent)
    pub id: Option<Uuid>,
    pub driver: String,
    #[serde(default)]
    pub driver_info: Blob,
    #[serde(default)]
    pub instance_info: Blob,
    #[serde(default)]
    pub properties: Blob,
    #[serde(default)]
    pub extra: Blob,
}

/// A node record, as stored in the node store
///
/// Outside of the store, a `Node` is a snapshot.  It is only trustworthy for
/// the duration of a lease on the node.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Node {
    pub id: Uuid,
    /// name of the driver that controls this node
    pub driver: String,
    /// driver-specific configuration
    pub driver_info: Blob,
    /// metadata for the instance deployed onto the node
    pub instance_info: Blob,
    pub instance_id: Option<Uuid>,
    /// hardware properties (typically populated by inspection)
    pub properties: Blob,
    pub extra: Blob,

    pub provision_state: ProvisionState,
    /// the state an in-progress operation is driving toward
    pub target_provision_state: Option<ProvisionState>,
    pub provision_updated_at: DateTime<Utc>,
    pub power_state: Option<PowerState>,
    pub target_power_state: Option<PowerState>,
    pub maintenance: bool,
    pub maintenance_reason: Option<String>,
    pub console_enabled: bool,
    pub last_error: Option<String>,
    /// position of an in-progress (or failed) deploy/clean pass
    pub step_progress: Option<StepProgress>,

    /// current lease, if any
    pub reservation: Option<Reservation>,
    /// bumped on every change to `reservation`
    pub reservation_gen: Generation,
    /// bumped on every change to the node's data
    pub generation: Generation,
    pub time_created: DateTime<Utc>,
    pub time_updated: DateTime<Utc>,
}

impl Node {
    /// Builds the record for a newly-enrolled node
    pub fn new(id: Uuid, params: NodeCreate, now: DateTime<Utc>) -> Node {
        Node {
            id,
            driver: params.driver,
            driver_info: params.driver_info,
            instance_info: params.instance_info,
            instance_id: None,
            properties: params.properties,
            extra: params.extra,
            provision_state: ProvisionState::Enrolled,
            target_provision_state: None,
            provision_updated_at: now,
            power_state: None,
            target_power_state: None,
            maintenance: false,
            maintenance_reason: None,
            console_enabled: false,
            last_error: None,
            step_progress: None,
            reservation: None,
            reservation_gen: Generation::new(),
            generation: Generation::new(),
            time_created: now,
            time_updated: now,
        }
    }

    /// Returns the node's mutable data as a [`NodeUpdate`]
    pub fn to_update(&self) -> NodeUpdate {
        NodeUpdate {
            driver: self.driver.clone(),
            driver_info: self.driver_info.clone(),
            instance_info: self.instance_info.clone(),
            instance_id: self.instance_id,
            properties: self.properties.clone(),
            extra: self.extra.clone(),
            provision_state: self.provision_state,
            target_provision_state: self.target_provision_state,
            power_state: self.power_state,
            target_power_state: self.target_power_state,
            maintenance: self.maintenance,
            maintenance_reason: self.maintenance_reason.clone(),
            console_enabled: self.console_enabled,
            last_error: self.last_error.clone(),
            step_progress: self.step_progress.clone(),
        }
    }

    /// Overwrites the node's mutable data with `update`
    ///
    /// Bookkeeping fields (generations and timestamps) are the store's
    /// business and are left alone.
    pub fn apply_update(&mut self, update: NodeUpdate) {
        let NodeUpdate {
            driver,
            driver_info,
            instance_info,
            instance_id,
            properties,
            extra,
            provision_state,
            target_provision_state,
            power_state,
            target_power_state,
            maintenance,
            maintenance_reason,
            console_enabled,
            last_error,
            step_progress,
        } = update;
        self.driver = driver;
        self.driver_info = driver_info;
        self.instance_info = instance_info;
        self.instance_id = instance_id;
        self.properties = properties;
        self.extra = extra;
        self.provision_state = provision_state;
        self.target_provision_state = target_provision_state;
        self.power_state = power_state;
        self.target_power_state = target_power_state;
        self.maintenance = maintenance;
        self.maintenance_reason = maintenance_reason;
        self.console_enabled = console_enabled;
        self.last_error = last_error;
        self.step_progress = step_progress;
    }
}

/// Changes an operator asks for in a node's configuration
///
/// Fields left out are not changed.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct NodePatch {
    /// switch the node to another driver
    pub driver: Option<String>,
    pub driver_info: Option<Blob>,
    pub instance_info: Option<Blob>,
    pub instance: Option<InstanceAssociation>,
    pub properties: Option<Blob>,
    pub extra: Option<Blob>,
}

/// A change in which instance a node is associated with
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case", tag = "op", content = "instance_id")]
pub enum InstanceAssociation {
    Associate(Uuid),
    Disassociate,
}

impl InstanceAssociation {
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            InstanceAssociation::Associate(id) => Some(*id),
            InstanceAssociation::Disassociate => None,
        }
    }
}

/// The mutable data of a node, written as a unit by a conditional update
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NodeUpdate {
    pub driver: String,
    pub driver_info: Blob,
    pub instance_info: Blob,
    pub instance_id: Option<Uuid>,
    pub properties: Blob,
    pub extra: Blob,
    pub provision_state: ProvisionState,
    pub target_provision_state: Option<ProvisionState>,
    pub power_state: Option<PowerState>,
    pub target_power_state: Option<PowerState>,
    pub maintenance: bool,
    pub maintenance_reason: Option<String>,
    pub console_enabled: bool,
    pub last_error: Option<String>,
    pub step_progress: Option<StepProgress>,
}

impl NodeUpdate {
    /// Replays onto `self` every field that differs between `base` and
    /// `changed`
    ///
    /// `base` is the data a writer loaded and `changed` is what it wanted to
    /// write.  `self` starts out as the newer data some other writer stored in
    /// the meantime.  Fields the writer did not touch keep the newer values.
    pub fn rebase(&mut self, base: &NodeUpdate, changed: &NodeUpdate) {
        macro_rules! take_changed {
            ($($field:ident),* $(,)?) => {
                $(
                    if changed.$field != base.$field {
                        self.$field = changed.$field.clone();
                    }
                )*
            };
        }

        take_changed!(
            driver,
            driver_info,
            instance_info,
            instance_id,
            properties,
            extra,
            provision_state,
            target_provision_state,
            power_state,
            target_power_state,
            maintenance,
            maintenance_reason,
            console_enabled,
            last_error,
            step_progress,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_state_classes_are_disjoint() {
        for state in ProvisionState::iter() {
            assert!(
                !(state.is_running() && state.is_waiting()),
                "{state} is both running and waiting"
            );
            if state.is_transient() {
                assert!(!state.is_deletable(), "{state} is transient");
                assert!(!state.is_failed(), "{state} is transient");
            }
            if state.is_failed() {
                assert!(state.is_deletable(), "{state} is not deletable");
            }
        }
    }

    #[test]
    fn test_state_labels_match_serde() {
        for state in ProvisionState::iter() {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.label()));
        }
    }

    #[test]
    fn test_rebase_keeps_concurrent_changes() {
        let now = Utc::now();
        let node = Node::new(
            Uuid::new_v4(),
            NodeCreate { driver: String::from("fake"), ..Default::default() },
            now,
        );

        let base = node.to_update();
        let mut ours = base.clone();
        ours.power_state = Some(PowerState::PowerOn);

        let mut theirs = base.clone();
        theirs.last_error = Some(String::from("bmc timed out"));

        let mut rebased = theirs.clone();
        rebased.rebase(&base, &ours);
        assert_eq!(rebased.power_state, Some(PowerState::PowerOn));
        assert_eq!(rebased.last_error.as_deref(), Some("bmc timed out"));
    }

    #[test]
    fn test_apply_update_roundtrip() {
        let now = Utc::now();
        let mut node = Node::new(
            Uuid::new_v4(),
            NodeCreate { driver: String::from("fake"), ..Default::default() },
            now,
        );
        let mut update = node.to_update();
        update.provision_state = ProvisionState::Manageable;
        update.maintenance = true;
        node.apply_update(update.clone());
        assert_eq!(node.to_update(), update);
        assert_eq!(node.generation, Generation::new());
    }
}
