// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability interfaces implemented by drivers
//!
//! A driver is assembled from one implementation of each capability it
//! supports.  Every capability implements [`Capability`], which covers what the
//! conductor needs to know about any capability (validation, properties, and
//! steps), plus the trait for its own kind of operations.
//!
//! All operations are invoked by the conductor while it already holds a lease
//! on the node: read-only operations receive `&Task`, operations that may
//! modify the node receive `&mut Task`.  Changes a driver makes to the node
//! through [`Task::node_mut()`] are saved by the caller.

use crate::app::task::Task;
use async_trait::async_trait;
use conductor_common::api::external::Error;
use conductor_types::node::BootDevice;
use conductor_types::node::BootDeviceInfo;
use conductor_types::node::PowerState;
use conductor_types::step::InterfaceType;
use conductor_types::step::StepKind;
use conductor_types::step::StepRecord;
use serde::Serialize;
use std::collections::BTreeMap;

/// Errors reported by capability implementations
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("invalid value for {label}: {message}")]
    InvalidParameterValue { label: String, message: String },

    #[error("missing value for {label}")]
    MissingParameterValue { label: String },

    #[error("{interface} interface does not support {operation}")]
    Unsupported { interface: InterfaceType, operation: String },

    #[error("{operation} failed: {message}")]
    OperationFailed { operation: String, message: String },

    #[error(transparent)]
    Store(#[from] Error),
}

impl DriverError {
    pub fn invalid_value(label: &str, message: &str) -> DriverError {
        DriverError::InvalidParameterValue {
            label: label.to_owned(),
            message: message.to_owned(),
        }
    }

    pub fn missing_value(label: &str) -> DriverError {
        DriverError::MissingParameterValue { label: label.to_owned() }
    }

    pub fn unsupported(interface: InterfaceType, operation: &str) -> DriverError {
        DriverError::Unsupported {
            interface,
            operation: operation.to_owned(),
        }
    }

    pub fn failed(operation: &str, message: &str) -> DriverError {
        DriverError::OperationFailed {
            operation: operation.to_owned(),
            message: message.to_owned(),
        }
    }
}

impl From<DriverError> for Error {
    fn from(error: DriverError) -> Error {
        match error {
            DriverError::InvalidParameterValue { label, message } => {
                Error::InvalidValue { label, message }
            }
            DriverError::MissingParameterValue { label } => {
                Error::MissingValue { label }
            }
            error @ DriverError::Unsupported { .. } => {
                Error::invalid_request(&error.to_string())
            }
            error @ DriverError::OperationFailed { .. } => {
                Error::internal_error(&error.to_string())
            }
            DriverError::Store(error) => error,
        }
    }
}

/// A step declared by a capability
#[derive(Clone, Debug)]
pub struct StepDefinition {
    pub name: String,
    pub kind: StepKind,
    /// steps with a priority of zero or less only run when requested
    /// explicitly
    pub priority: i32,
    /// whether the step finishes through the step-continuation callback
    pub asynchronous: bool,
}

impl StepDefinition {
    pub fn new(
        name: &str,
        kind: StepKind,
        priority: i32,
        asynchronous: bool,
    ) -> StepDefinition {
        StepDefinition { name: name.to_owned(), kind, priority, asynchronous }
    }
}

/// How a step (or other operation that may complete asynchronously) ended
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepOutcome {
    /// the work is complete
    Done,
    /// the work continues elsewhere and will be reported through the
    /// step-continuation callback
    Wait,
}

/// What every capability provides
#[async_trait]
pub trait Capability: Send + Sync {
    fn interface(&self) -> InterfaceType;

    /// Describes the `driver_info` keys this capability understands
    fn get_properties(&self) -> BTreeMap<String, String>;

    /// Checks that the node carries everything this capability needs
    async fn validate(&self, task: &Task) -> Result<(), DriverError>;

    /// Steps this capability offers
    ///
    /// This is consulted once, when the driver is assembled.
    fn steps(&self) -> Vec<StepDefinition> {
        Vec::new()
    }

    async fn execute_step(
        &self,
        _task: &mut Task,
        step: &StepRecord,
    ) -> Result<StepOutcome, DriverError> {
        Err(DriverError::unsupported(
            self.interface(),
            &format!("step \"{}\"", step.name),
        ))
    }
}

#[async_trait]
pub trait PowerInterface: Capability {
    async fn get_power_state(
        &self,
        task: &Task,
    ) -> Result<PowerState, DriverError>;

    async fn set_power_state(
        &self,
        task: &mut Task,
        state: PowerState,
    ) -> Result<(), DriverError>;

    async fn reboot(&self, task: &mut Task) -> Result<(), DriverError>;
}

#[async_trait]
pub trait DeployInterface: Capability {
    /// Prepares the node's environment for a deployment
    async fn prepare(&self, task: &mut Task) -> Result<(), DriverError>;

    /// Undoes a deployment
    async fn tear_down(&self, task: &mut Task) -> Result<(), DriverError>;

    /// Cleans up after a deployment that did not finish
    async fn clean_up(&self, task: &mut Task) -> Result<(), DriverError>;

    /// Re-establishes whatever this conductor needs to manage an active node
    /// that another conductor was managing
    async fn take_over(&self, task: &mut Task) -> Result<(), DriverError>;

    async fn prepare_cleaning(
        &self,
        task: &mut Task,
    ) -> Result<(), DriverError>;

    async fn tear_down_cleaning(
        &self,
        task: &mut Task,
    ) -> Result<(), DriverError>;
}

#[async_trait]
pub trait ManagementInterface: Capability {
    async fn get_supported_boot_devices(
        &self,
        task: &Task,
    ) -> Result<Vec<BootDevice>, DriverError>;

    async fn set_boot_device(
        &self,
        task: &mut Task,
        device: BootDevice,
        persistent: bool,
    ) -> Result<(), DriverError>;

    async fn get_boot_device(
        &self,
        task: &Task,
    ) -> Result<BootDeviceInfo, DriverError>;

    async fn get_sensors_data(
        &self,
        task: &Task,
    ) -> Result<BTreeMap<String, serde_json::Value>, DriverError>;
}

/// How to reach a node's console
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ConsoleInfo {
    pub console_type: String,
    pub url: String,
}

#[async_trait]
pub trait ConsoleInterface: Capability {
    async fn start_console(&self, task: &mut Task) -> Result<(), DriverError>;
    async fn stop_console(&self, task: &mut Task) -> Result<(), DriverError>;
    async fn get_console(
        &self,
        task: &Task,
    ) -> Result<ConsoleInfo, DriverError>;
}

#[async_trait]
pub trait RescueInterface: Capability {
    /// Boots the node into a rescue environment
    ///
    /// Returns [`StepOutcome::Wait`] if the rescue environment reports back
    /// through the step-continuation callback.
    async fn rescue(&self, task: &mut Task) -> Result<StepOutcome, DriverError>;

    async fn unrescue(&self, task: &mut Task) -> Result<(), DriverError>;

    /// Cleans up after a rescue that did not finish
    async fn clean_up(&self, task: &mut Task) -> Result<(), DriverError>;
}

#[async_trait]
pub trait InspectInterface: Capability {
    /// Discovers the node's hardware properties
    async fn inspect_hardware(
        &self,
        task: &mut Task,
    ) -> Result<(), DriverError>;
}

/// A method offered by a vendor capability
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VendorMethod {
    pub name: String,
    pub description: String,
    /// whether the method modifies the node (and so needs an exclusive lease)
    pub exclusive: bool,
}

#[async_trait]
pub trait VendorInterface: Capability {
    fn methods(&self) -> Vec<VendorMethod>;

    async fn call(
        &self,
        task: &mut Task,
        method: &str,
        args: &BTreeMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, DriverError>;
}
