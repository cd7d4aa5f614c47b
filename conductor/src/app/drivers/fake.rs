// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The "fake" driver: every capability, backed by in-memory hardware
//!
//! The fake driver stands in for vendor adapters in development and in the
//! test suite.  Its behavior can be steered per node through `driver_info`
//! (see the properties each capability reports).

use super::fake_async;
use super::interfaces::Capability;
use super::interfaces::ConsoleInfo;
use super::interfaces::ConsoleInterface;
use super::interfaces::DeployInterface;
use super::interfaces::DriverError;
use super::interfaces::InspectInterface;
use super::interfaces::ManagementInterface;
use super::interfaces::PowerInterface;
use super::interfaces::RescueInterface;
use super::interfaces::StepDefinition;
use super::interfaces::StepOutcome;
use super::interfaces::VendorInterface;
use super::interfaces::VendorMethod;
use super::registry::Driver;
use super::registry::DriverBuilder;
use super::registry::DriverFactories;
use super::registry::DriverFactory;
use super::registry::DriverLoadError;
use crate::app::task::Task;
use async_trait::async_trait;
use conductor_types::node::BootDevice;
use conductor_types::node::BootDeviceInfo;
use conductor_types::node::Node;
use conductor_types::node::PowerState;
use conductor_types::step::InterfaceType;
use conductor_types::step::StepCompletionOutcome;
use conductor_types::step::StepKind;
use conductor_types::step::StepRecord;
use serde_json::json;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use uuid::Uuid;

/// `driver_info` key: fail validation of the power interface
const FAKE_INVALID: &str = "fake_invalid";
/// `driver_info` key: name of a step that fails
const FAKE_FAIL_STEP: &str = "fake_fail_step";
/// `driver_info` key: how long each step takes, in milliseconds
const FAKE_STEP_DELAY_MS: &str = "fake_step_delay_ms";
/// `driver_info` key: make power changes fail
const FAKE_POWER_FAIL: &str = "fake_power_fail";
/// `driver_info` key: make tear-down fail
const FAKE_FAIL_TEAR_DOWN: &str = "fake_fail_tear_down";
/// `driver_info` key: make inspection fail
const FAKE_FAIL_INSPECT: &str = "fake_fail_inspect";
/// `driver_info` key: make rescue fail
const FAKE_FAIL_RESCUE: &str = "fake_fail_rescue";
/// `driver_info` key: port reported for the console
const FAKE_CONSOLE_PORT: &str = "fake_console_port";

/// `extra` key under which the fake driver records the steps it ran
pub const FAKE_STEPS_RUN: &str = "fake_steps_run";

#[derive(Clone, Debug, Default)]
struct FakeNodeState {
    power: Option<PowerState>,
    boot: Option<BootDeviceInfo>,
}

/// Simulated hardware shared by the capabilities of fake drivers
#[derive(Clone, Debug, Default)]
pub struct FakeHardware {
    nodes: Arc<Mutex<BTreeMap<Uuid, FakeNodeState>>>,
}

impl FakeHardware {
    fn with_node<T>(
        &self,
        node_id: Uuid,
        f: impl FnOnce(&mut FakeNodeState) -> T,
    ) -> T {
        let mut nodes =
            self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        f(nodes.entry(node_id).or_default())
    }

    /// Returns the simulated power state (machines start out powered off)
    pub fn power_state(&self, node_id: Uuid) -> PowerState {
        self.with_node(node_id, |node| {
            node.power.unwrap_or(PowerState::PowerOff)
        })
    }

    /// Changes the simulated power state behind the conductor's back
    pub fn set_power_state(&self, node_id: Uuid, state: PowerState) {
        self.with_node(node_id, |node| node.power = Some(state));
    }

    fn boot_device(&self, node_id: Uuid) -> Option<BootDeviceInfo> {
        self.with_node(node_id, |node| node.boot.clone())
    }

    fn set_boot_device(&self, node_id: Uuid, boot: BootDeviceInfo) {
        self.with_node(node_id, |node| node.boot = Some(boot));
    }
}

fn info_str<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.driver_info.get(key).and_then(|v| v.as_str())
}

fn info_flag(node: &Node, key: &str) -> bool {
    node.driver_info.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn info_u64(node: &Node, key: &str) -> Result<Option<u64>, DriverError> {
    match node.driver_info.get(key) {
        None => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            DriverError::invalid_value(key, "expected a non-negative integer")
        }),
    }
}

fn properties(items: &[(&str, &str)]) -> BTreeMap<String, String> {
    items
        .iter()
        .map(|(k, v)| (String::from(*k), String::from(*v)))
        .collect()
}

/// Runs one fake step
///
/// Asynchronous steps report their outcome (including failure) through the
/// step-continuation callback once the lease is released.
async fn run_step(
    task: &mut Task,
    step: &StepRecord,
) -> Result<StepOutcome, DriverError> {
    if let Some(ms) = info_u64(task.node(), FAKE_STEP_DELAY_MS)? {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    let fail =
        info_str(task.node(), FAKE_FAIL_STEP) == Some(step.name.as_str());
    let extra = &mut task.node_mut().extra;
    let run = extra.entry(String::from(FAKE_STEPS_RUN)).or_insert(json!([]));
    if let Some(list) = run.as_array_mut() {
        list.push(json!(step.to_string()));
    }

    if step.asynchronous {
        let (kind, index) = match &task.node().step_progress {
            Some(progress) => (progress.kind, progress.current),
            None => {
                return Err(DriverError::failed(
                    &step.to_string(),
                    "no step pass in progress",
                ))
            }
        };
        let outcome = if fail {
            StepCompletionOutcome::Failure {
                error: format!("fake failure in step {}", step),
            }
        } else {
            StepCompletionOutcome::Success
        };
        fake_async::schedule_completion(task, kind, index, outcome)?;
        return Ok(StepOutcome::Wait);
    }

    if fail {
        return Err(DriverError::failed(&step.to_string(), "fake failure"));
    }
    Ok(StepOutcome::Done)
}

pub struct FakePower {
    hardware: FakeHardware,
}

impl FakePower {
    pub fn new(hardware: FakeHardware) -> FakePower {
        FakePower { hardware }
    }

    fn check_fail(&self, task: &Task, operation: &str) -> Result<(), DriverError> {
        if info_flag(task.node(), FAKE_POWER_FAIL) {
            return Err(DriverError::failed(operation, "simulated BMC error"));
        }
        Ok(())
    }
}

#[async_trait]
impl Capability for FakePower {
    fn interface(&self) -> InterfaceType {
        InterfaceType::Power
    }

    fn get_properties(&self) -> BTreeMap<String, String> {
        properties(&[
            (FAKE_INVALID, "fail validation (optional)"),
            (FAKE_POWER_FAIL, "make power changes fail (optional)"),
        ])
    }

    async fn validate(&self, task: &Task) -> Result<(), DriverError> {
        if task.node().driver_info.contains_key(FAKE_INVALID) {
            return Err(DriverError::invalid_value(
                FAKE_INVALID,
                "rejected by the fake driver",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PowerInterface for FakePower {
    async fn get_power_state(
        &self,
        task: &Task,
    ) -> Result<PowerState, DriverError> {
        Ok(self.hardware.power_state(task.node().id))
    }

    async fn set_power_state(
        &self,
        task: &mut Task,
        state: PowerState,
    ) -> Result<(), DriverError> {
        self.check_fail(task, "set_power_state")?;
        if state == PowerState::Error {
            return Err(DriverError::invalid_value(
                "state",
                "cannot set power state to \"error\"",
            ));
        }
        self.hardware.set_power_state(task.node().id, state);
        Ok(())
    }

    async fn reboot(&self, task: &mut Task) -> Result<(), DriverError> {
        self.check_fail(task, "reboot")?;
        self.hardware.set_power_state(task.node().id, PowerState::PowerOn);
        Ok(())
    }
}

pub struct FakeDeploy {
    asynchronous: bool,
}

impl FakeDeploy {
    /// `asynchronous` selects whether the deploy and disk-erasing steps
    /// complete through the step-continuation callback
    pub fn new(asynchronous: bool) -> FakeDeploy {
        FakeDeploy { asynchronous }
    }
}

#[async_trait]
impl Capability for FakeDeploy {
    fn interface(&self) -> InterfaceType {
        InterfaceType::Deploy
    }

    fn get_properties(&self) -> BTreeMap<String, String> {
        properties(&[
            (FAKE_FAIL_STEP, "name of a step that fails (optional)"),
            (FAKE_STEP_DELAY_MS, "duration of each step (optional)"),
            (FAKE_FAIL_TEAR_DOWN, "make tear-down fail (optional)"),
        ])
    }

    async fn validate(&self, task: &Task) -> Result<(), DriverError> {
        info_u64(task.node(), FAKE_STEP_DELAY_MS)?;
        Ok(())
    }

    fn steps(&self) -> Vec<StepDefinition> {
        vec![
            StepDefinition::new(
                "deploy",
                StepKind::Deploy,
                100,
                self.asynchronous,
            ),
            StepDefinition::new(
                "erase_disk",
                StepKind::Clean,
                10,
                self.asynchronous,
            ),
        ]
    }

    async fn execute_step(
        &self,
        task: &mut Task,
        step: &StepRecord,
    ) -> Result<StepOutcome, DriverError> {
        run_step(task, step).await
    }
}

#[async_trait]
impl DeployInterface for FakeDeploy {
    async fn prepare(&self, _task: &mut Task) -> Result<(), DriverError> {
        Ok(())
    }

    async fn tear_down(&self, task: &mut Task) -> Result<(), DriverError> {
        if info_flag(task.node(), FAKE_FAIL_TEAR_DOWN) {
            return Err(DriverError::failed("tear_down", "fake failure"));
        }
        task.node_mut().extra.remove(FAKE_STEPS_RUN);
        Ok(())
    }

    async fn clean_up(&self, _task: &mut Task) -> Result<(), DriverError> {
        Ok(())
    }

    async fn take_over(&self, _task: &mut Task) -> Result<(), DriverError> {
        Ok(())
    }

    async fn prepare_cleaning(
        &self,
        _task: &mut Task,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    async fn tear_down_cleaning(
        &self,
        _task: &mut Task,
    ) -> Result<(), DriverError> {
        Ok(())
    }
}

pub struct FakeManagement {
    hardware: FakeHardware,
    steps: Vec<StepDefinition>,
}

impl FakeManagement {
    pub fn new(hardware: FakeHardware) -> FakeManagement {
        FakeManagement {
            hardware,
            steps: vec![
                StepDefinition::new("reset_bios", StepKind::Clean, 20, false),
                StepDefinition::new("zap_firmware", StepKind::Clean, 0, false),
            ],
        }
    }

    #[cfg(test)]
    pub fn with_duplicate_step() -> FakeManagement {
        let mut management = FakeManagement::new(FakeHardware::default());
        management.steps.push(StepDefinition::new(
            "reset_bios",
            StepKind::Clean,
            5,
            false,
        ));
        management
    }
}

const FAKE_BOOT_DEVICES: [BootDevice; 2] = [BootDevice::Pxe, BootDevice::Disk];

#[async_trait]
impl Capability for FakeManagement {
    fn interface(&self) -> InterfaceType {
        InterfaceType::Management
    }

    fn get_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn validate(&self, _task: &Task) -> Result<(), DriverError> {
        Ok(())
    }

    fn steps(&self) -> Vec<StepDefinition> {
        self.steps.clone()
    }

    async fn execute_step(
        &self,
        task: &mut Task,
        step: &StepRecord,
    ) -> Result<StepOutcome, DriverError> {
        run_step(task, step).await
    }
}

#[async_trait]
impl ManagementInterface for FakeManagement {
    async fn get_supported_boot_devices(
        &self,
        _task: &Task,
    ) -> Result<Vec<BootDevice>, DriverError> {
        Ok(FAKE_BOOT_DEVICES.to_vec())
    }

    async fn set_boot_device(
        &self,
        task: &mut Task,
        device: BootDevice,
        persistent: bool,
    ) -> Result<(), DriverError> {
        if !FAKE_BOOT_DEVICES.contains(&device) {
            return Err(DriverError::invalid_value(
                "boot_device",
                &format!("unsupported boot device {:?}", device),
            ));
        }
        self.hardware.set_boot_device(
            task.node().id,
            BootDeviceInfo {
                boot_device: Some(device),
                persistent: Some(persistent),
            },
        );
        Ok(())
    }

    async fn get_boot_device(
        &self,
        task: &Task,
    ) -> Result<BootDeviceInfo, DriverError> {
        Ok(self.hardware.boot_device(task.node().id).unwrap_or(
            BootDeviceInfo { boot_device: None, persistent: None },
        ))
    }

    async fn get_sensors_data(
        &self,
        _task: &Task,
    ) -> Result<BTreeMap<String, serde_json::Value>, DriverError> {
        Ok(BTreeMap::from([
            (String::from("temperature"), json!({ "cpu": 42 })),
            (String::from("fan"), json!({ "fan1": 3000 })),
        ]))
    }
}

pub struct FakeConsole;

#[async_trait]
impl Capability for FakeConsole {
    fn interface(&self) -> InterfaceType {
        InterfaceType::Console
    }

    fn get_properties(&self) -> BTreeMap<String, String> {
        properties(&[(FAKE_CONSOLE_PORT, "console port (optional)")])
    }

    async fn validate(&self, task: &Task) -> Result<(), DriverError> {
        info_u64(task.node(), FAKE_CONSOLE_PORT)?;
        Ok(())
    }
}

#[async_trait]
impl ConsoleInterface for FakeConsole {
    async fn start_console(&self, _task: &mut Task) -> Result<(), DriverError> {
        Ok(())
    }

    async fn stop_console(&self, _task: &mut Task) -> Result<(), DriverError> {
        Ok(())
    }

    async fn get_console(
        &self,
        task: &Task,
    ) -> Result<ConsoleInfo, DriverError> {
        let port = info_u64(task.node(), FAKE_CONSOLE_PORT)?.unwrap_or(4321);
        Ok(ConsoleInfo {
            console_type: String::from("fake-socat"),
            url: format!("tcp://127.0.0.1:{}", port),
        })
    }
}

pub struct FakeRescue {
    asynchronous: bool,
}

impl FakeRescue {
    pub fn new(asynchronous: bool) -> FakeRescue {
        FakeRescue { asynchronous }
    }
}

#[async_trait]
impl Capability for FakeRescue {
    fn interface(&self) -> InterfaceType {
        InterfaceType::Rescue
    }

    fn get_properties(&self) -> BTreeMap<String, String> {
        properties(&[(FAKE_FAIL_RESCUE, "make rescue fail (optional)")])
    }

    async fn validate(&self, _task: &Task) -> Result<(), DriverError> {
        Ok(())
    }
}

#[async_trait]
impl RescueInterface for FakeRescue {
    async fn rescue(&self, task: &mut Task) -> Result<StepOutcome, DriverError> {
        let fail = info_flag(task.node(), FAKE_FAIL_RESCUE);
        if !self.asynchronous {
            if fail {
                return Err(DriverError::failed("rescue", "fake failure"));
            }
            return Ok(StepOutcome::Done);
        }
        let outcome = if fail {
            StepCompletionOutcome::Failure {
                error: String::from("rescue failed: fake failure"),
            }
        } else {
            StepCompletionOutcome::Success
        };
        fake_async::schedule_completion(task, StepKind::Rescue, 0, outcome)?;
        Ok(StepOutcome::Wait)
    }

    async fn unrescue(&self, _task: &mut Task) -> Result<(), DriverError> {
        Ok(())
    }

    async fn clean_up(&self, _task: &mut Task) -> Result<(), DriverError> {
        Ok(())
    }
}

pub struct FakeInspect;

#[async_trait]
impl Capability for FakeInspect {
    fn interface(&self) -> InterfaceType {
        InterfaceType::Inspect
    }

    fn get_properties(&self) -> BTreeMap<String, String> {
        properties(&[(FAKE_FAIL_INSPECT, "make inspection fail (optional)")])
    }

    async fn validate(&self, _task: &Task) -> Result<(), DriverError> {
        Ok(())
    }
}

#[async_trait]
impl InspectInterface for FakeInspect {
    async fn inspect_hardware(
        &self,
        task: &mut Task,
    ) -> Result<(), DriverError> {
        if info_flag(task.node(), FAKE_FAIL_INSPECT) {
            return Err(DriverError::failed("inspect_hardware", "fake failure"));
        }
        let properties = &mut task.node_mut().properties;
        properties.insert(String::from("cpus"), json!(8));
        properties.insert(String::from("memory_mb"), json!(16384));
        properties.insert(String::from("local_gb"), json!(100));
        Ok(())
    }
}

pub struct FakeVendor;

#[async_trait]
impl Capability for FakeVendor {
    fn interface(&self) -> InterfaceType {
        InterfaceType::Vendor
    }

    fn get_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn validate(&self, _task: &Task) -> Result<(), DriverError> {
        Ok(())
    }
}

#[async_trait]
impl VendorInterface for FakeVendor {
    fn methods(&self) -> Vec<VendorMethod> {
        vec![
            VendorMethod {
                name: String::from("echo"),
                description: String::from("returns its arguments"),
                exclusive: false,
            },
            VendorMethod {
                name: String::from("set_flag"),
                description: String::from("stores \"value\" in the node"),
                exclusive: true,
            },
        ]
    }

    async fn call(
        &self,
        task: &mut Task,
        method: &str,
        args: &BTreeMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, DriverError> {
        match method {
            "echo" => Ok(json!(args)),
            "set_flag" => {
                let value = args
                    .get("value")
                    .cloned()
                    .ok_or_else(|| DriverError::missing_value("value"))?;
                task.node_mut().extra.insert(String::from("flag"), value);
                Ok(serde_json::Value::Null)
            }
            other => Err(DriverError::unsupported(
                InterfaceType::Vendor,
                &format!("method \"{}\"", other),
            )),
        }
    }
}

/// Assembles the synchronous fake driver
pub fn driver(
    name: &str,
    hardware: FakeHardware,
) -> Result<Driver, DriverLoadError> {
    DriverBuilder::new(name)
        .power(FakePower::new(hardware.clone()))
        .deploy(FakeDeploy::new(false))
        .management(FakeManagement::new(hardware))
        .console(FakeConsole)
        .rescue(FakeRescue::new(false))
        .inspect(FakeInspect)
        .vendor(FakeVendor)
        .build()
}

/// Factories for the "fake" and "fake-async" drivers, sharing `hardware`
pub fn factories(hardware: FakeHardware) -> DriverFactories {
    let sync_hardware = hardware.clone();
    let fake: DriverFactory =
        Box::new(move |_log: &Logger| driver("fake", sync_hardware.clone()));
    let fake_async: DriverFactory = Box::new(move |_log: &Logger| {
        fake_async::driver("fake-async", hardware.clone())
    });
    BTreeMap::from([
        (String::from("fake"), fake),
        (String::from("fake-async"), fake_async),
    ])
}

/// Factories for every driver built into the conductor
pub fn builtin_factories() -> DriverFactories {
    factories(FakeHardware::default())
}
