// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assembling drivers from capabilities, and looking them up by name

use super::interfaces::Capability;
use super::interfaces::ConsoleInterface;
use super::interfaces::DeployInterface;
use super::interfaces::DriverError;
use super::interfaces::InspectInterface;
use super::interfaces::ManagementInterface;
use super::interfaces::PowerInterface;
use super::interfaces::RescueInterface;
use super::interfaces::StepOutcome;
use super::interfaces::VendorInterface;
use crate::app::task::Task;
use conductor_common::api::external::Error;
use conductor_common::api::external::LookupResult;
use conductor_common::api::external::ResourceType;
use conductor_config::DriversConfig;
use conductor_types::step::InterfaceType;
use conductor_types::step::StepKind;
use conductor_types::step::StepRecord;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DriverLoadError {
    #[error("driver \"{driver}\" is missing its {interface} interface")]
    MissingInterface { driver: String, interface: InterfaceType },

    #[error(
        "driver \"{driver}\": failed to initialize {interface} interface: \
        {message}"
    )]
    Dependency { driver: String, interface: InterfaceType, message: String },

    #[error("driver \"{driver}\" is enabled more than once")]
    DuplicateDriver { driver: String },

    #[error("driver \"{driver}\" declares {kind} step \"{step}\" twice")]
    DuplicateStep { driver: String, kind: StepKind, step: String },

    #[error("no driver named \"{driver}\" is available")]
    UnknownDriver { driver: String },
}

/// A step as recorded when its driver was assembled
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegisteredStep {
    pub name: String,
    pub interface: InterfaceType,
    pub priority: i32,
    pub kind: StepKind,
    pub asynchronous: bool,
    /// declaration order across the whole driver
    pub position: usize,
}

impl RegisteredStep {
    pub fn to_record(&self) -> StepRecord {
        StepRecord {
            name: self.name.clone(),
            interface: self.interface,
            priority: self.priority,
            asynchronous: self.asynchronous,
            args: BTreeMap::new(),
        }
    }
}

/// An assembled set of capabilities
///
/// Drivers are immutable once built and are shared by every task on nodes
/// that use them.
pub struct Driver {
    name: String,
    power: Arc<dyn PowerInterface>,
    deploy: Arc<dyn DeployInterface>,
    management: Option<Arc<dyn ManagementInterface>>,
    console: Option<Arc<dyn ConsoleInterface>>,
    rescue: Option<Arc<dyn RescueInterface>>,
    inspect: Option<Arc<dyn InspectInterface>>,
    vendor: Option<Arc<dyn VendorInterface>>,
    capabilities: BTreeMap<InterfaceType, Arc<dyn Capability>>,
    steps: Vec<RegisteredStep>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.name)
            .field("interfaces", &self.capabilities.keys().collect::<Vec<_>>())
            .field("steps", &self.steps)
            .finish()
    }
}

impl Driver {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn power(&self) -> &Arc<dyn PowerInterface> {
        &self.power
    }

    pub fn deploy(&self) -> &Arc<dyn DeployInterface> {
        &self.deploy
    }

    pub fn management(
        &self,
    ) -> Result<&Arc<dyn ManagementInterface>, DriverError> {
        self.management.as_ref().ok_or_else(|| {
            missing(InterfaceType::Management, &self.name)
        })
    }

    pub fn console(&self) -> Result<&Arc<dyn ConsoleInterface>, DriverError> {
        self.console
            .as_ref()
            .ok_or_else(|| missing(InterfaceType::Console, &self.name))
    }

    pub fn rescue(&self) -> Result<&Arc<dyn RescueInterface>, DriverError> {
        self.rescue
            .as_ref()
            .ok_or_else(|| missing(InterfaceType::Rescue, &self.name))
    }

    pub fn inspect(&self) -> Result<&Arc<dyn InspectInterface>, DriverError> {
        self.inspect
            .as_ref()
            .ok_or_else(|| missing(InterfaceType::Inspect, &self.name))
    }

    pub fn vendor(&self) -> Result<&Arc<dyn VendorInterface>, DriverError> {
        self.vendor
            .as_ref()
            .ok_or_else(|| missing(InterfaceType::Vendor, &self.name))
    }

    /// Returns the capability for `interface`, if this driver has one
    pub fn capability(
        &self,
        interface: InterfaceType,
    ) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(&interface)
    }

    /// Returns every capability in interface order
    pub fn capabilities(
        &self,
    ) -> impl Iterator<Item = (&InterfaceType, &Arc<dyn Capability>)> {
        self.capabilities.iter()
    }

    /// Merges the properties of every capability
    pub fn properties(&self) -> BTreeMap<String, String> {
        self.capabilities
            .values()
            .flat_map(|capability| capability.get_properties())
            .collect()
    }

    /// Returns the registered steps of the given kind in declaration order
    ///
    /// Capabilities are taken in the order they were added to the
    /// [`DriverBuilder`], and each capability's steps in the order it lists
    /// them.  Steps of equal priority run in this order.
    pub fn steps(
        &self,
        kind: StepKind,
    ) -> impl Iterator<Item = &RegisteredStep> + '_ {
        self.steps.iter().filter(move |step| step.kind == kind)
    }

    pub fn find_step(
        &self,
        kind: StepKind,
        interface: InterfaceType,
        name: &str,
    ) -> Option<&RegisteredStep> {
        self.steps(kind)
            .find(|step| step.interface == interface && step.name == name)
    }

    /// Runs one step through the capability that declared it
    pub async fn execute_step(
        &self,
        task: &mut Task,
        step: &StepRecord,
    ) -> Result<StepOutcome, DriverError> {
        let capability = self.capability(step.interface).ok_or_else(|| {
            DriverError::unsupported(
                step.interface,
                &format!("step \"{}\"", step.name),
            )
        })?;
        capability.execute_step(task, step).await
    }
}

fn missing(interface: InterfaceType, driver: &str) -> DriverError {
    DriverError::unsupported(interface, &format!("driver \"{}\"", driver))
}

/// Builds a [`Driver`] from individual capabilities
///
/// Power and deploy capabilities are mandatory.  Steps are collected from each
/// capability when the driver is built, in the order the capabilities were
/// added.
pub struct DriverBuilder {
    name: String,
    power: Option<Arc<dyn PowerInterface>>,
    deploy: Option<Arc<dyn DeployInterface>>,
    management: Option<Arc<dyn ManagementInterface>>,
    console: Option<Arc<dyn ConsoleInterface>>,
    rescue: Option<Arc<dyn RescueInterface>>,
    inspect: Option<Arc<dyn InspectInterface>>,
    vendor: Option<Arc<dyn VendorInterface>>,
    /// in the order they were added
    capabilities: Vec<Arc<dyn Capability>>,
}

impl DriverBuilder {
    pub fn new(name: &str) -> DriverBuilder {
        DriverBuilder {
            name: name.to_owned(),
            power: None,
            deploy: None,
            management: None,
            console: None,
            rescue: None,
            inspect: None,
            vendor: None,
            capabilities: Vec::new(),
        }
    }

    /// Adding an interface a second time replaces the earlier capability,
    /// keeping its place in the order
    fn add_capability(&mut self, capability: Arc<dyn Capability>) {
        let interface = capability.interface();
        match self
            .capabilities
            .iter_mut()
            .find(|existing| existing.interface() == interface)
        {
            Some(existing) => *existing = capability,
            None => self.capabilities.push(capability),
        }
    }

    pub fn power<T: PowerInterface + 'static>(mut self, power: T) -> Self {
        let power = Arc::new(power);
        self.add_capability(power.clone());
        self.power = Some(power);
        self
    }

    pub fn deploy<T: DeployInterface + 'static>(mut self, deploy: T) -> Self {
        let deploy = Arc::new(deploy);
        self.add_capability(deploy.clone());
        self.deploy = Some(deploy);
        self
    }

    pub fn management<T: ManagementInterface + 'static>(
        mut self,
        management: T,
    ) -> Self {
        let management = Arc::new(management);
        self.add_capability(management.clone());
        self.management = Some(management);
        self
    }

    pub fn console<T: ConsoleInterface + 'static>(mut self, console: T) -> Self {
        let console = Arc::new(console);
        self.add_capability(console.clone());
        self.console = Some(console);
        self
    }

    pub fn rescue<T: RescueInterface + 'static>(mut self, rescue: T) -> Self {
        let rescue = Arc::new(rescue);
        self.add_capability(rescue.clone());
        self.rescue = Some(rescue);
        self
    }

    pub fn inspect<T: InspectInterface + 'static>(mut self, inspect: T) -> Self {
        let inspect = Arc::new(inspect);
        self.add_capability(inspect.clone());
        self.inspect = Some(inspect);
        self
    }

    pub fn vendor<T: VendorInterface + 'static>(mut self, vendor: T) -> Self {
        let vendor = Arc::new(vendor);
        self.add_capability(vendor.clone());
        self.vendor = Some(vendor);
        self
    }

    pub fn build(self) -> Result<Driver, DriverLoadError> {
        let DriverBuilder {
            name,
            power,
            deploy,
            management,
            console,
            rescue,
            inspect,
            vendor,
            capabilities,
        } = self;

        let power = power.ok_or_else(|| DriverLoadError::MissingInterface {
            driver: name.clone(),
            interface: InterfaceType::Power,
        })?;
        let deploy = deploy.ok_or_else(|| {
            DriverLoadError::MissingInterface {
                driver: name.clone(),
                interface: InterfaceType::Deploy,
            }
        })?;

        let mut steps: Vec<RegisteredStep> = Vec::new();
        for capability in &capabilities {
            let interface = capability.interface();
            for definition in capability.steps() {
                let duplicate = steps.iter().any(|step| {
                    step.kind == definition.kind
                        && step.interface == interface
                        && step.name == definition.name
                });
                if duplicate {
                    return Err(DriverLoadError::DuplicateStep {
                        driver: name,
                        kind: definition.kind,
                        step: format!("{}.{}", interface, definition.name),
                    });
                }

                let position = steps.len();
                steps.push(RegisteredStep {
                    name: definition.name,
                    interface,
                    priority: definition.priority,
                    kind: definition.kind,
                    asynchronous: definition.asynchronous,
                    position,
                });
            }
        }

        Ok(Driver {
            name,
            power,
            deploy,
            management,
            console,
            rescue,
            inspect,
            vendor,
            capabilities: capabilities
                .into_iter()
                .map(|capability| (capability.interface(), capability))
                .collect(),
            steps,
        })
    }
}

/// Constructs a driver by name
pub type DriverFactory =
    Box<dyn Fn(&Logger) -> Result<Driver, DriverLoadError> + Send + Sync>;

/// Driver constructors, keyed by the name used in configuration
pub type DriverFactories = BTreeMap<String, DriverFactory>;

/// The drivers this conductor loaded
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<Driver>>,
    load_errors: BTreeMap<String, DriverLoadError>,
}

impl DriverRegistry {
    /// Assembles every driver named in `config`
    ///
    /// A driver that fails to load is logged and recorded in
    /// [`DriverRegistry::load_errors()`]; the other drivers remain usable.
    pub fn new(
        log: &Logger,
        config: &DriversConfig,
        factories: &DriverFactories,
    ) -> DriverRegistry {
        let mut drivers = BTreeMap::new();
        let mut load_errors = BTreeMap::new();

        for name in &config.enabled {
            let result = if drivers.contains_key(name)
                || load_errors.contains_key(name)
            {
                Err(DriverLoadError::DuplicateDriver { driver: name.clone() })
            } else {
                match factories.get(name) {
                    Some(factory) => factory(log),
                    None => Err(DriverLoadError::UnknownDriver {
                        driver: name.clone(),
                    }),
                }
            };

            match result {
                Ok(driver) => {
                    info!(
                        log,
                        "loaded driver";
                        "driver" => name,
                        "interfaces" => ?driver.capabilities.keys().collect::<Vec<_>>(),
                        "steps" => driver.steps.len(),
                    );
                    drivers.insert(name.clone(), Arc::new(driver));
                }
                Err(error @ DriverLoadError::DuplicateDriver { .. }) => {
                    warn!(log, "ignoring driver"; "error" => %error);
                }
                Err(error) => {
                    error!(
                        log,
                        "failed to load driver";
                        "driver" => name,
                        "error" => %error,
                    );
                    load_errors.insert(name.clone(), error);
                }
            }
        }

        DriverRegistry { drivers, load_errors }
    }

    pub fn get(&self, name: &str) -> LookupResult<Arc<Driver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found_by_name(ResourceType::Driver, name))
    }

    pub fn driver_names(&self) -> impl Iterator<Item = &String> {
        self.drivers.keys()
    }

    pub fn load_errors(&self) -> &BTreeMap<String, DriverLoadError> {
        &self.load_errors
    }
}
