// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node enrollment, removal, and the hardware operations that do not move a
//! node through the provisioning state machine

use super::drivers::interfaces::ConsoleInfo;
use super::finish;
use super::task::Task;
use super::Conductor;
use conductor_common::api::external::CreateResult;
use conductor_common::api::external::DeleteResult;
use conductor_common::api::external::Error;
use conductor_common::api::external::ListResultVec;
use conductor_common::api::external::LookupResult;
use conductor_common::api::external::ResourceType;
use conductor_common::api::external::UpdateResult;
use conductor_db_queries::context::OpContext;
use conductor_db_queries::db::NodeFilter;
use conductor_types::node::BootDevice;
use conductor_types::node::BootDeviceInfo;
use conductor_types::node::Node;
use conductor_types::node::NodeCreate;
use conductor_types::node::NodePatch;
use conductor_types::node::PowerState;
use conductor_types::reservation::LeaseMode;
use conductor_types::step::InterfaceType;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Result of validating one of a node's interfaces
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct InterfaceValidation {
    /// `None` if the node's driver does not implement the interface
    pub result: Option<bool>,
    pub reason: Option<String>,
}

impl Conductor {
    /// Enrolls a new node
    ///
    /// The node starts out ENROLLED.  Its driver must be one this conductor
    /// loaded.
    pub async fn node_enroll(
        &self,
        opctx: &OpContext,
        params: NodeCreate,
    ) -> CreateResult<Node> {
        if self.drivers().get(&params.driver).is_err() {
            return Err(Error::invalid_value(
                "driver",
                &format!("driver \"{}\" is not loaded", params.driver),
            ));
        }
        let node = self.datastore.node_create(opctx, params).await?;
        info!(opctx.log, "enrolled node";
            "node_id" => %node.id, "driver" => &node.driver);
        Ok(node)
    }

    pub async fn node_fetch(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LookupResult<Node> {
        self.datastore.node_fetch(opctx, node_id).await
    }

    pub async fn node_list(
        &self,
        opctx: &OpContext,
        filter: &NodeFilter,
    ) -> ListResultVec<Node> {
        self.datastore.node_list(opctx, filter).await
    }

    /// Changes a node's configuration
    ///
    /// A new driver must be one this conductor loaded, and its power
    /// interface must accept the node as patched before anything is stored.
    /// Changing which instance the node is associated with requires the node
    /// to be powered off.
    pub async fn node_update(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        patch: NodePatch,
    ) -> UpdateResult<Node> {
        let mut task = self.lease(opctx, node_id, LeaseMode::Exclusive).await?;
        let result = self.node_update_locked(&mut task, patch).await;
        finish(task, result).await
    }

    async fn node_update_locked(
        &self,
        task: &mut Task,
        patch: NodePatch,
    ) -> UpdateResult<Node> {
        let NodePatch {
            driver,
            driver_info,
            instance_info,
            instance,
            properties,
            extra,
        } = patch;

        let new_driver = match driver {
            Some(name) if name != task.node().driver => {
                Some(self.drivers().get(&name).map_err(|_| {
                    Error::invalid_value(
                        "driver",
                        &format!("driver \"{}\" is not loaded", name),
                    )
                })?)
            }
            _ => None,
        };
        let driver_changed = new_driver.is_some();
        if let Some(driver) = new_driver {
            task.set_driver(driver);
        }

        let node = task.node_mut();
        if let Some(driver_info) = driver_info {
            node.driver_info = driver_info;
        }
        if let Some(instance_info) = instance_info {
            node.instance_info = instance_info;
        }
        if let Some(properties) = properties {
            node.properties = properties;
        }
        if let Some(extra) = extra {
            node.extra = extra;
        }

        let driver = Arc::clone(task.driver());
        if driver_changed || instance.is_some() {
            driver.power().validate(task).await?;
        }
        if let Some(association) = instance {
            let power = driver.power().get_power_state(task).await?;
            task.node_mut().power_state = Some(power);
            if power != PowerState::PowerOff {
                return Err(Error::invalid_request(&format!(
                    "node must be powered off to change its instance \
                    association, but its power state is \"{}\"",
                    power
                )));
            }
            task.node_mut().instance_id = association.instance_id();
        }

        task.save().await?;
        info!(task.log(), "updated node";
            "driver" => &task.node().driver,
            "instance_id" => ?task.node().instance_id);
        Ok(task.node().clone())
    }

    /// Removes a node
    ///
    /// Its console is stopped first.  Nodes in the middle of a lifecycle pass
    /// can only be removed while in maintenance.
    pub async fn node_delete(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> DeleteResult {
        let mut task = self.lease(opctx, node_id, LeaseMode::Exclusive).await?;
        let result = self.node_delete_locked(&mut task).await;
        finish(task, result).await
    }

    async fn node_delete_locked(&self, task: &mut Task) -> DeleteResult {
        let node = task.node();
        if !node.provision_state.is_deletable() && !node.maintenance {
            return Err(Error::invalid_request(&format!(
                "cannot delete node in state \"{}\" unless it is in \
                maintenance",
                node.provision_state
            )));
        }

        if node.console_enabled {
            let driver = Arc::clone(task.driver());
            if let Ok(console) = driver.console() {
                if let Err(error) = console.stop_console(task).await {
                    warn!(
                        task.log(),
                        "failed to stop console of deleted node";
                        "error" => %error,
                    );
                }
            }
        }

        self.datastore
            .node_destroy(task.opctx(), task.node_id(), task.holder())
            .await
    }

    /// Puts a node into maintenance (or takes it out)
    pub async fn node_set_maintenance(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        maintenance: bool,
        reason: Option<String>,
    ) -> UpdateResult<Node> {
        let mut task = self.lease(opctx, node_id, LeaseMode::Exclusive).await?;
        let node = task.node_mut();
        node.maintenance = maintenance;
        node.maintenance_reason = if maintenance { reason } else { None };
        let result = task.save().await.map(|()| task.node().clone());
        if result.is_ok() {
            info!(task.log(), "set maintenance"; "maintenance" => maintenance);
        }
        finish(task, result).await
    }

    /// Validates each of a node's interfaces
    pub async fn validate_driver_interfaces(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LookupResult<BTreeMap<InterfaceType, InterfaceValidation>> {
        let task = self.lease(opctx, node_id, LeaseMode::Shared).await?;
        let driver = Arc::clone(task.driver());
        let mut results = BTreeMap::new();
        for interface in InterfaceType::ALL {
            let validation = match driver.capability(interface) {
                None => InterfaceValidation {
                    result: None,
                    reason: Some(format!(
                        "not supported by driver \"{}\"",
                        driver.name()
                    )),
                },
                Some(capability) => match capability.validate(&task).await {
                    Ok(()) => {
                        InterfaceValidation { result: Some(true), reason: None }
                    }
                    Err(error) => InterfaceValidation {
                        result: Some(false),
                        reason: Some(error.to_string()),
                    },
                },
            };
            results.insert(interface, validation);
        }
        finish(task, Ok(results)).await
    }

    /// Calls a method of the node's vendor interface
    ///
    /// Methods that modify the node run under an exclusive lease, others
    /// under a shared one.
    pub async fn vendor_passthru(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        method: &str,
        args: &BTreeMap<String, serde_json::Value>,
    ) -> UpdateResult<serde_json::Value> {
        let mut task = self.lease(opctx, node_id, LeaseMode::Shared).await?;
        let result = self.vendor_passthru_locked(&mut task, method, args).await;
        finish(task, result).await
    }

    async fn vendor_passthru_locked(
        &self,
        task: &mut Task,
        method: &str,
        args: &BTreeMap<String, serde_json::Value>,
    ) -> UpdateResult<serde_json::Value> {
        let driver = Arc::clone(task.driver());
        let vendor = driver.vendor()?;
        let exclusive = vendor
            .methods()
            .into_iter()
            .find(|m| m.name == method)
            .map(|m| m.exclusive)
            .ok_or_else(|| {
                Error::not_found_by_name(ResourceType::VendorMethod, method)
            })?;

        if exclusive {
            self.tasks.upgrade(task).await?;
        }
        debug!(task.log(), "calling vendor method";
            "method" => method, "exclusive" => exclusive);
        let value = vendor.call(task, method, args).await?;
        if exclusive {
            task.save().await?;
        }
        Ok(value)
    }

    /// Starts or stops the node's console
    pub async fn set_console_mode(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        enabled: bool,
    ) -> UpdateResult<()> {
        let mut task = self.lease(opctx, node_id, LeaseMode::Exclusive).await?;
        let result = set_console_mode_locked(&mut task, enabled).await;
        finish(task, result).await
    }

    /// Returns how to reach the node's console, which must be enabled
    pub async fn get_console_information(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LookupResult<ConsoleInfo> {
        let task = self.lease(opctx, node_id, LeaseMode::Shared).await?;
        let result = console_information(&task).await;
        finish(task, result).await
    }

    /// Sets the device the node boots from next
    pub async fn node_set_boot_device(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        device: BootDevice,
        persistent: bool,
    ) -> UpdateResult<()> {
        let mut task = self.lease(opctx, node_id, LeaseMode::Exclusive).await?;
        let result = set_boot_device_locked(&mut task, device, persistent).await;
        finish(task, result).await
    }

    pub async fn node_get_boot_device(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LookupResult<BootDeviceInfo> {
        let task = self.lease(opctx, node_id, LeaseMode::Shared).await?;
        let result = boot_device(&task).await;
        finish(task, result).await
    }

    pub async fn node_get_supported_boot_devices(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LookupResult<Vec<BootDevice>> {
        let task = self.lease(opctx, node_id, LeaseMode::Shared).await?;
        let result = supported_boot_devices(&task).await;
        finish(task, result).await
    }

    pub async fn node_get_sensors_data(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> LookupResult<BTreeMap<String, serde_json::Value>> {
        let task = self.lease(opctx, node_id, LeaseMode::Shared).await?;
        let result = sensors_data(&task).await;
        finish(task, result).await
    }
}

async fn set_console_mode_locked(
    task: &mut Task,
    enabled: bool,
) -> UpdateResult<()> {
    let driver = Arc::clone(task.driver());
    let console = driver.console()?;
    if task.node().console_enabled == enabled {
        debug!(task.log(), "console already in requested mode";
            "enabled" => enabled);
        return Ok(());
    }

    let result = if enabled {
        console.start_console(task).await
    } else {
        console.stop_console(task).await
    };
    match result {
        Ok(()) => {
            let node = task.node_mut();
            node.console_enabled = enabled;
            node.last_error = None;
            task.save().await
        }
        Err(error) => {
            let operation = if enabled { "start" } else { "stop" };
            error!(task.log(), "console operation failed";
                "operation" => operation, "error" => %error);
            task.node_mut().last_error =
                Some(format!("failed to {} console: {}", operation, error));
            task.save().await?;
            Err(error.into())
        }
    }
}

async fn console_information(task: &Task) -> LookupResult<ConsoleInfo> {
    let driver = Arc::clone(task.driver());
    let console = driver.console()?;
    if !task.node().console_enabled {
        return Err(Error::invalid_request(
            "console is not enabled for this node",
        ));
    }
    Ok(console.get_console(task).await?)
}

async fn set_boot_device_locked(
    task: &mut Task,
    device: BootDevice,
    persistent: bool,
) -> UpdateResult<()> {
    let driver = Arc::clone(task.driver());
    let management = driver.management()?;
    let supported = management.get_supported_boot_devices(task).await?;
    if !supported.contains(&device) {
        return Err(Error::invalid_value(
            "boot_device",
            &format!(
                "{:?} is not supported by driver \"{}\"",
                device,
                driver.name()
            ),
        ));
    }
    management.set_boot_device(task, device, persistent).await?;
    Ok(())
}

async fn boot_device(task: &Task) -> LookupResult<BootDeviceInfo> {
    let driver = Arc::clone(task.driver());
    Ok(driver.management()?.get_boot_device(task).await?)
}

async fn supported_boot_devices(task: &Task) -> LookupResult<Vec<BootDevice>> {
    let driver = Arc::clone(task.driver());
    Ok(driver.management()?.get_supported_boot_devices(task).await?)
}

async fn sensors_data(
    task: &Task,
) -> LookupResult<BTreeMap<String, serde_json::Value>> {
    let driver = Arc::clone(task.driver());
    Ok(driver.management()?.get_sensors_data(task).await?)
}
