// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task initialization

use super::tasks::async_step_timeouts;
use super::tasks::conductor_heartbeat;
use super::tasks::power_state_sync;
use super::tasks::reservation_reaper;
use super::Driver;
use super::TaskDefinition;
use super::TaskMode;
use super::TaskName;
use crate::app::lifecycle::Engine;
use crate::app::task_manager::TaskManager;
use conductor_config::BackgroundTaskConfig;
use conductor_db_queries::context::OpContext;
use conductor_db_queries::db::DataStore;
use conductor_types::background::TaskStatus;
use std::sync::Arc;
use uuid::Uuid;

pub use async_step_timeouts::CallbackTimeouts;

/// Everything the background tasks need from the rest of the conductor
pub struct BackgroundTasksData {
    pub hostname: String,
    /// registry instance of this conductor process
    pub instance: Uuid,
    /// names of the drivers this conductor loaded, as advertised in the
    /// conductor registry
    pub drivers: Vec<String>,
    pub datastore: Arc<DataStore>,
    pub tasks: Arc<TaskManager>,
    pub engine: Arc<Engine>,
    pub callback_timeouts: CallbackTimeouts,
}

/// The conductor's background tasks, along with the [`Driver`] running them
pub struct BackgroundTasks {
    driver: Driver,

    pub task_conductor_heartbeat: TaskName,
    pub task_reservation_reaper: TaskName,
    pub task_power_state_sync: TaskName,
    pub task_async_step_timeouts: TaskName,
}

impl BackgroundTasks {
    /// Kick off all background tasks
    pub fn start(
        opctx: &OpContext,
        config: &BackgroundTaskConfig,
        data: BackgroundTasksData,
    ) -> BackgroundTasks {
        let BackgroundTasksData {
            hostname,
            instance,
            drivers,
            datastore,
            tasks,
            engine,
            callback_timeouts,
        } = data;
        let mut driver = Driver::new(config.max_concurrent);

        // The heartbeat is quick, and must not be starved of a slot by slow
        // sweeps: other conductors reclaim our leases if it stops.
        let task_conductor_heartbeat = driver.register(TaskDefinition {
            name: String::from("conductor_heartbeat"),
            description: String::from(
                "records that this conductor is alive in the conductor \
                registry",
            ),
            period: config.conductor_heartbeat.period_secs,
            mode: TaskMode::Inline,
            allow_overlap: false,
            task: Arc::new(conductor_heartbeat::ConductorHeartbeat::new(
                Arc::clone(&datastore),
                hostname,
                instance,
                drivers,
            )),
            opctx: opctx.clone(),
        });

        let task_reservation_reaper = driver.register(TaskDefinition {
            name: String::from("reservation_reaper"),
            description: String::from(
                "reclaims node leases of workers that went away and fails \
                nodes whose operations were orphaned",
            ),
            period: config.reservation_reaper.period_secs,
            mode: TaskMode::Dedicated,
            allow_overlap: false,
            task: Arc::new(reservation_reaper::ReservationReaper::new(
                Arc::clone(&datastore),
                Arc::clone(&tasks),
                Arc::clone(&engine),
            )),
            opctx: opctx.clone(),
        });

        let task_power_state_sync = driver.register(TaskDefinition {
            name: String::from("power_state_sync"),
            description: String::from(
                "records power state changes made outside of the conductor",
            ),
            period: config.power_state_sync.period_secs,
            mode: TaskMode::Dedicated,
            allow_overlap: false,
            task: Arc::new(power_state_sync::PowerStateSync::new(
                Arc::clone(&datastore),
                Arc::clone(&tasks),
                Arc::clone(&engine),
                config.power_state_sync.max_concurrent_nodes,
            )),
            opctx: opctx.clone(),
        });

        let task_async_step_timeouts = driver.register(TaskDefinition {
            name: String::from("async_step_timeouts"),
            description: String::from(
                "fails nodes whose asynchronous steps did not report back in \
                time",
            ),
            period: config.async_step_timeouts.period_secs,
            mode: TaskMode::Dedicated,
            allow_overlap: false,
            task: Arc::new(async_step_timeouts::AsyncStepTimeouts::new(
                datastore,
                tasks,
                engine,
                callback_timeouts,
            )),
            opctx: opctx.clone(),
        });

        BackgroundTasks {
            driver,
            task_conductor_heartbeat,
            task_reservation_reaper,
            task_power_state_sync,
            task_async_step_timeouts,
        }
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Activate the specified background task
    pub fn activate(&self, task: &TaskName) {
        self.driver.activate(task);
    }

    pub fn task_status(&self, task: &TaskName) -> TaskStatus {
        self.driver.task_status(task)
    }

    /// Enumerate all registered background tasks
    pub fn tasks(&self) -> impl Iterator<Item = &TaskName> {
        self.driver.tasks()
    }
}
