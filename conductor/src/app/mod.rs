// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The conductor: lifecycle and hardware operations on nodes, run under
//! leases

use self::background::BackgroundTasks;
use self::background::BackgroundTasksData;
use self::background::CallbackTimeouts;
use self::drivers::DriverFactories;
use self::drivers::DriverRegistry;
use self::lifecycle::Engine;
use self::task::Task;
use self::task_manager::TaskManager;
use self::worker_pool::WorkerPermit;
use self::worker_pool::WorkerPool;
use conductor_common::api::external::Error;
use conductor_common::backoff::internal_service_policy_short;
use conductor_common::backoff::retry_notify;
use conductor_common::backoff::BackoffError;
use conductor_config::Config;
use conductor_config::ConductorConfig;
use conductor_db_queries::context::OpContext;
use conductor_db_queries::db::ConductorLiveness;
use conductor_db_queries::db::DataStore;
use conductor_types::reservation::LeaseMode;
use conductor_types::step::StepCompletion;
use slog::Logger;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod background;
pub mod drivers;
pub mod lifecycle;
mod node;
mod power;
mod provision;
pub mod task;
pub mod task_manager;
pub mod worker_pool;

#[cfg(test)]
pub(crate) mod test_util;

pub use node::InterfaceValidation;

/// How long a step completion is redelivered while the node stays busy
const COMPLETION_RETRY_LIMIT: Duration = Duration::from_secs(300);

/// Manages the nodes of a bare-metal deployment
pub struct Conductor {
    /// general server log
    log: Logger,
    hostname: String,
    /// persistent storage for nodes and conductors
    datastore: Arc<DataStore>,
    /// hands out node leases
    tasks: Arc<TaskManager>,
    /// drives nodes through the provisioning state machine
    engine: Arc<Engine>,
    /// runs operations that outlive the request that started them
    workers: WorkerPool,
    config: ConductorConfig,
    background_tasks: BackgroundTasks,
    /// delivers step completions reported by drivers
    completion_loop: tokio::task::JoinHandle<()>,
}

impl Conductor {
    /// Assembles the drivers, registers this conductor, and starts its
    /// background tasks
    pub async fn new(
        log: Logger,
        config: &Config,
        datastore: Arc<DataStore>,
        factories: &DriverFactories,
    ) -> Result<Arc<Conductor>, Error> {
        let conductor_config = &config.conductor;
        let hostname = conductor_config.hostname.clone();
        let log = log.new(o!("conductor" => hostname.clone()));

        let drivers = Arc::new(DriverRegistry::new(
            &log.new(o!("component" => "DriverRegistry")),
            &config.drivers,
            factories,
        ));
        let driver_names: Vec<String> = drivers.driver_names().cloned().collect();
        if driver_names.is_empty() {
            return Err(Error::invalid_value(
                "drivers.enabled",
                "none of the configured drivers could be loaded",
            ));
        }

        // Leases minted by an earlier process under this hostname carry a
        // different instance and are reclaimable once their grace expires.
        let instance = Uuid::new_v4();
        let opctx = OpContext::for_background(
            log.new(o!("component" => "ConductorRegistration")),
        );
        datastore
            .conductor_register(
                &opctx,
                &hostname,
                instance,
                driver_names.clone(),
            )
            .await?;

        let liveness = Arc::new(ConductorLiveness::new(
            Arc::clone(&datastore),
            conductor_config.heartbeat_timeout,
        ));
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let tasks = Arc::new(TaskManager::new(
            &log,
            Arc::clone(&datastore),
            drivers,
            liveness,
            conductor_config,
            instance,
            completions_tx,
        ));
        let engine = Arc::new(Engine::new(conductor_config.automated_clean));

        let background_tasks = BackgroundTasks::start(
            &OpContext::for_background(
                log.new(o!("component" => "BackgroundTasks")),
            ),
            &config.background_tasks,
            BackgroundTasksData {
                hostname: hostname.clone(),
                instance,
                drivers: driver_names,
                datastore: Arc::clone(&datastore),
                tasks: Arc::clone(&tasks),
                engine: Arc::clone(&engine),
                callback_timeouts: CallbackTimeouts {
                    deploy: conductor_config.deploy_callback_timeout,
                    clean: conductor_config.clean_callback_timeout,
                    rescue: conductor_config.rescue_callback_timeout,
                },
            },
        );

        info!(log, "conductor started";
            "instance" => %instance,
            "workers" => conductor_config.workers_pool_size);
        Ok(Arc::new_cyclic(|conductor| Conductor {
            log: log.clone(),
            hostname,
            datastore,
            tasks,
            engine,
            workers: WorkerPool::new(conductor_config.workers_pool_size),
            config: conductor_config.clone(),
            background_tasks,
            completion_loop: tokio::spawn(completion_loop(
                log.new(o!("component" => "StepCompletions")),
                conductor.clone(),
                completions_rx,
            )),
        }))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.datastore
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        self.tasks.drivers()
    }

    pub fn background_tasks(&self) -> &BackgroundTasks {
        &self.background_tasks
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    /// Returns an operation context for work done on behalf of `request_id`
    pub fn opctx_for_request(&self, request_id: &str) -> OpContext {
        OpContext::for_request(&self.log, request_id)
    }

    /// Stops accepting new operations and removes this conductor from the
    /// conductor registry
    ///
    /// Operations already running are left to finish.  Once the registry
    /// entry is gone, other conductors may reclaim any leases this one still
    /// holds.
    pub async fn shutdown(&self) -> Result<(), Error> {
        info!(self.log, "conductor shutting down");
        self.workers.close();
        let opctx = OpContext::for_background(self.log.clone());
        self.datastore.conductor_unregister(&opctx, &self.hostname).await
    }

    /// Reserves a worker and takes an exclusive lease on `node_id`
    ///
    /// The worker comes first, so that a conductor with no free worker turns
    /// the request away before anything about the node has changed.
    async fn lease_for_operation(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
    ) -> Result<(WorkerPermit, Task), Error> {
        let permit = self.workers.try_reserve()?;
        let task = self.lease(opctx, node_id, LeaseMode::Exclusive).await?;
        Ok((permit, task))
    }

    async fn lease(
        &self,
        opctx: &OpContext,
        node_id: Uuid,
        mode: LeaseMode,
    ) -> Result<Task, Error> {
        let holder = self.tasks.new_holder();
        self.tasks.acquire(opctx, node_id, mode, &holder, None).await
    }

    /// Delivers a step completion reported through the completion channel,
    /// retrying while the node is busy
    async fn deliver_completion(&self, log: &Logger, completion: StepCompletion) {
        let opctx = OpContext::for_background(log.new(o!(
            "node_id" => completion.node_id.to_string(),
            "kind" => completion.kind.to_string(),
            "step_index" => completion.step_index,
        )));
        let mut policy = internal_service_policy_short();
        policy.max_elapsed_time = Some(COMPLETION_RETRY_LIMIT);

        let result = retry_notify(
            policy,
            || async {
                self.continue_node_step(&opctx, completion.clone()).await.map_err(
                    |error| {
                        if error.retryable() {
                            BackoffError::transient(error)
                        } else {
                            BackoffError::permanent(error)
                        }
                    },
                )
            },
            |error: Error, delay: Duration| {
                debug!(
                    opctx.log,
                    "step completion not delivered yet, will retry";
                    "error" => %error,
                    "retry_after" => ?delay,
                );
            },
        )
        .await;

        match result {
            Ok(Some(state)) => {
                debug!(opctx.log, "step completion delivered";
                    "provision_state" => %state);
            }
            Ok(None) => (),
            Err(error) => {
                error!(
                    opctx.log,
                    "giving up on step completion";
                    "error" => %error,
                );
            }
        }
    }
}

impl Drop for Conductor {
    fn drop(&mut self) {
        self.completion_loop.abort();
    }
}

/// Receives step completions and delivers each one from its own task
async fn completion_loop(
    log: Logger,
    conductor: Weak<Conductor>,
    mut completions: mpsc::UnboundedReceiver<StepCompletion>,
) {
    while let Some(completion) = completions.recv().await {
        let Some(conductor) = conductor.upgrade() else {
            break;
        };
        let log = log.clone();
        tokio::spawn(async move {
            conductor.deliver_completion(&log, completion).await;
        });
    }
    debug!(log, "step completion channel closed");
}

/// Releases `task`'s lease, then returns `result`
///
/// An error from the operation takes precedence over an error releasing the
/// lease.
async fn finish<T>(task: Task, result: Result<T, Error>) -> Result<T, Error> {
    let released = task.release().await;
    let value = result?;
    released?;
    Ok(value)
}
