// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures shared by the conductor's unit tests

use super::drivers::fake;
use super::drivers::fake::FakeHardware;
use super::drivers::DriverRegistry;
use super::task_manager::TaskManager;
use super::Conductor;
use conductor_common::api::external::Error;
use conductor_test_utils::dev::poll::wait_for_condition;
use conductor_test_utils::dev::poll::CondCheckError;
use camino::Utf8PathBuf;
use conductor_config::Config;
use conductor_db_queries::context::OpContext;
use conductor_db_queries::db::ConductorLiveness;
use conductor_db_queries::db::DataStore;
use conductor_types::node::Blob;
use conductor_types::node::Node;
use conductor_types::node::NodeCreate;
use conductor_types::node::ProvisionState;
use conductor_types::step::StepCompletion;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Loads the configuration the test suite runs with
pub fn load_test_config() -> Config {
    let path = Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("config.test.toml");
    Config::from_file(&path)
        .unwrap_or_else(|error| panic!("loading {}: {}", path, error))
}

/// A store, a driver registry with the fake drivers, and a task manager
/// wired together, without a running conductor
pub struct TestHarness {
    pub config: Config,
    pub opctx: OpContext,
    pub datastore: Arc<DataStore>,
    pub hardware: FakeHardware,
    pub tasks: Arc<TaskManager>,
    pub completions: mpsc::UnboundedReceiver<StepCompletion>,
}

impl TestHarness {
    pub async fn new<F>(log: &Logger, adjust: F) -> TestHarness
    where
        F: FnOnce(&mut Config),
    {
        let mut config = load_test_config();
        adjust(&mut config);

        let opctx = OpContext::for_tests(log.clone());
        let datastore = Arc::new(DataStore::new(log));
        let instance = Uuid::new_v4();
        datastore
            .conductor_register(
                &opctx,
                &config.conductor.hostname,
                instance,
                vec![],
            )
            .await
            .unwrap();
        let hardware = FakeHardware::default();
        let drivers = Arc::new(DriverRegistry::new(
            log,
            &config.drivers,
            &fake::factories(hardware.clone()),
        ));
        let liveness = Arc::new(ConductorLiveness::new(
            Arc::clone(&datastore),
            config.conductor.heartbeat_timeout,
        ));
        let (tx, completions) = mpsc::unbounded_channel();
        let tasks = Arc::new(TaskManager::new(
            log,
            Arc::clone(&datastore),
            drivers,
            liveness,
            &config.conductor,
            instance,
            tx,
        ));
        TestHarness { config, opctx, datastore, hardware, tasks, completions }
    }

    pub async fn create_node(&self, driver: &str) -> Node {
        self.datastore
            .node_create(
                &self.opctx,
                NodeCreate { driver: driver.to_owned(), ..Default::default() },
            )
            .await
            .unwrap()
    }

    /// Creates a node and puts it straight into `state`
    pub async fn create_node_in<I>(
        &self,
        driver: &str,
        state: ProvisionState,
        driver_info: I,
    ) -> Node
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        create_node_in(&self.datastore, &self.opctx, driver, state, driver_info)
            .await
    }
}

async fn create_node_in<I>(
    datastore: &DataStore,
    opctx: &OpContext,
    driver: &str,
    state: ProvisionState,
    driver_info: I,
) -> Node
where
    I: IntoIterator<Item = (String, serde_json::Value)>,
{
    let node = datastore
        .node_create(
            opctx,
            NodeCreate {
                driver: driver.to_owned(),
                driver_info: driver_info.into_iter().collect::<Blob>(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut update = node.to_update();
    update.provision_state = state;
    datastore
        .node_update_if_current(opctx, node.id, node.generation, update)
        .await
        .unwrap()
        .found
}

/// A running conductor over the fake drivers
pub struct TestConductor {
    pub conductor: Arc<Conductor>,
    pub opctx: OpContext,
    pub hardware: FakeHardware,
}

pub async fn test_conductor<F>(log: &Logger, adjust: F) -> TestConductor
where
    F: FnOnce(&mut Config),
{
    let mut config = load_test_config();
    adjust(&mut config);
    let hardware = FakeHardware::default();
    let conductor = Conductor::new(
        log.clone(),
        &config,
        Arc::new(DataStore::new(log)),
        &fake::factories(hardware.clone()),
    )
    .await
    .unwrap();
    TestConductor {
        conductor,
        opctx: OpContext::for_tests(log.clone()),
        hardware,
    }
}

impl TestConductor {
    pub async fn create_node_in(
        &self,
        driver: &str,
        state: ProvisionState,
    ) -> Node {
        self.create_node_with(driver, state, std::iter::empty()).await
    }

    pub async fn create_node_with<I>(
        &self,
        driver: &str,
        state: ProvisionState,
        driver_info: I,
    ) -> Node
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        create_node_in(
            self.conductor.datastore(),
            &self.opctx,
            driver,
            state,
            driver_info,
        )
        .await
    }

    /// Waits for the node to settle, unreserved, in `state`
    pub async fn wait_for_state(
        &self,
        node_id: Uuid,
        state: ProvisionState,
    ) -> Node {
        wait_for_condition::<_, Error, _, _>(
            || async {
                let node =
                    self.conductor.node_fetch(&self.opctx, node_id).await?;
                if node.provision_state == state && node.reservation.is_none()
                {
                    Ok(node)
                } else {
                    Err(CondCheckError::NotYet)
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(10),
        )
        .await
        .unwrap_or_else(|error| {
            panic!("node {} never settled in {}: {}", node_id, state, error)
        })
    }
}
