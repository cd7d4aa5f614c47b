// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests that run a conductor through its public interface

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use conductor::Config;
use conductor::Server;
use conductor_common::api::external::Error;
use conductor_test_utils::dev;
use conductor_test_utils::dev::poll::wait_for_condition;
use conductor_test_utils::dev::poll::CondCheckError;
use conductor_types::node::NodeCreate;
use conductor_types::node::PowerAction;
use conductor_types::node::PowerState;
use conductor_types::node::ProvisionState;
use conductor_types::step::InterfaceType;
use std::time::Duration;

fn test_config() -> Config {
    let path = Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("config.test.toml");
    Config::from_file(&path).unwrap()
}

#[tokio::test]
async fn test_server_lifecycle() {
    let logctx = dev::test_setup_log("test_server_lifecycle");
    let config = test_config();
    let server = Server::start(&config, &logctx.log).await.unwrap();
    let conductor = server.conductor();
    assert_eq!(conductor.hostname(), "conductor-test");
    assert_eq!(
        conductor.drivers().driver_names().collect::<Vec<_>>(),
        ["fake", "fake-async"]
    );

    let opctx = conductor.opctx_for_request("test-request");
    let node = conductor
        .node_enroll(
            &opctx,
            NodeCreate { driver: String::from("fake"), ..Default::default() },
        )
        .await
        .unwrap();

    let validation =
        conductor.validate_driver_interfaces(&opctx, node.id).await.unwrap();
    assert!(validation.values().all(|v| v.result == Some(true)));
    assert_eq!(validation.len(), InterfaceType::ALL.len());

    for (operation, expected) in [
        ("manage", ProvisionState::Manageable),
        ("provide", ProvisionState::Available),
        ("deploy", ProvisionState::Active),
    ] {
        let handle = match operation {
            "manage" => conductor.manage(&opctx, node.id).await,
            "provide" => conductor.provide(&opctx, node.id).await,
            _ => conductor.deploy(&opctx, node.id).await,
        };
        let state = handle.unwrap().wait().await.unwrap();
        assert_eq!(state, expected, "after {}", operation);
    }

    let power = conductor
        .change_node_power_state(&opctx, node.id, PowerAction::PowerOn)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(power, PowerState::PowerOn);

    // Every background task gets activated when the conductor starts.
    let background = conductor.background_tasks();
    let names: Vec<_> = background.tasks().map(|t| t.to_string()).collect();
    assert_eq!(
        names,
        [
            "async_step_timeouts",
            "conductor_heartbeat",
            "power_state_sync",
            "reservation_reaper",
        ]
    );
    wait_for_condition::<_, (), _, _>(
        || async {
            if background
                .task_status(&background.task_conductor_heartbeat)
                .last
                .has_completed()
            {
                Ok(())
            } else {
                Err(CondCheckError::NotYet)
            }
        },
        &Duration::from_millis(10),
        &Duration::from_secs(10),
    )
    .await
    .unwrap();

    // Once closed, the conductor takes no new operations.
    let conductor = std::sync::Arc::clone(conductor);
    server.close().await.unwrap();
    let error = conductor.tear_down(&opctx, node.id).await.unwrap_err();
    assert_matches!(error, Error::ServiceUnavailable { .. });
    let found = conductor.node_fetch(&opctx, node.id).await.unwrap();
    assert_eq!(found.provision_state, ProvisionState::Active);
    assert_eq!(found.power_state, Some(PowerState::PowerOn));

    logctx.cleanup_successful();
}
