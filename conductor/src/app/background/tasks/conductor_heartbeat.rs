// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task that keeps this conductor's registry entry fresh
//!
//! Other conductors consider our workers alive (and so leave their leases
//! alone) only while this entry has been touched within the heartbeat
//! timeout.

use crate::app::background::BackgroundTask;
use conductor_common::api::external::Error;
use conductor_db_queries::context::OpContext;
use conductor_db_queries::db::DataStore;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub struct ConductorHeartbeat {
    datastore: Arc<DataStore>,
    hostname: String,
    instance: Uuid,
    drivers: Vec<String>,
}

impl ConductorHeartbeat {
    pub fn new(
        datastore: Arc<DataStore>,
        hostname: String,
        instance: Uuid,
        drivers: Vec<String>,
    ) -> ConductorHeartbeat {
        ConductorHeartbeat { datastore, hostname, instance, drivers }
    }

    /// Returns whether the conductor had to be registered again
    async fn heartbeat(&self, opctx: &OpContext) -> Result<bool, Error> {
        match self.datastore.conductor_touch(opctx, &self.hostname).await {
            Ok(()) => Ok(false),
            Err(Error::ObjectNotFound { .. }) => {
                // Somebody removed our entry (or it was never written).  Our
                // leases are at risk of being reclaimed until it is back.
                warn!(
                    opctx.log,
                    "conductor was not registered; registering again"
                );
                self.datastore
                    .conductor_register(
                        opctx,
                        &self.hostname,
                        self.instance,
                        self.drivers.clone(),
                    )
                    .await?;
                Ok(true)
            }
            Err(error) => Err(error),
        }
    }
}

impl BackgroundTask for ConductorHeartbeat {
    fn activate<'a>(
        &'a self,
        opctx: &'a OpContext,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            match self.heartbeat(opctx).await {
                Ok(registered) => {
                    trace!(opctx.log, "heartbeat recorded");
                    json!({ "hostname": self.hostname, "registered": registered })
                }
                Err(error) => {
                    error!(
                        opctx.log,
                        "failed to record heartbeat";
                        "error" => %error,
                    );
                    json!({
                        "hostname": self.hostname,
                        "error": error.to_string(),
                    })
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use conductor_test_utils::dev;

    #[tokio::test]
    async fn test_heartbeat_reregisters() {
        let logctx = dev::test_setup_log("test_heartbeat_reregisters");
        let opctx = OpContext::for_tests(logctx.log.clone());
        let datastore = Arc::new(DataStore::new(&logctx.log));
        let instance = Uuid::new_v4();
        let task = ConductorHeartbeat::new(
            Arc::clone(&datastore),
            String::from("c1"),
            instance,
            vec![String::from("fake")],
        );

        // The first activation finds nothing to touch and registers.
        let result = task.activate(&opctx).await;
        assert_eq!(result["registered"], true);
        let first = datastore.conductor_fetch(&opctx, "c1").await.unwrap();
        assert_eq!(first.drivers, ["fake"]);
        assert_eq!(first.instance, instance);

        let result = task.activate(&opctx).await;
        assert_eq!(result["registered"], false);
        let second = datastore.conductor_fetch(&opctx, "c1").await.unwrap();
        assert!(second.time_updated >= first.time_updated);
        assert_eq!(second.time_created, first.time_created);

        logctx.cleanup_successful();
    }
}
