// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to the conductor, which manages the lifecycle of
//! bare-metal nodes

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

pub mod app;

pub use app::Conductor;
pub use conductor_config::Config;

use app::drivers::fake::builtin_factories;
use conductor_db_queries::db::DataStore;
use slog::Logger;
use std::sync::Arc;

#[macro_use]
extern crate slog;

/// A running conductor
pub struct Server {
    conductor: Arc<Conductor>,
    log: Logger,
}

impl Server {
    /// Assembles the configured drivers and starts a conductor
    pub async fn start(config: &Config, log: &Logger) -> Result<Server, String> {
        let log = log.new(o!("name" => config.conductor.hostname.clone()));
        info!(log, "setting up conductor server");

        let datastore =
            Arc::new(DataStore::new(&log.new(o!("component" => "DataStore"))));
        let conductor =
            Conductor::new(log.clone(), config, datastore, &builtin_factories())
                .await
                .map_err(|error| format!("starting conductor: {}", error))?;
        for (driver, error) in conductor.drivers().load_errors() {
            warn!(log, "driver not loaded"; "driver" => driver, "error" => %error);
        }
        Ok(Server { conductor, log })
    }

    pub fn conductor(&self) -> &Arc<Conductor> {
        &self.conductor
    }

    /// Waits until the process is asked to stop
    pub async fn wait_for_shutdown(&self) -> Result<(), String> {
        tokio::signal::ctrl_c()
            .await
            .map_err(|error| format!("waiting for interrupt: {}", error))?;
        info!(self.log, "received interrupt");
        Ok(())
    }

    /// Removes the conductor from the conductor registry
    pub async fn close(self) -> Result<(), String> {
        self.conductor
            .shutdown()
            .await
            .map_err(|error| format!("shutting down conductor: {}", error))
    }
}

/// Run an instance of the [Server].
pub async fn run_server(config: &Config) -> Result<(), String> {
    let log = config
        .log
        .to_logger("conductor")
        .map_err(|message| format!("initializing logger: {}", message))?;
    let server = Server::start(config, &log).await?;
    server.wait_for_shutdown().await?;
    server.close().await
}
