// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with a conductor
//! configuration
//!
//! The configuration is read once at startup and handed by reference to the
//! driver registry, the lease manager, and the background tasks.  There is no
//! global configuration.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::time::Duration;
use thiserror::Error;

mod logging;

pub use logging::ConfigLogging;
pub use logging::ConfigLoggingIfExists;
pub use logging::ConfigLoggingLevel;
pub use logging::LogFileError;

/// Configuration for a conductor process
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Settings for the conductor itself
    pub conductor: ConductorConfig,
    /// Settings for periodic background tasks
    pub background_tasks: BackgroundTaskConfig,
    /// Which drivers to load
    pub drivers: DriversConfig,
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
}

impl Config {
    /// Load a `Config` from the given TOML file
    ///
    /// This config object can then be used to start a new conductor.
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        config_parsed.validate().map_err(|message| LoadError::Invalid {
            path: path.into(),
            message,
        })?;
        Ok(config_parsed)
    }

    fn validate(&self) -> Result<(), String> {
        if self.conductor.hostname.is_empty() {
            return Err(String::from("conductor.hostname must not be empty"));
        }
        if self.conductor.workers_pool_size == 0 {
            return Err(String::from(
                "conductor.workers_pool_size must be at least 1",
            ));
        }
        if self.conductor.heartbeat_timeout
            <= self.background_tasks.conductor_heartbeat.period_secs
        {
            return Err(String::from(
                "conductor.heartbeat_timeout_secs must exceed \
                background_tasks.conductor_heartbeat.period_secs",
            ));
        }
        if self.background_tasks.max_concurrent == 0 {
            return Err(String::from(
                "background_tasks.max_concurrent must be at least 1",
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ConductorConfig {
    /// name of this conductor in the conductor registry and in lease holder
    /// identities
    pub hostname: String,
    /// maximum number of node operations running at once
    pub workers_pool_size: usize,
    /// how long after its last heartbeat a conductor is considered dead
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "heartbeat_timeout_secs")]
    pub heartbeat_timeout: Duration,
    /// how long a lease is protected from reclamation after it is acquired
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "reservation_grace_period_secs")]
    pub reservation_grace_period: Duration,
    /// if set, leases older than this are reclaimable even from live holders
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(rename = "lease_timeout_secs", default)]
    pub lease_timeout: Option<Duration>,
    /// how long lease acquisition retries a locked node before giving up
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "lease_acquire_timeout_secs")]
    pub lease_acquire_timeout: Duration,
    /// whether nodes are cleaned when made available and after teardown
    pub automated_clean: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "deploy_callback_timeout_secs")]
    pub deploy_callback_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "clean_callback_timeout_secs")]
    pub clean_callback_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "rescue_callback_timeout_secs")]
    pub rescue_callback_timeout: Duration,
    /// how many times a save under a shared lease is retried after losing a
    /// race with another writer
    pub save_retry_limit: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BackgroundTaskConfig {
    /// maximum number of background activations running at once
    pub max_concurrent: usize,
    pub conductor_heartbeat: ConductorHeartbeatConfig,
    pub reservation_reaper: ReservationReaperConfig,
    pub power_state_sync: PowerStateSyncConfig,
    pub async_step_timeouts: AsyncStepTimeoutsConfig,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ConductorHeartbeatConfig {
    /// period (in seconds) for periodic activations of this background task
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs: Duration,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ReservationReaperConfig {
    /// period (in seconds) for periodic activations of this background task
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs: Duration,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PowerStateSyncConfig {
    /// period (in seconds) for periodic activations of this background task
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs: Duration,
    /// maximum number of nodes queried at once
    pub max_concurrent_nodes: usize,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AsyncStepTimeoutsConfig {
    /// period (in seconds) for periodic activations of this background task
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs: Duration,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DriversConfig {
    /// names of the drivers to assemble at startup
    pub enabled: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("invalid config \"{path}\": {message}")]
    Invalid { path: Utf8PathBuf, message: String },
}
