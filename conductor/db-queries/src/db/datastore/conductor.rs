// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on the conductor registry

use super::DataStore;
use crate::context::OpContext;
use chrono::DateTime;
use chrono::Utc;
use conductor_common::api::external::CreateResult;
use conductor_common::api::external::DeleteResult;
use conductor_common::api::external::Error;
use conductor_common::api::external::ListResultVec;
use conductor_common::api::external::LookupResult;
use conductor_common::api::external::ResourceType;
use conductor_common::api::external::UpdateResult;
use conductor_types::reservation::HolderId;
use std::time::Duration;
use uuid::Uuid;

/// A conductor process, as recorded in the registry
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConductorRecord {
    pub hostname: String,
    /// identifies the process that registered last; a restarted conductor
    /// registers with a new instance
    pub instance: Uuid,
    /// drivers this conductor loaded successfully
    pub drivers: Vec<String>,
    pub time_created: DateTime<Utc>,
    /// last heartbeat
    pub time_updated: DateTime<Utc>,
}

impl ConductorRecord {
    /// Returns whether this conductor has heartbeated within `timeout` of
    /// `now`
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        // A heartbeat from the future (clock skew) counts as fresh.
        let age = (now - self.time_updated).to_std().unwrap_or(Duration::ZERO);
        age <= timeout
    }

    /// Returns whether `holder` is a worker of the process that currently
    /// owns this record and that process has heartbeated within `timeout`
    pub fn is_holder_alive(
        &self,
        holder: &HolderId,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> bool {
        holder.conductor == self.hostname
            && holder.instance == self.instance
            && self.is_alive(now, timeout)
    }
}

fn not_found(hostname: &str) -> Error {
    Error::not_found_by_name(ResourceType::Conductor, hostname)
}

impl DataStore {
    /// Registers a conductor, replacing any record left behind by an earlier
    /// process with the same hostname
    ///
    /// Workers of that earlier process stop counting as alive once the new
    /// `instance` is recorded.
    pub async fn conductor_register(
        &self,
        opctx: &OpContext,
        hostname: &str,
        instance: Uuid,
        drivers: Vec<String>,
    ) -> CreateResult<ConductorRecord> {
        let now = Utc::now();
        let record = self.transaction(|tables| {
            let time_created = tables
                .conductors
                .get(hostname)
                .map(|previous| previous.time_created)
                .unwrap_or(now);
            let record = ConductorRecord {
                hostname: hostname.to_owned(),
                instance,
                drivers,
                time_created,
                time_updated: now,
            };
            tables.conductors.insert(hostname.to_owned(), record.clone());
            Ok(record)
        })?;

        info!(
            opctx.log,
            "registered conductor";
            "hostname" => hostname,
            "instance" => %instance,
            "drivers" => ?record.drivers,
        );
        Ok(record)
    }

    /// Records a heartbeat for the given conductor
    pub async fn conductor_touch(
        &self,
        _opctx: &OpContext,
        hostname: &str,
    ) -> UpdateResult<()> {
        self.transaction(|tables| {
            let record = tables
                .conductors
                .get_mut(hostname)
                .ok_or_else(|| not_found(hostname))?;
            record.time_updated = Utc::now();
            Ok(())
        })
    }

    pub async fn conductor_unregister(
        &self,
        opctx: &OpContext,
        hostname: &str,
    ) -> DeleteResult {
        self.transaction(|tables| {
            tables
                .conductors
                .remove(hostname)
                .map(|_| ())
                .ok_or_else(|| not_found(hostname))
        })?;
        info!(opctx.log, "unregistered conductor"; "hostname" => hostname);
        Ok(())
    }

    pub async fn conductor_fetch(
        &self,
        _opctx: &OpContext,
        hostname: &str,
    ) -> LookupResult<ConductorRecord> {
        self.transaction(|tables| {
            tables
                .conductors
                .get(hostname)
                .cloned()
                .ok_or_else(|| not_found(hostname))
        })
    }

    /// Lists conductors that have heartbeated within `heartbeat_timeout`
    pub async fn conductor_list_alive(
        &self,
        _opctx: &OpContext,
        heartbeat_timeout: Duration,
    ) -> ListResultVec<ConductorRecord> {
        let now = Utc::now();
        self.transaction(|tables| {
            Ok(tables
                .conductors
                .values()
                .filter(|c| c.is_alive(now, heartbeat_timeout))
                .cloned()
                .collect())
        })
    }
}
