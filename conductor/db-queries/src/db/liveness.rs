// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker liveness, as consulted by lease reclamation

use crate::context::OpContext;
use crate::db::DataStore;
use async_trait::async_trait;
use chrono::Utc;
use conductor_common::api::external::Error;
use conductor_types::reservation::HolderId;
use std::sync::Arc;
use std::time::Duration;

/// Answers whether the holder of a lease is still running
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn is_alive(
        &self,
        opctx: &OpContext,
        holder: &HolderId,
    ) -> Result<bool, Error>;
}

/// [`WorkerRegistry`] backed by the conductor registry in the node store
///
/// A holder is alive if its conductor is registered, the registration is
/// still that of the holder's conductor instance (not of a process that
/// restarted under the same hostname since), and it has heartbeated within
/// `heartbeat_timeout`.  Workers do not heartbeat individually: a worker that
/// goes away inside a live conductor releases its leases on the way out.
pub struct ConductorLiveness {
    datastore: Arc<DataStore>,
    heartbeat_timeout: Duration,
}

impl ConductorLiveness {
    pub fn new(
        datastore: Arc<DataStore>,
        heartbeat_timeout: Duration,
    ) -> ConductorLiveness {
        ConductorLiveness { datastore, heartbeat_timeout }
    }
}

#[async_trait]
impl WorkerRegistry for ConductorLiveness {
    async fn is_alive(
        &self,
        opctx: &OpContext,
        holder: &HolderId,
    ) -> Result<bool, Error> {
        match self.datastore.conductor_fetch(opctx, &holder.conductor).await {
            Ok(record) => Ok(record.is_holder_alive(
                holder,
                Utc::now(),
                self.heartbeat_timeout,
            )),
            Err(Error::ObjectNotFound { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }
}
