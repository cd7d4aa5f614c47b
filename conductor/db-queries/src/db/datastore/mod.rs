// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primary control plane interface for node store operations
//!
//! The [`DataStore`] keeps its tables in memory and runs every public
//! operation as one transaction: the tables are locked for the whole
//! read-check-write sequence, so a conditional update observes and modifies
//! the row atomically.  Nothing here holds the lock across an `await`.

use conductor_common::api::external::Error;
use conductor_types::node::Node;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

mod conductor;
mod node;

pub use conductor::ConductorRecord;
pub use node::NodeFilter;

#[derive(Debug, Default)]
struct Tables {
    nodes: BTreeMap<Uuid, Node>,
    conductors: BTreeMap<String, ConductorRecord>,
}

pub struct DataStore {
    log: slog::Logger,
    tables: Mutex<Tables>,
}

impl DataStore {
    pub fn new(log: &slog::Logger) -> DataStore {
        DataStore {
            log: log.new(o!("component" => "datastore")),
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Runs `f` with exclusive access to every table
    ///
    /// `f` must not panic partway through a modification: the tables would be
    /// left poisoned and every later transaction fails.
    fn transaction<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Tables) -> Result<T, Error>,
    {
        let mut tables = self.tables.lock().map_err(|_| {
            error!(self.log, "node store poisoned by an earlier panic");
            Error::unavail("node store is unavailable")
        })?;
        f(&mut tables)
    }
}
