// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for working with the node store

pub mod datastore;
pub mod liveness;
mod update_and_check;

pub use datastore::ConductorRecord;
pub use datastore::DataStore;
pub use datastore::NodeFilter;
pub use liveness::ConductorLiveness;
pub use liveness::WorkerRegistry;
pub use update_and_check::UpdateAndQueryResult;
pub use update_and_check::UpdateStatus;
