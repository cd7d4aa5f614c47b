// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Bare-metal conductor
//!
//! This crate implements facilities shared by every crate of the conductor:
//! the error taxonomy that crosses component boundaries, generation numbers
//! used for optimistic concurrency, and retry policies.
//!
//! Other crates implement the pieces of the conductor itself (e.g.,
//! `conductor_db_queries` for the node store and `conductor` for the lease
//! manager and lifecycle machinery).

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

pub mod api;
pub mod backoff;
