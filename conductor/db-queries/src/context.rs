// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared state used by API request handlers
use chrono::DateTime;
use chrono::Utc;
use slog::o;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Instant;

/// Provides general facilities scoped to whatever operation the conductor is
/// currently doing
///
/// The idea is that whatever code path you're looking at in the conductor, it
/// should eventually have an OpContext that allows it to:
///
/// - log a message (with relevant operation-specific metadata)
/// - find out what started the operation (a caller's request or a
///   background task)
///
/// OpContexts are constructed when the conductor begins an operation.  Code
/// that spawns sub-operations uses [`OpContext::child()`] to add metadata.
#[derive(Clone)]
pub struct OpContext {
    pub log: slog::Logger,

    created_instant: Instant,
    created_walltime: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
    kind: OpKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    /// Handling a caller's request
    Request,
    /// Background operations in the conductor
    Background,
    /// Automated testing (unit tests and integration tests)
    Test,
}

impl OpContext {
    fn new(log: slog::Logger, kind: OpKind) -> OpContext {
        OpContext {
            log,
            created_instant: Instant::now(),
            created_walltime: Utc::now(),
            metadata: BTreeMap::new(),
            kind,
        }
    }

    /// Returns a context suitable for handling a caller's request
    pub fn for_request(log: &slog::Logger, request_id: &str) -> OpContext {
        let log = log.new(o!("request_id" => request_id.to_owned()));
        let mut ctx = OpContext::new(log, OpKind::Request);
        ctx.metadata.insert(String::from("request_id"), request_id.to_owned());
        ctx
    }

    /// Returns a context suitable for use in background operations in the
    /// conductor
    pub fn for_background(log: slog::Logger) -> OpContext {
        OpContext::new(log, OpKind::Background)
    }

    /// Returns a context suitable for automated tests
    pub fn for_tests(log: slog::Logger) -> OpContext {
        OpContext::new(log, OpKind::Test)
    }

    /// Creates a new `OpContext` just like the given one, but with a different
    /// set of metadata.  The new metadata is appended to the existing metadata
    /// and also added to the logger.
    pub fn child(&self, new_metadata: BTreeMap<String, String>) -> OpContext {
        let created_instant = Instant::now();
        let created_walltime = Utc::now();
        let mut metadata = self.metadata.clone();
        let mut log = self.log.clone();

        for (k, v) in new_metadata {
            metadata.insert(k.clone(), v.clone());
            log = log.new(o!(k => v));
        }

        OpContext {
            log,
            created_instant,
            created_walltime,
            metadata,
            kind: self.kind,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Returns how long this operation has been running
    pub fn elapsed(&self) -> std::time::Duration {
        self.created_instant.elapsed()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_walltime
    }
}

impl Debug for OpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpContext")
            .field("created_instant", &self.created_instant)
            .field("created_walltime", &self.created_walltime)
            .field("metadata", &self.metadata)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
