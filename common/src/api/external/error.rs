// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the conductor
//!
//! Driver capabilities have their own error type; see
//! `conductor::app::drivers::DriverError`.  Those errors are translated into
//! lifecycle failures, or into an [`Error`] when they reach a caller.

use crate::api::external::Generation;
use crate::api::external::ResourceType;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// An error that can be generated within a conductor component
///
/// These may be generated while handling a caller's request or as part of
/// background operation.  Lease-acquisition and store errors propagate to the
/// caller unchanged.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("Object (of type {lookup_type:?}) not found: {type_name}")]
    ObjectNotFound { type_name: ResourceType, lookup_type: LookupType },
    /// An object already exists with the specified name or identifier.
    #[error("Object (of type {type_name:?}) already exists: {object_name}")]
    ObjectAlreadyExists { type_name: ResourceType, object_name: String },
    /// A conflicting lease is held on the node and is not reclaimable.
    #[error("Node {node_id} is locked by {holder}")]
    NodeLocked { node_id: Uuid, holder: String },
    /// The node was updated by another writer since it was loaded.
    #[error(
        "Node {node_id} was modified concurrently (expected generation \
        {expected}, found {found})"
    )]
    VersionConflict { node_id: Uuid, expected: Generation, found: Generation },
    /// The request was well-formed, but the operation cannot be completed given
    /// the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// The specified input field is not valid.
    #[error("Invalid Value: {label}, {message}")]
    InvalidValue { label: String, message: String },
    /// A required input field was not provided.
    #[error("Missing Value: {label}")]
    MissingValue { label: String },
    /// The operation mutates the node but was attempted under a shared lease.
    #[error("Operation on node {node_id} requires an exclusive lease")]
    ExclusiveLockRequired { node_id: Uuid },
    /// Every worker in the pool is busy.
    #[error("No free worker available to handle the request")]
    NoFreeWorker,

    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
    /// The system (or part of it) is unavailable.
    #[error("Service Unavailable: {internal_message}")]
    ServiceUnavailable { internal_message: String },
}

/// Indicates how an object was looked up (for an `ObjectNotFound` error)
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum LookupType {
    /// a specific name was requested
    ByName(String),
    /// a specific id was requested
    ById(Uuid),
}

impl From<&str> for LookupType {
    fn from(name: &str) -> Self {
        LookupType::ByName(name.to_owned())
    }
}

impl From<Uuid> for LookupType {
    fn from(uuid: Uuid) -> Self {
        LookupType::ById(uuid)
    }
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably be
    /// retried
    pub fn retryable(&self) -> bool {
        match self {
            Error::NodeLocked { .. }
            | Error::VersionConflict { .. }
            | Error::NoFreeWorker
            | Error::ServiceUnavailable { .. } => true,

            Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::InvalidRequest { .. }
            | Error::InvalidValue { .. }
            | Error::MissingValue { .. }
            | Error::ExclusiveLockRequired { .. }
            | Error::InternalError { .. } => false,
        }
    }

    /// Returns true if this is the `ObjectNotFound` error for a node
    pub fn is_node_not_found(&self) -> bool {
        matches!(
            self,
            Error::ObjectNotFound { type_name: ResourceType::Node, .. }
        )
    }

    pub fn not_found_by_name(type_name: ResourceType, name: &str) -> Error {
        Error::ObjectNotFound { type_name, lookup_type: LookupType::from(name) }
    }

    pub fn not_found_by_id(type_name: ResourceType, id: &Uuid) -> Error {
        Error::ObjectNotFound { type_name, lookup_type: LookupType::from(*id) }
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should not
    /// happen but that we cannot reasonably handle at runtime (e.g., a lease
    /// that was modified underneath its exclusive holder).
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific message
    ///
    /// This should be used for failures due possibly to invalid client input
    /// or malformed requests.
    pub fn invalid_request(message: &str) -> Error {
        Error::InvalidRequest { message: message.to_owned() }
    }

    /// Generates an [`Error::InvalidValue`] error for the given field
    pub fn invalid_value(label: &str, message: &str) -> Error {
        Error::InvalidValue {
            label: label.to_owned(),
            message: message.to_owned(),
        }
    }

    /// Generates an [`Error::MissingValue`] error for the given field
    pub fn missing_value(label: &str) -> Error {
        Error::MissingValue { label: label.to_owned() }
    }

    /// Generates an [`Error::ServiceUnavailable`] error, for conditions the
    /// caller may retry (e.g., a conductor that is shutting down)
    pub fn unavail(message: &str) -> Error {
        Error::ServiceUnavailable { internal_message: message.to_owned() }
    }
}
