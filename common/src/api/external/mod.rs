// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data structures and related facilities for representing resources
//!
//! Everything here is transport-agnostic.  These types are shared by the
//! node store, the lease manager, and the lifecycle operations.

mod error;
pub use error::*;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FormatResult;

// The type aliases below exist primarily to ensure consistency among return
// types for functions in the `Conductor` and the `DataStore`.

/// Result of a create operation for the specified type
pub type CreateResult<T> = Result<T, Error>;
/// Result of a delete operation for the specified type
pub type DeleteResult = Result<(), Error>;
/// Result of a list operation that returns a vector
pub type ListResultVec<T> = Result<Vec<T>, Error>;
/// Result of a lookup operation for the specified type
pub type LookupResult<T> = Result<T, Error>;
/// Result of an update operation for the specified type
pub type UpdateResult<T> = Result<T, Error>;

/// Generation numbers stored in the node store, used for optimistic
/// concurrency control
///
/// A record's generation is bumped by every successful conditional update, so
/// a writer that observed generation `g` can make its update conditional on
/// the record still being at `g`.
#[derive(
    Copy,
    Clone,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Generation(u64);

impl Generation {
    pub const fn new() -> Generation {
        Generation(1)
    }

    pub const fn next(&self) -> Generation {
        // Generations are kept within the range of an i64.
        let next_gen = self.0 + 1;
        assert!(
            next_gen <= i64::MAX as u64,
            "attempt to overflow generation number"
        );
        Generation(next_gen)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for Generation {
    fn default() -> Self {
        Generation::new()
    }
}

impl Display for Generation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.write_str(&self.0.to_string())
    }
}

/// Identifies a type of resource managed by the conductor
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Node,
    Conductor,
    Driver,
    Step,
    VendorMethod,
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(
            f,
            "{}",
            match self {
                ResourceType::Node => "node",
                ResourceType::Conductor => "conductor",
                ResourceType::Driver => "driver",
                ResourceType::Step => "step",
                ResourceType::VendorMethod => "vendor method",
            }
        )
    }
}

#[cfg(test)]
mod test {
    use super::Generation;

    #[test]
    fn test_generation_ordering() {
        let first = Generation::new();
        let second = first.next();
        assert!(second > first);
        assert_eq!(second.as_u64(), 2);
        assert_eq!(second.to_string(), "2");
        assert_eq!(Generation::default(), first);
    }

    #[test]
    #[should_panic(expected = "attempt to overflow generation number")]
    fn test_generation_overflow() {
        let g = Generation(i64::MAX as u64);
        let _ = g.next();
    }
}
