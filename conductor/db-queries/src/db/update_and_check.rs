// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Results of conditional updates

/// Status of a conditional update
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateStatus {
    /// The row exists and was updated.
    Updated,
    /// The row exists, but it did not satisfy the update's condition.
    NotUpdatedButExists,
}

/// Result of a conditional update, along with the row as it exists after the
/// update was (or was not) applied
///
/// This is the equivalent of an "UPDATE ... WHERE <condition>" followed, in
/// the same transaction, by a read of the row.  Callers use `found` to decide
/// what to do when their condition no longer held.
#[derive(Clone, Debug)]
pub struct UpdateAndQueryResult<Q> {
    pub status: UpdateStatus,
    pub found: Q,
}

impl<Q> UpdateAndQueryResult<Q> {
    pub fn was_updated(&self) -> bool {
        self.status == UpdateStatus::Updated
    }
}
