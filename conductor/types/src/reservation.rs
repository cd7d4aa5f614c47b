// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Leases on nodes, as recorded in the node's `reservation` field

use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Identifies the holder of a lease: one worker within one conductor process
///
/// A conductor that restarts keeps its hostname but gets a new `instance`, so
/// the leases of workers from before the restart can be told apart from
/// those of live workers.
#[derive(
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
pub struct HolderId {
    /// hostname of the conductor process (its key in the conductor registry)
    pub conductor: String,
    /// the conductor process's start-up identity (see the registry record)
    pub instance: Uuid,
    pub worker: Uuid,
}

impl HolderId {
    pub fn new(conductor: &str, instance: Uuid) -> HolderId {
        HolderId {
            conductor: conductor.to_owned(),
            instance,
            worker: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.conductor, self.worker)
    }
}

/// Whether a lease excludes every other holder
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseMode {
    Exclusive,
    Shared,
}

impl fmt::Display for LeaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseMode::Exclusive => write!(f, "exclusive"),
            LeaseMode::Shared => write!(f, "shared"),
        }
    }
}

/// One holder's claim on a node
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct LeaseHolder {
    pub holder: HolderId,
    pub acquired_at: DateTime<Utc>,
    /// how many tasks of this holder share the claim; the claim goes away
    /// when the last of them releases it
    #[serde(default = "one_reference")]
    pub references: u32,
}

fn one_reference() -> u32 {
    1
}

impl LeaseHolder {
    pub fn new(holder: HolderId, acquired_at: DateTime<Utc>) -> LeaseHolder {
        LeaseHolder { holder, acquired_at, references: 1 }
    }
}

/// The lease currently held on a node
///
/// A node with no lease has no `Reservation` at all.  A shared reservation
/// always has at least one holder.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Reservation {
    Exclusive {
        #[serde(flatten)]
        holder: LeaseHolder,
    },
    Shared {
        /// in order of acquisition
        holders: Vec<LeaseHolder>,
    },
}

impl Reservation {
    pub fn exclusive(holder: HolderId, acquired_at: DateTime<Utc>) -> Self {
        Reservation::Exclusive { holder: LeaseHolder::new(holder, acquired_at) }
    }

    pub fn shared(holder: HolderId, acquired_at: DateTime<Utc>) -> Self {
        Reservation::Shared {
            holders: vec![LeaseHolder::new(holder, acquired_at)],
        }
    }

    pub fn mode(&self) -> LeaseMode {
        match self {
            Reservation::Exclusive { .. } => LeaseMode::Exclusive,
            Reservation::Shared { .. } => LeaseMode::Shared,
        }
    }

    pub fn holders(&self) -> &[LeaseHolder] {
        match self {
            Reservation::Exclusive { holder } => std::slice::from_ref(holder),
            Reservation::Shared { holders } => holders,
        }
    }

    pub fn is_held_by(&self, holder: &HolderId) -> bool {
        self.holders().iter().any(|h| &h.holder == holder)
    }

    /// Returns the reservation left behind once every holder for which
    /// `remove` returns true has gone
    ///
    /// Returns `None` if no holders would remain.
    pub fn without<F>(&self, mut remove: F) -> Option<Reservation>
    where
        F: FnMut(&LeaseHolder) -> bool,
    {
        match self {
            Reservation::Exclusive { holder } => {
                if remove(holder) {
                    None
                } else {
                    Some(self.clone())
                }
            }
            Reservation::Shared { holders } => {
                let holders: Vec<_> =
                    holders.iter().filter(|h| !remove(h)).cloned().collect();
                if holders.is_empty() {
                    None
                } else {
                    Some(Reservation::Shared { holders })
                }
            }
        }
    }

    /// Returns this reservation with one more reference from `holder`, which
    /// must already hold it
    pub fn with_reference(&self, holder: &HolderId) -> Reservation {
        let mut reservation = self.clone();
        reservation.for_each_holder_mut(|h| {
            if &h.holder == holder {
                h.references += 1;
            }
        });
        reservation
    }

    /// Returns the reservation left once one reference of `holder` is
    /// dropped, or `None` if nothing would be left
    pub fn released_by(&self, holder: &HolderId) -> Option<Reservation> {
        let last = self
            .holders()
            .iter()
            .any(|h| &h.holder == holder && h.references <= 1);
        if last {
            return self.without(|h| &h.holder == holder);
        }
        let mut reservation = self.clone();
        reservation.for_each_holder_mut(|h| {
            if &h.holder == holder {
                h.references -= 1;
            }
        });
        Some(reservation)
    }

    fn for_each_holder_mut<F>(&mut self, f: F)
    where
        F: FnMut(&mut LeaseHolder),
    {
        match self {
            Reservation::Exclusive { holder } => {
                std::iter::once(holder).for_each(f)
            }
            Reservation::Shared { holders } => holders.iter_mut().for_each(f),
        }
    }

    /// Summarizes the holders for log messages and `NodeLocked` errors
    pub fn describe_holders(&self) -> String {
        self.holders()
            .iter()
            .map(|h| h.holder.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
