// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementations of the conductor's background tasks

pub mod async_step_timeouts;
pub mod conductor_heartbeat;
pub mod power_state_sync;
pub mod reservation_reaper;
