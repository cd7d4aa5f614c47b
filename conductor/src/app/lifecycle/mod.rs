// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node lifecycle: the provisioning state machine and the engine that runs it

mod engine;
pub mod machine;
pub mod steps;

pub use engine::Engine;
pub use machine::Event;
