// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drivers: pluggable sets of hardware-control capabilities

pub mod fake;
pub mod fake_async;
pub mod interfaces;
pub mod registry;

pub use interfaces::DriverError;
pub use interfaces::StepOutcome;
pub use registry::Driver;
pub use registry::DriverBuilder;
pub use registry::DriverFactories;
pub use registry::DriverLoadError;
pub use registry::DriverRegistry;
pub use registry::RegisteredStep;
