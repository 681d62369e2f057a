// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process stand-ins for the controller's collaborators, for tests.

use std::sync::Arc;
use std::sync::Mutex;

mod backend;
mod configurator;
mod directory;
mod prober;

pub use backend::FakeBackend;
pub use configurator::FakeConfigurator;
pub use configurator::FakeRun;
pub use configurator::Launch;
pub use directory::FakeDirectory;
pub use prober::FakeProber;

/// Ordered record of side effects, shared between fakes so that tests can
/// check the order in which the controller touched different collaborators.
#[derive(Clone, Debug, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> EventLog {
        EventLog::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
