// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities shared by the integration tests

use camino_tempfile::Utf8TempDir;
use headnode_controller::config::ControllerConfig;
use headnode_controller::config::NodeConfig;
use headnode_controller::controller::PassSummary;
use headnode_controller::directory::Environment;
use headnode_controller::directory::NodesetState;
use headnode_controller::directory::OtherFields;
use headnode_controller::directory::Project;
use headnode_controller::directory::Request;
use headnode_controller::directory::RequestState;
use headnode_controller::directory::User;
use headnode_controller::fakes::EventLog;
use headnode_controller::fakes::FakeBackend;
use headnode_controller::fakes::FakeConfigurator;
use headnode_controller::fakes::FakeDirectory;
use headnode_controller::fakes::FakeProber;
use headnode_controller::HeadnodeController;
use headnode_test_utils::dev::test_setup_log;
use headnode_test_utils::dev::LogContext;
use slog::Logger;
use std::sync::Arc;

pub const MAX_NO_CONTACT_SECS: u64 = 300;
pub const MAX_INITIALIZING_COUNT: u32 = 3;

pub fn controller_config(secret_dir: &Utf8TempDir) -> ControllerConfig {
    ControllerConfig {
        period_secs: 60,
        max_no_contact_time_secs: MAX_NO_CONTACT_SECS,
        max_initializing_count: MAX_INITIALIZING_COUNT,
        probe_timeout_secs: 10,
        secret_dir: secret_dir.path().to_path_buf(),
    }
}

pub fn node_config() -> NodeConfig {
    NodeConfig {
        image: "centos-7".to_string(),
        flavor: "m1.medium".to_string(),
        user: "root".to_string(),
        network_id: "net-1".to_string(),
        private_key_file: "/etc/vc3/keys/headnode".into(),
        public_key_name: "vc3-headnode".to_string(),
        security_groups: vec!["ssh".to_string(), "condor".to_string()],
    }
}

/// A request for a cluster in project "P1" using environment "E1".
pub fn request(name: &str, headnode: Option<&str>) -> Request {
    Request {
        name: name.to_string(),
        owner: "waldo".to_string(),
        project: Some("P1".to_string()),
        environments: vec!["E1".to_string()],
        headnode: headnode.map(str::to_string),
        state: RequestState::Initializing,
        other: OtherFields::new(),
    }
}

/// The fake collaborators behind a controller under test, sharing one event
/// log.
pub struct Fakes {
    pub directory: Arc<FakeDirectory>,
    pub backend: Arc<FakeBackend>,
    pub prober: Arc<FakeProber>,
    pub configurator: Arc<FakeConfigurator>,
    pub events: EventLog,
}

impl Fakes {
    pub fn new() -> Fakes {
        let events = EventLog::new();
        let fakes = Fakes {
            directory: FakeDirectory::with_events(events.clone()),
            backend: FakeBackend::with_events(events.clone()),
            prober: FakeProber::new(),
            configurator: FakeConfigurator::with_events(events.clone()),
            events,
        };
        fakes.directory.put_project(Project {
            name: "P1".to_string(),
            owner: "waldo".to_string(),
            members: Some(vec![
                "waldo".to_string(),
                "carol".to_string(),
                "ghost".to_string(),
            ]),
            other: OtherFields::new(),
        });
        fakes.directory.put_user(User {
            name: "waldo".to_string(),
            sshpubstring: Some("ssh-ed25519 AAAA waldo".to_string()),
            other: OtherFields::new(),
        });
        fakes.directory.put_user(User {
            name: "carol".to_string(),
            sshpubstring: None,
            other: OtherFields::new(),
        });
        fakes.directory.put_environment(Environment {
            name: "E1".to_string(),
            packagelist: Some(vec!["python".to_string(), "condor".to_string()]),
            other: OtherFields::new(),
        });
        fakes
    }

    pub fn controller(
        &self,
        log: &Logger,
        config: ControllerConfig,
    ) -> HeadnodeController {
        HeadnodeController::new(
            log,
            config,
            node_config(),
            self.directory.clone(),
            self.backend.clone(),
            self.prober.clone(),
            self.configurator.clone(),
        )
    }
}

pub struct ControllerTestContext {
    pub logctx: LogContext,
    pub fakes: Fakes,
    pub controller: HeadnodeController,
    pub secret_dir: Utf8TempDir,
}

impl ControllerTestContext {
    pub fn new(test_name: &str) -> ControllerTestContext {
        let logctx = test_setup_log(test_name);
        let secret_dir = Utf8TempDir::new().unwrap();
        let fakes = Fakes::new();
        let controller =
            fakes.controller(&logctx.log, controller_config(&secret_dir));
        ControllerTestContext { logctx, fakes, controller, secret_dir }
    }

    pub async fn pass(&mut self) -> PassSummary {
        self.controller.reconcile_once().await
    }

    /// Runs `n` passes.
    pub async fn passes(&mut self, n: usize) {
        for _ in 0..n {
            self.pass().await;
        }
    }

    pub fn state(&self, nodeset: &str) -> Option<NodesetState> {
        self.fakes.directory.nodeset(nodeset).map(|n| n.state)
    }

    pub fn set_request_state(&self, request: &str, state: RequestState) {
        let mut r = self.fakes.directory.request(request).unwrap();
        r.state = state;
        self.fakes.directory.put_request(r);
    }

    /// Replaces the controller with a new one, as though the process had
    /// restarted.
    pub fn restart(&mut self) {
        self.controller = self
            .fakes
            .controller(&self.logctx.log, controller_config(&self.secret_dir));
    }

    pub fn teardown(self) {
        drop(self.controller);
        self.logctx.cleanup_successful();
    }
}
