// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for configuration runs that fail

use crate::common::request;
use crate::common::ControllerTestContext;
use crate::common::MAX_INITIALIZING_COUNT;
use headnode_controller::directory::NodesetState;
use headnode_controller::fakes::FakeRun;

/// Runs passes until the headnode is being configured.
async fn start_configuring(cptestctx: &mut ControllerTestContext) {
    cptestctx.fakes.directory.put_request(request("R1", Some("H1")));
    cptestctx.passes(3).await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Initializing));
    assert_eq!(cptestctx.fakes.configurator.launches().len(), 1);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let mut cptestctx =
        ControllerTestContext::new("test_gives_up_after_max_attempts");
    cptestctx.fakes.configurator.set_default(FakeRun::fails_after(1, 1));
    start_configuring(&mut cptestctx).await;

    let mut passes = 0;
    while cptestctx.state("H1") == Some(NodesetState::Initializing) {
        assert!(passes < 20, "headnode never left initializing");
        assert!(cptestctx.fakes.configurator.live_runs() <= 1);
        cptestctx.pass().await;
        passes += 1;
    }
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Failure));
    assert_eq!(
        cptestctx.fakes.configurator.launches().len(),
        usize::try_from(MAX_INITIALIZING_COUNT).unwrap()
    );

    // No further runs once failed.
    cptestctx.passes(3).await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Failure));
    assert_eq!(
        cptestctx.fakes.configurator.launches().len(),
        usize::try_from(MAX_INITIALIZING_COUNT).unwrap()
    );
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 0);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_failed_run_is_relaunched() {
    let mut cptestctx =
        ControllerTestContext::new("test_failed_run_is_relaunched");
    cptestctx.fakes.configurator.script(&[FakeRun::fails_after(0, 2)]);
    start_configuring(&mut cptestctx).await;

    // The failure is observed...
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Initializing));
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 0);

    // ...and a new run is launched on the following pass.
    cptestctx.pass().await;
    assert_eq!(cptestctx.fakes.configurator.launches().len(), 2);
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 1);

    cptestctx.passes(2).await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Running));

    cptestctx.teardown();
}

#[tokio::test]
async fn test_restart_relaunches_lost_run() {
    let mut cptestctx =
        ControllerTestContext::new("test_restart_relaunches_lost_run");
    cptestctx.fakes.configurator.set_default(FakeRun::never_finishes());
    start_configuring(&mut cptestctx).await;
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 1);

    cptestctx.restart();
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 0);

    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Initializing));
    assert_eq!(cptestctx.fakes.configurator.launches().len(), 2);
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 1);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_missing_environment() {
    let mut cptestctx = ControllerTestContext::new("test_missing_environment");
    let mut r1 = request("R1", Some("H1"));
    r1.environments.push("E9".to_string());
    cptestctx.fakes.directory.put_request(r1);

    cptestctx.passes(3).await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Failure));
    assert!(cptestctx.fakes.configurator.launches().is_empty());

    cptestctx.teardown();
}

#[tokio::test]
async fn test_launch_failure() {
    let mut cptestctx = ControllerTestContext::new("test_launch_failure");
    cptestctx.fakes.configurator.set_fail_launch(true);
    cptestctx.fakes.directory.put_request(request("R1", Some("H1")));

    cptestctx.passes(3).await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Failure));

    cptestctx.teardown();
}

#[tokio::test]
async fn test_poll_error() {
    let mut cptestctx = ControllerTestContext::new("test_poll_error");
    start_configuring(&mut cptestctx).await;

    // The fake cannot leave its secret behind once the directory is gone, so
    // checking on the run fails.
    let secret_dir = cptestctx.secret_dir.path().to_path_buf();
    std::fs::remove_dir_all(&secret_dir).unwrap();

    cptestctx.passes(2).await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Failure));
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 0);

    std::fs::create_dir(&secret_dir).unwrap();
    cptestctx.teardown();
}

#[tokio::test]
async fn test_attempts_survive_failed_store() {
    let mut cptestctx =
        ControllerTestContext::new("test_attempts_survive_failed_store");
    cptestctx.fakes.configurator.set_default(FakeRun::fails_after(1, 1));
    cptestctx.fakes.directory.fail_next_store(NodesetState::Failure);
    start_configuring(&mut cptestctx).await;

    let mut passes = 0;
    let mut aborted = 0;
    while cptestctx.state("H1") == Some(NodesetState::Initializing) {
        assert!(passes < 20, "headnode never left initializing");
        if cptestctx.pass().await.aborted {
            aborted += 1;
        }
        passes += 1;
    }

    // Giving up could not be recorded the first time, but the attempts made
    // so far were not forgotten.
    assert_eq!(aborted, 1);
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Failure));
    assert_eq!(
        cptestctx.fakes.configurator.launches().len(),
        usize::try_from(MAX_INITIALIZING_COUNT).unwrap()
    );
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 0);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_success_survives_failed_store() {
    let mut cptestctx =
        ControllerTestContext::new("test_success_survives_failed_store");
    cptestctx.fakes.directory.fail_next_store(NodesetState::Running);
    start_configuring(&mut cptestctx).await;

    // Still running, then finished but not recorded.
    cptestctx.pass().await;
    let summary = cptestctx.pass().await;
    assert!(summary.aborted);
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Initializing));
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 1);

    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Running));
    assert_eq!(cptestctx.fakes.configurator.launches().len(), 1);
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 0);

    cptestctx.teardown();
}
