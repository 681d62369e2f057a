// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for headnodes that stop answering liveness probes

use crate::common::request;
use crate::common::ControllerTestContext;
use crate::common::MAX_NO_CONTACT_SECS;
use headnode_controller::directory::NodesetState;
use headnode_controller::fakes::FakeRun;
use std::time::Duration;

async fn start_running(cptestctx: &mut ControllerTestContext) {
    cptestctx.fakes.directory.put_request(request("R1", Some("H1")));
    cptestctx.passes(5).await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Running));
}

#[tokio::test(start_paused = true)]
async fn test_failure_once_threshold_exceeded() {
    let mut cptestctx =
        ControllerTestContext::new("test_failure_once_threshold_exceeded");
    start_running(&mut cptestctx).await;

    cptestctx.fakes.prober.set_reachable(false);
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Running));

    tokio::time::advance(Duration::from_secs(MAX_NO_CONTACT_SECS - 1)).await;
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Running));

    // Exactly at the threshold is still tolerated.
    tokio::time::advance(Duration::from_secs(1)).await;
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Running));

    tokio::time::advance(Duration::from_secs(1)).await;
    let summary = cptestctx.pass().await;
    assert_eq!(summary.failures, 1);
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Failure));

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_contact_resets_clock() {
    let mut cptestctx = ControllerTestContext::new("test_contact_resets_clock");
    start_running(&mut cptestctx).await;

    cptestctx.fakes.prober.set_reachable(false);
    tokio::time::advance(Duration::from_secs(200)).await;
    cptestctx.pass().await;

    cptestctx.fakes.prober.set_reachable(true);
    cptestctx.pass().await;

    cptestctx.fakes.prober.set_reachable(false);
    tokio::time::advance(Duration::from_secs(250)).await;
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Running));

    tokio::time::advance(Duration::from_secs(51)).await;
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Failure));

    cptestctx.teardown();
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_while_configuring() {
    let mut cptestctx =
        ControllerTestContext::new("test_unreachable_while_configuring");
    cptestctx.fakes.configurator.set_default(FakeRun::never_finishes());
    cptestctx.fakes.directory.put_request(request("R1", Some("H1")));
    cptestctx.passes(3).await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Initializing));
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 1);

    cptestctx.fakes.prober.set_reachable(false);
    tokio::time::advance(Duration::from_secs(MAX_NO_CONTACT_SECS)).await;
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Initializing));

    tokio::time::advance(Duration::from_secs(1)).await;
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Failure));
    // The run is abandoned along with the headnode.
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 0);

    cptestctx.teardown();
}
