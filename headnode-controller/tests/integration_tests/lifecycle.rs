// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests taking headnodes from request to running

use crate::common::request;
use crate::common::ControllerTestContext;
use base64::Engine;
use headnode_controller::backend::ProvisioningBackend;
use headnode_controller::directory::NodesetState;
use headnode_controller::directory::RequestState;
use headnode_controller::fakes::FakeConfigurator;
use std::collections::BTreeMap;

#[tokio::test]
async fn test_creates_one_nodeset_per_initializing_request() {
    let mut cptestctx =
        ControllerTestContext::new("test_creates_one_nodeset_per_initializing_request");
    let directory = &cptestctx.fakes.directory;
    directory.put_request(request("R1", Some("H1")));
    directory.put_request(request("R2", Some("H2")));
    // No headnode picked yet.
    directory.put_request(request("R3", None));
    // Should already have a nodeset but does not.
    let mut validated = request("R4", Some("H4"));
    validated.state = RequestState::Other("validated".to_string());
    directory.put_request(validated);

    let summary = cptestctx.pass().await;
    assert_eq!(summary.requests, 4);
    assert_eq!(summary.transitions, 2);
    assert_eq!(summary.errors, 1);
    assert!(!summary.aborted);

    assert_eq!(cptestctx.fakes.directory.nodeset_count(), 2);
    for (request, name) in [("R1", "H1"), ("R2", "H2")] {
        let nodeset = cptestctx.fakes.directory.nodeset(name).unwrap();
        assert_eq!(nodeset.state, NodesetState::New);
        assert_eq!(nodeset.owner, "waldo");
        assert_eq!(nodeset.node_number, 1);
        assert!(nodeset.app_host.is_none(), "{request}");
    }
    // Nothing is booted on the pass that creates the nodeset.
    assert!(cptestctx.fakes.backend.booted().is_empty());

    cptestctx.teardown();
}

#[tokio::test]
async fn test_headnode_lifecycle() {
    let mut cptestctx = ControllerTestContext::new("test_headnode_lifecycle");
    cptestctx.fakes.directory.put_request(request("R1", Some("H1")));
    cptestctx.fakes.prober.script(&[false]);

    // Pass 1: nodeset created.
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::New));

    // Pass 2: VM booted, named after the request.
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Booting));
    let booted = cptestctx.fakes.backend.booted();
    assert_eq!(booted.len(), 1);
    assert_eq!(booted[0].name, "R1");
    assert_eq!(booted[0].image, "centos-7");
    assert_eq!(booted[0].key_name, "vc3-headnode");
    assert_eq!(booted[0].security_groups, ["ssh", "condor"]);
    assert_eq!(booted[0].network_id, "net-1");

    // Pass 3: not accepting logins yet.  The address is recorded anyway.
    cptestctx.pass().await;
    let nodeset = cptestctx.fakes.directory.nodeset("H1").unwrap();
    assert_eq!(nodeset.state, NodesetState::Booting);
    assert_eq!(nodeset.app_host.as_deref(), Some("10.0.0.1"));
    assert!(cptestctx.fakes.configurator.launches().is_empty());

    // Pass 4: reachable, so configuration starts.
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Initializing));
    let launches = cptestctx.fakes.configurator.launches();
    assert_eq!(launches.len(), 1);
    let launch = &launches[0];
    assert_eq!(launch.request_name, "R1");
    assert_eq!(launch.target_host, "10.0.0.1");
    assert_eq!(launch.extra_vars.request_name, "R1");
    assert_eq!(launch.extra_vars.setup_user_name, "root");
    assert_eq!(
        launch.extra_vars.condor_password_file,
        cptestctx.secret_dir.path().join("condor_password.R1")
    );
    // carol has no key and ghost does not exist.
    assert_eq!(
        launch.extra_vars.production_keys,
        BTreeMap::from([(
            "waldo".to_string(),
            "ssh-ed25519 AAAA waldo".to_string()
        )])
    );
    assert_eq!(
        launch.extra_vars.builder_options,
        "--require python --require condor"
    );

    // Pass 5: still configuring.
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Initializing));
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 1);

    // Pass 6: configured.
    cptestctx.pass().await;
    let nodeset = cptestctx.fakes.directory.nodeset("H1").unwrap();
    assert_eq!(nodeset.state, NodesetState::Running);
    let expected = base64::engine::general_purpose::STANDARD
        .encode(FakeConfigurator::secret_for("R1"));
    assert_eq!(nodeset.app_sectoken, Some(expected));
    assert_eq!(cptestctx.fakes.configurator.live_runs(), 0);

    // A running headnode stays running, whatever the VM's status says.
    cptestctx.fakes.backend.set_status("R1", "BUILD");
    for _ in 0..3 {
        let summary = cptestctx.pass().await;
        assert_eq!(summary.transitions, 0);
        assert_eq!(cptestctx.state("H1"), Some(NodesetState::Running));
    }
    assert_eq!(cptestctx.fakes.configurator.launches().len(), 1);
    assert_eq!(cptestctx.fakes.backend.booted().len(), 1);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_waits_for_vm_address() {
    let mut cptestctx = ControllerTestContext::new("test_waits_for_vm_address");
    cptestctx.fakes.directory.put_request(request("R1", Some("H1")));
    cptestctx.passes(2).await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Booting));

    // No address is handed out until the VM is active.
    cptestctx.fakes.backend.set_status("R1", "BUILD");
    cptestctx.passes(2).await;
    let nodeset = cptestctx.fakes.directory.nodeset("H1").unwrap();
    assert_eq!(nodeset.state, NodesetState::Booting);
    assert!(nodeset.app_host.is_none());
    assert!(cptestctx.fakes.prober.probed().is_empty());

    cptestctx.fakes.backend.set_status("R1", "ACTIVE");
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Initializing));
    assert_eq!(cptestctx.fakes.prober.probed(), ["10.0.0.1"]);

    cptestctx.teardown();
}

#[tokio::test]
async fn test_boot_failure() {
    let mut cptestctx = ControllerTestContext::new("test_boot_failure");
    cptestctx.fakes.directory.put_request(request("R1", Some("H1")));
    cptestctx.fakes.backend.set_fail_create(true);

    cptestctx.pass().await;
    let summary = cptestctx.pass().await;
    assert_eq!(summary.failures, 1);
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Failure));

    // Failure is terminal while the request is active.
    cptestctx.fakes.backend.set_fail_create(false);
    cptestctx.passes(2).await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Failure));
    assert!(cptestctx.fakes.backend.booted().is_empty());

    cptestctx.teardown();
}

#[tokio::test]
async fn test_vm_vanishes_while_booting() {
    let mut cptestctx =
        ControllerTestContext::new("test_vm_vanishes_while_booting");
    cptestctx.fakes.directory.put_request(request("R1", Some("H1")));
    cptestctx.passes(2).await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Booting));

    cptestctx.fakes.backend.delete("R1").await.unwrap();
    cptestctx.pass().await;
    assert_eq!(cptestctx.state("H1"), Some(NodesetState::Failure));

    cptestctx.teardown();
}
