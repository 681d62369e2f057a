// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller that provisions, configures and tears down the headnode VM of
//! each virtual cluster request.

pub mod backend;
pub mod config;
pub mod configurator;
pub mod controller;
pub mod directory;
pub mod driver;
pub mod fakes;
pub mod prober;
mod process;

pub use config::Config;
pub use controller::HeadnodeController;
pub use driver::Driver;

use backend::NovaBackend;
use configurator::AnsibleConfigurator;
use directory::HttpDirectory;
use prober::SshProber;
use slog::info;
use slog::warn;
use std::sync::Arc;
use std::time::Duration;

/// Runs the controller described by `config` until interrupted.
pub async fn run_controller(config: Config) -> Result<(), String> {
    let log = config
        .log
        .to_logger("headnode-controller")
        .map_err(|message| format!("initializing logger: {}", message))?;
    info!(
        log,
        "starting headnode controller";
        "directory" => &config.directory.url,
        "period_secs" => config.controller.period_secs,
    );

    let directory = HttpDirectory::new(
        &log,
        &config.directory.url,
        Duration::from_secs(config.directory.timeout_secs),
    )
    .map_err(|e| format!("initializing directory client: {e}"))?;
    let backend = NovaBackend::new(
        &log,
        config.openstack.credentials.clone(),
        Duration::from_secs(config.openstack.timeout_secs),
    )
    .map_err(|e| format!("initializing compute client: {e}"))?;
    let prober = SshProber::new(&log);
    let configurator = AnsibleConfigurator::new(
        &log,
        config.ansible.program.clone(),
        config.ansible.path.clone(),
        config.ansible.playbook.clone(),
        config.node.private_key_file.clone(),
        config.ansible.debug_file.clone(),
    );

    let controller = HeadnodeController::new(
        &log,
        config.controller.clone(),
        config.node.clone(),
        Arc::new(directory),
        Arc::new(backend),
        Arc::new(prober),
        Arc::new(configurator),
    );
    let driver = Driver::new(&log, controller, config.controller.period());

    let shutdown_log = log.clone();
    driver
        .run(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!(shutdown_log, "received interrupt"),
                Err(err) => {
                    warn!(
                        shutdown_log,
                        "cannot listen for interrupts";
                        "error" => %err,
                    );
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;
    Ok(())
}
