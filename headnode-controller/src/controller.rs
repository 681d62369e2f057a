// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives each request's headnode through its lifecycle.
//!
//! Every reconciliation pass lists all requests and moves each request's
//! headnode nodeset at most one step along
//!
//! ```text
//! (absent) -> new -> booting -> initializing -> running
//!                       |            |             |
//!                       +------------+-------------+--> failure
//! ```
//!
//! and, once the request is being cleaned up, from any of those to
//! `terminated` and then (absent) again.  The nodeset stored in the directory
//! is the only durable state.  Per-request bookkeeping needed between passes
//! is kept in memory and is lost on restart.

use crate::backend::BackendError;
use crate::backend::ProvisioningBackend;
use crate::backend::VmSpec;
use crate::config::ControllerConfig;
use crate::config::NodeConfig;
use crate::configurator::ConfigurationRun;
use crate::configurator::ConfiguratorError;
use crate::configurator::ExtraVars;
use crate::configurator::HostConfigurator;
use crate::configurator::RunStatus;
use crate::directory::DirectoryClient;
use crate::directory::DirectoryError;
use crate::directory::Nodeset;
use crate::directory::NodesetState;
use crate::directory::Request;
use crate::directory::RequestState;
use crate::prober::LivenessProber;
use crate::prober::ProbeIdentity;
use base64::Engine;
use camino::Utf8PathBuf;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;

/// Why a request was not reconciled.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The directory could not be reached.  The rest of the pass is skipped.
    #[error("directory service unavailable: {0}")]
    DirectoryUnavailable(#[source] DirectoryError),

    #[error("reading nodeset {name:?}: {err}")]
    ReadNodeset {
        name: String,
        #[source]
        err: DirectoryError,
    },

    #[error("nodeset {name:?} is missing but request is {state}")]
    MissingNodeset { name: String, state: RequestState },

    #[error("storing nodeset {name:?}: {err}")]
    StoreNodeset {
        name: String,
        #[source]
        err: DirectoryError,
    },

    #[error("deleting nodeset {name:?}: {err}")]
    DeleteNodeset {
        name: String,
        #[source]
        err: DirectoryError,
    },
}

impl ReconcileError {
    fn from_directory(
        err: DirectoryError,
        wrap: impl FnOnce(DirectoryError) -> ReconcileError,
    ) -> ReconcileError {
        if err.is_connection() {
            ReconcileError::DirectoryUnavailable(err)
        } else {
            wrap(err)
        }
    }
}

/// Errors from advancing a headnode.  Other than the directory becoming
/// unreachable, these all put the headnode into `failure`.
#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error("directory: {0}")]
    Directory(#[from] DirectoryError),

    #[error("provisioning backend: {0}")]
    Backend(#[from] BackendError),

    #[error("configuration run: {0}")]
    Configurator(#[from] ConfiguratorError),

    #[error("VM {name:?} has disappeared")]
    VmMissing { name: String },

    #[error("no address has been recorded for the headnode")]
    NoAddress,

    #[error("reading secret {path}: {err}")]
    Secret { path: Utf8PathBuf, err: std::io::Error },
}

/// What a pass did to a request's nodeset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Created,
    Moved(NodesetState),
    Removed,
}

/// What the controller remembers about a request between passes.
#[derive(Default)]
struct TrackedHeadnode {
    /// Configuration run in flight, if any.  Dropping it kills the run.
    run: Option<Box<dyn ConfigurationRun>>,
    /// When the headnode last answered a liveness probe.
    last_contact: Option<Instant>,
    /// Configuration runs launched so far.
    attempts: u32,
    /// Set once `run` has exited.  The handle is only dropped after the
    /// nodeset recording the outcome has been stored, so that the outcome
    /// is observed again if storing fails.
    run_finished: bool,
}

impl TrackedHeadnode {
    fn release_finished_run(&mut self) {
        if self.run_finished {
            self.run = None;
            self.run_finished = false;
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub requests: usize,
    /// Nodesets that moved to a new state (including creation and removal).
    pub transitions: usize,
    /// Requests whose headnode entered `failure` during this pass.
    pub failures: usize,
    /// Requests skipped because of an error.
    pub errors: usize,
    /// Whether the pass was cut short because the directory was unreachable.
    pub aborted: bool,
}

pub struct HeadnodeController {
    log: Logger,
    config: ControllerConfig,
    node: NodeConfig,
    identity: ProbeIdentity,
    directory: Arc<dyn DirectoryClient>,
    backend: Arc<dyn ProvisioningBackend>,
    prober: Arc<dyn LivenessProber>,
    configurator: Arc<dyn HostConfigurator>,
    tracked: BTreeMap<String, TrackedHeadnode>,
}

impl HeadnodeController {
    pub fn new(
        log: &Logger,
        config: ControllerConfig,
        node: NodeConfig,
        directory: Arc<dyn DirectoryClient>,
        backend: Arc<dyn ProvisioningBackend>,
        prober: Arc<dyn LivenessProber>,
        configurator: Arc<dyn HostConfigurator>,
    ) -> HeadnodeController {
        let identity = ProbeIdentity {
            private_key_file: node.private_key_file.clone(),
            user: node.user.clone(),
        };
        HeadnodeController {
            log: log.new(o!("component" => "HeadnodeController")),
            config,
            node,
            identity,
            directory,
            backend,
            prober,
            configurator,
            tracked: BTreeMap::new(),
        }
    }

    /// Runs one reconciliation pass over every request.
    pub async fn reconcile_once(&mut self) -> PassSummary {
        let mut summary = PassSummary::default();

        let requests = match self.directory.list_requests().await {
            Ok(requests) => requests,
            Err(err) => {
                warn!(self.log, "could not list requests"; "error" => %err);
                summary.aborted = true;
                return summary;
            }
        };
        summary.requests = requests.len();
        debug!(self.log, "reconciling headnodes"; "requests" => requests.len());

        for request in &requests {
            match self.process_request(request).await {
                Ok(Outcome::Unchanged) => {}
                Ok(outcome) => {
                    summary.transitions += 1;
                    if outcome == Outcome::Moved(NodesetState::Failure) {
                        summary.failures += 1;
                    }
                }
                Err(err @ ReconcileError::DirectoryUnavailable(_)) => {
                    warn!(
                        self.log,
                        "abandoning reconciliation pass";
                        "request" => &request.name,
                        "error" => %err,
                    );
                    summary.errors += 1;
                    summary.aborted = true;
                    break;
                }
                Err(err @ ReconcileError::MissingNodeset { .. }) => {
                    error!(
                        self.log,
                        "could not find headnode information";
                        "request" => &request.name,
                        "error" => %err,
                    );
                    summary.errors += 1;
                }
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to reconcile headnode";
                        "request" => &request.name,
                        "error" => %err,
                    );
                    summary.errors += 1;
                }
            }
        }

        if !summary.aborted {
            let seen: BTreeSet<&str> =
                requests.iter().map(|r| r.name.as_str()).collect();
            self.tracked.retain(|name, _| seen.contains(name.as_str()));
        }

        info!(
            self.log,
            "reconciliation pass complete";
            "requests" => summary.requests,
            "transitions" => summary.transitions,
            "failures" => summary.failures,
            "errors" => summary.errors,
            "aborted" => summary.aborted,
        );
        summary
    }

    /// Stops every in-flight configuration run.
    pub async fn shutdown(&mut self) {
        for (name, mut tracked) in std::mem::take(&mut self.tracked) {
            if let Some(run) = tracked.run.as_mut() {
                if let Err(err) = run.cancel().await {
                    warn!(
                        self.log,
                        "failed to stop configuration run";
                        "request" => name,
                        "error" => %err,
                    );
                }
            }
        }
    }

    /// Advances the headnode of `request` by one step.
    ///
    /// Bookkeeping in `tracked` that the stored nodeset depends on is only
    /// discarded once the nodeset has been stored.
    async fn process_request(
        &mut self,
        request: &Request,
    ) -> Result<Outcome, ReconcileError> {
        let Some(nodeset_name) = request.headnode.as_deref() else {
            // The master has not named the headnode yet.
            return Ok(Outcome::Unchanged);
        };
        let log = self.log.new(o!(
            "request" => request.name.clone(),
            "nodeset" => nodeset_name.to_string(),
        ));
        debug!(log, "processing headnode"; "request_state" => %request.state);

        let existing = match self.directory.get_nodeset(nodeset_name).await {
            Ok(nodeset) => Some(nodeset),
            Err(err) if err.is_missing() => None,
            Err(err) => {
                return Err(ReconcileError::from_directory(err, |err| {
                    ReconcileError::ReadNodeset {
                        name: nodeset_name.to_string(),
                        err,
                    }
                }));
            }
        };

        let Some(mut nodeset) = existing else {
            return match &request.state {
                RequestState::Initializing => {
                    let nodeset = Nodeset::new_headnode(request, nodeset_name);
                    self.store(&nodeset).await?;
                    info!(log, "created headnode nodeset");
                    Ok(Outcome::Created)
                }
                state if state.is_terminating() => {
                    // Already cleaned up.
                    self.tracked.remove(&request.name);
                    Ok(Outcome::Unchanged)
                }
                state => Err(ReconcileError::MissingNodeset {
                    name: nodeset_name.to_string(),
                    state: state.clone(),
                }),
            };
        };

        if nodeset.state == NodesetState::Terminated {
            match self.directory.delete_nodeset(nodeset_name).await {
                Ok(()) => {}
                Err(err) if err.is_missing() => {}
                Err(err) => {
                    return Err(ReconcileError::from_directory(err, |err| {
                        ReconcileError::DeleteNodeset {
                            name: nodeset_name.to_string(),
                            err,
                        }
                    }));
                }
            }
            self.tracked.remove(&request.name);
            info!(log, "deleted headnode nodeset");
            return Ok(Outcome::Removed);
        }

        let before = nodeset.state;
        if request.state.is_terminating() {
            self.terminate(&log, request, &mut nodeset).await;
        } else {
            self.advance(&log, request, &mut nodeset).await?;
        }
        let after = nodeset.state;
        self.store(&nodeset).await?;

        if after == NodesetState::Failure {
            // Kills any run still in flight.
            self.tracked.remove(&request.name);
        } else if let Some(tracked) = self.tracked.get_mut(&request.name) {
            tracked.release_finished_run();
        }

        if before == after {
            return Ok(Outcome::Unchanged);
        }
        info!(
            log,
            "headnode state changed";
            "from" => %before,
            "to" => %after,
        );
        Ok(Outcome::Moved(after))
    }

    async fn store(&self, nodeset: &Nodeset) -> Result<(), ReconcileError> {
        self.directory.store_nodeset(nodeset).await.map_err(|err| {
            ReconcileError::from_directory(err, |err| {
                ReconcileError::StoreNodeset { name: nodeset.name.clone(), err }
            })
        })
    }

    /// Cancels any configuration run and deletes the VM.
    ///
    /// If the VM cannot be deleted the headnode is marked failed, so that
    /// teardown is tried again on the next pass.
    async fn terminate(
        &mut self,
        log: &Logger,
        request: &Request,
        nodeset: &mut Nodeset,
    ) {
        if let Some(mut tracked) = self.tracked.remove(&request.name) {
            if let Some(run) = tracked.run.as_mut() {
                info!(log, "stopping configuration run before teardown");
                if let Err(err) = run.cancel().await {
                    warn!(
                        log,
                        "failed to stop configuration run";
                        "error" => %err,
                    );
                }
            }
        }

        match self.backend.delete(&request.name).await {
            Ok(()) => info!(log, "deleted headnode VM"),
            Err(BackendError::NotFound { .. }) => {
                info!(log, "headnode VM already gone")
            }
            Err(err) => {
                warn!(log, "could not delete headnode VM"; "error" => %err);
                nodeset.state = NodesetState::Failure;
                return;
            }
        }
        nodeset.state = NodesetState::Terminated;
    }

    /// Takes the next step for a headnode whose request is active.
    async fn advance(
        &mut self,
        log: &Logger,
        request: &Request,
        nodeset: &mut Nodeset,
    ) -> Result<(), ReconcileError> {
        let result = match nodeset.state {
            NodesetState::New => self.create_vm(log, request, nodeset).await,
            NodesetState::Booting => {
                self.check_booted(log, request, nodeset).await
            }
            NodesetState::Initializing => {
                self.check_initializing(log, request, nodeset).await
            }
            NodesetState::Running => {
                self.check_running(log, request, nodeset).await
            }
            NodesetState::Failure | NodesetState::Terminated => Ok(()),
        };

        match result {
            Ok(()) => Ok(()),
            Err(StepError::Directory(err)) if err.is_connection() => {
                Err(ReconcileError::DirectoryUnavailable(err))
            }
            Err(err) => {
                warn!(
                    log,
                    "error while processing headnode";
                    "state" => %nodeset.state,
                    "error" => %err,
                );
                nodeset.state = NodesetState::Failure;
                Ok(())
            }
        }
    }

    async fn create_vm(
        &mut self,
        log: &Logger,
        request: &Request,
        nodeset: &mut Nodeset,
    ) -> Result<(), StepError> {
        let spec = VmSpec {
            name: request.name.clone(),
            image: self.node.image.clone(),
            flavor: self.node.flavor.clone(),
            key_name: self.node.public_key_name.clone(),
            security_groups: self.node.security_groups.clone(),
            network_id: self.node.network_id.clone(),
        };
        let vm = self.backend.create(&spec).await?;
        info!(
            log,
            "headnode VM created";
            "vm_id" => &vm.id,
            "vm_status" => &vm.status,
        );
        nodeset.state = NodesetState::Booting;
        Ok(())
    }

    async fn check_booted(
        &mut self,
        log: &Logger,
        request: &Request,
        nodeset: &mut Nodeset,
    ) -> Result<(), StepError> {
        if nodeset.app_host.is_none() {
            let vm = self
                .backend
                .find_by_name(&request.name)
                .await?
                .ok_or_else(|| StepError::VmMissing {
                    name: request.name.clone(),
                })?;
            match self.backend.addresses(&vm).first() {
                Some(address) => nodeset.app_host = Some(address.to_string()),
                None => {
                    debug!(
                        log,
                        "headnode VM has no usable address yet";
                        "vm_status" => &vm.status,
                    );
                    return Ok(());
                }
            }
        }
        let host = nodeset.app_host.clone().ok_or(StepError::NoAddress)?;

        if !self.probe(&host).await {
            debug!(log, "headnode not accepting logins yet"; "host" => &host);
            return Ok(());
        }

        info!(log, "headnode accepting logins"; "host" => &host);
        self.tracked.entry(request.name.clone()).or_default().last_contact =
            Some(Instant::now());
        nodeset.state = NodesetState::Initializing;
        self.launch_run(log, request, &host).await
    }

    async fn check_initializing(
        &mut self,
        log: &Logger,
        request: &Request,
        nodeset: &mut Nodeset,
    ) -> Result<(), StepError> {
        let host = nodeset.app_host.clone().ok_or(StepError::NoAddress)?;
        if !self.check_liveness(log, &request.name, &host).await {
            nodeset.state = NodesetState::Failure;
            return Ok(());
        }

        let max_attempts = self.config.max_initializing_count;
        let Some(tracked) = self
            .tracked
            .get_mut(&request.name)
            .filter(|tracked| tracked.run.is_some())
        else {
            // Either the previous run failed, or we restarted and lost
            // track of it.
            return self.launch_run(log, request, &host).await;
        };
        let status = match tracked.run.as_mut() {
            Some(run) => run.poll()?,
            None => return Ok(()),
        };

        match status {
            RunStatus::Running => {
                debug!(log, "waiting for configuration run to finish");
            }
            RunStatus::Succeeded => {
                tracked.run_finished = true;
                info!(log, "configuration run finished");
                let secret = self.read_secret(&request.name).await?;
                nodeset.app_sectoken = Some(secret);
                nodeset.state = NodesetState::Running;
            }
            RunStatus::Failed(exit_code) => {
                tracked.run_finished = true;
                warn!(
                    log,
                    "configuration run failed";
                    "exit_code" => exit_code,
                    "attempt" => tracked.attempts,
                    "max_attempts" => max_attempts,
                );
                if tracked.attempts >= max_attempts {
                    warn!(
                        log,
                        "giving up on configuring headnode";
                        "attempts" => tracked.attempts,
                    );
                    nodeset.state = NodesetState::Failure;
                }
            }
        }
        Ok(())
    }

    async fn check_running(
        &mut self,
        log: &Logger,
        request: &Request,
        nodeset: &mut Nodeset,
    ) -> Result<(), StepError> {
        let host = nodeset.app_host.clone().ok_or(StepError::NoAddress)?;
        if !self.check_liveness(log, &request.name, &host).await {
            nodeset.state = NodesetState::Failure;
        }
        Ok(())
    }

    async fn probe(&self, host: &str) -> bool {
        self.prober
            .is_reachable(host, &self.identity, self.config.probe_timeout())
            .await
    }

    /// Probes the headnode and returns false once it has been out of contact
    /// for longer than the no-contact threshold.
    async fn check_liveness(
        &mut self,
        log: &Logger,
        request_name: &str,
        host: &str,
    ) -> bool {
        let reachable = self.probe(host).await;
        let now = Instant::now();
        let tracked = self.tracked.entry(request_name.to_string()).or_default();
        if reachable {
            tracked.last_contact = Some(now);
            return true;
        }

        // With no contact on record (as after a restart) the clock starts now.
        let last_contact = *tracked.last_contact.get_or_insert(now);
        let silent_for = now.duration_since(last_contact);
        let threshold = self.config.max_no_contact_time();
        if silent_for > threshold {
            warn!(
                log,
                "headnode could not be contacted; declaring failure";
                "host" => host,
                "threshold_secs" => threshold.as_secs(),
            );
            return false;
        }

        warn!(
            log,
            "headnode could not be contacted";
            "host" => host,
            "remaining_secs" => (threshold - silent_for).as_secs(),
        );
        true
    }

    /// Launches a configuration run unless one is already in flight.
    async fn launch_run(
        &mut self,
        log: &Logger,
        request: &Request,
        host: &str,
    ) -> Result<(), StepError> {
        if self
            .tracked
            .get(&request.name)
            .is_some_and(|tracked| tracked.run.is_some())
        {
            return Ok(());
        }

        let extra_vars = self.extra_vars(log, request).await?;
        let run = self.configurator.launch(&request.name, host, &extra_vars)?;

        let tracked = self.tracked.entry(request.name.clone()).or_default();
        tracked.run = Some(run);
        tracked.attempts += 1;
        tracked.last_contact.get_or_insert_with(Instant::now);
        info!(
            log,
            "configuring headnode";
            "host" => host,
            "attempt" => tracked.attempts,
            "max_attempts" => self.config.max_initializing_count,
        );
        Ok(())
    }

    async fn extra_vars(
        &self,
        log: &Logger,
        request: &Request,
    ) -> Result<ExtraVars, StepError> {
        let production_keys = self.member_keys(log, request).await?;

        let mut packages = Vec::new();
        for name in &request.environments {
            let environment = self.directory.get_environment(name).await?;
            packages.extend(environment.packagelist.unwrap_or_default());
        }

        Ok(ExtraVars {
            request_name: request.name.clone(),
            setup_user_name: self.node.user.clone(),
            condor_password_file: self.config.secret_file(&request.name),
            production_keys,
            builder_options: ExtraVars::builder_options(
                packages.iter().map(String::as_str),
            ),
        })
    }

    /// Collects the SSH keys of the members of the request's project.
    /// Members we cannot find a key for are left out.
    async fn member_keys(
        &self,
        log: &Logger,
        request: &Request,
    ) -> Result<BTreeMap<String, String>, StepError> {
        let members = match &request.project {
            Some(project) => match self.directory.get_project(project).await {
                Ok(project) => project.members.unwrap_or_default(),
                Err(err) if err.is_missing() => Vec::new(),
                Err(err) => return Err(err.into()),
            },
            None => Vec::new(),
        };
        if members.is_empty() {
            warn!(log, "could not find member names for request");
        }

        let mut keys = BTreeMap::new();
        for member in members {
            let key = match self.directory.get_user(&member).await {
                Ok(user) => user.sshpubstring,
                Err(err) if err.is_missing() => None,
                Err(err) => return Err(err.into()),
            };
            match key {
                Some(key) => {
                    keys.insert(member, key);
                }
                None => {
                    warn!(log, "could not find ssh key"; "user" => &member);
                }
            }
        }
        Ok(keys)
    }

    async fn read_secret(
        &self,
        request_name: &str,
    ) -> Result<String, StepError> {
        let path = self.config.secret_file(request_name);
        let contents = tokio::fs::read(&path)
            .await
            .map_err(|err| StepError::Secret { path, err })?;
        Ok(base64::engine::general_purpose::STANDARD.encode(contents))
    }
}
