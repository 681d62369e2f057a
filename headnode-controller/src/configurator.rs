// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turns a freshly booted VM into a working headnode by running a
//! configuration tool (ansible-playbook) against it.
//!
//! A run is started with [`HostConfigurator::launch`] and then polled; it is
//! never awaited.  The returned [`ConfigurationRun`] owns the child process:
//! dropping it kills the process, so a run cannot outlive the controller's
//! interest in it.

use crate::process::command_to_string;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::process::Stdio;

#[derive(Debug, thiserror::Error)]
pub enum ConfiguratorError {
    #[error("serializing extra vars: {0}")]
    ExtraVars(#[source] serde_json::Error),

    #[error("opening debug log {path}: {err}")]
    DebugLog {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to start [{command}]: {err}")]
    Spawn {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to check on [{command}]: {err}")]
    Poll {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to stop [{command}]: {err}")]
    Cancel {
        command: String,
        #[source]
        err: std::io::Error,
    },
}

/// Where a configuration run is at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    /// The run exited unsuccessfully.  The exit code is absent if the process
    /// was killed by a signal.
    Failed(Option<i32>),
}

/// Variables handed to the playbook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExtraVars {
    pub request_name: String,
    /// Account the playbook sets the headnode up for.
    pub setup_user_name: String,
    /// Where the playbook leaves the pool password it generates.
    pub condor_password_file: Utf8PathBuf,
    /// Public keys of the request's project members, by member name.
    pub production_keys: BTreeMap<String, String>,
    pub builder_options: String,
}

impl ExtraVars {
    /// Formats the builder command line options that pull in `packages`.
    pub fn builder_options<'a, I>(packages: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        packages
            .into_iter()
            .map(|p| format!("--require {p}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub trait HostConfigurator: Send + Sync {
    /// Starts configuring `target_host` on behalf of `request_name`.
    fn launch(
        &self,
        request_name: &str,
        target_host: &str,
        extra_vars: &ExtraVars,
    ) -> Result<Box<dyn ConfigurationRun>, ConfiguratorError>;
}

/// Handle to one in-flight configuration run.
#[async_trait]
pub trait ConfigurationRun: Send {
    /// Reports the run's progress without blocking.
    fn poll(&mut self) -> Result<RunStatus, ConfiguratorError>;

    /// Stops the run and waits for it to go away.  Stopping a run that has
    /// already finished is not an error.
    async fn cancel(&mut self) -> Result<(), ConfiguratorError>;
}

/// Runs `ansible-playbook` against a single-host inventory.
pub struct AnsibleConfigurator {
    log: Logger,
    program: Utf8PathBuf,
    working_dir: Utf8PathBuf,
    playbook: String,
    private_key_file: Utf8PathBuf,
    debug_file: Option<Utf8PathBuf>,
}

impl AnsibleConfigurator {
    pub fn new(
        log: &Logger,
        program: Utf8PathBuf,
        working_dir: Utf8PathBuf,
        playbook: String,
        private_key_file: Utf8PathBuf,
        debug_file: Option<Utf8PathBuf>,
    ) -> AnsibleConfigurator {
        AnsibleConfigurator {
            log: log.new(o!("component" => "AnsibleConfigurator")),
            program,
            working_dir,
            playbook,
            private_key_file,
            debug_file,
        }
    }

    fn output(&self) -> Result<(Stdio, Stdio), ConfiguratorError> {
        let Some(path) = &self.debug_file else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        let to_error =
            |err| ConfiguratorError::DebugLog { path: path.clone(), err };
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(to_error)?;
        let stderr = stdout.try_clone().map_err(to_error)?;
        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }
}

impl HostConfigurator for AnsibleConfigurator {
    fn launch(
        &self,
        request_name: &str,
        target_host: &str,
        extra_vars: &ExtraVars,
    ) -> Result<Box<dyn ConfigurationRun>, ConfiguratorError> {
        let extra_vars = serde_json::to_string(extra_vars)
            .map_err(ConfiguratorError::ExtraVars)?;
        let (stdout, stderr) = self.output()?;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .arg(&self.playbook)
            .arg("--extra-vars")
            .arg(extra_vars)
            .arg("--key-file")
            .arg(self.private_key_file.as_str())
            .arg("--inventory")
            .arg(format!("{target_host},"))
            .current_dir(&self.working_dir)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);

        let command_str = command_to_string(command.as_std());
        let child = command.spawn().map_err(|err| ConfiguratorError::Spawn {
            command: command_str.clone(),
            err,
        })?;

        let log = self.log.new(o!(
            "request" => request_name.to_string(),
            "pid" => child.id(),
        ));
        info!(log, "started configuration run"; "host" => target_host);
        debug!(log, "configuration command"; "command" => &command_str);

        Ok(Box::new(AnsibleRun { log, command: command_str, child }))
    }
}

struct AnsibleRun {
    log: Logger,
    command: String,
    child: tokio::process::Child,
}

#[async_trait]
impl ConfigurationRun for AnsibleRun {
    fn poll(&mut self) -> Result<RunStatus, ConfiguratorError> {
        let status = self.child.try_wait().map_err(|err| {
            ConfiguratorError::Poll { command: self.command.clone(), err }
        })?;
        Ok(match status {
            None => RunStatus::Running,
            Some(status) if status.success() => RunStatus::Succeeded,
            Some(status) => RunStatus::Failed(status.code()),
        })
    }

    async fn cancel(&mut self) -> Result<(), ConfiguratorError> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        warn!(self.log, "stopping configuration run");
        if let Err(err) = self.child.start_kill() {
            // The process may have exited between the check above and now.
            if self.child.try_wait().ok().flatten().is_some() {
                return Ok(());
            }
            return Err(ConfiguratorError::Cancel {
                command: self.command.clone(),
                err,
            });
        }
        self.child.wait().await.map_err(|err| ConfiguratorError::Cancel {
            command: self.command.clone(),
            err,
        })?;
        Ok(())
    }
}
