// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::EventLog;
use crate::configurator::ConfigurationRun;
use crate::configurator::ConfiguratorError;
use crate::configurator::ExtraVars;
use crate::configurator::HostConfigurator;
use crate::configurator::RunStatus;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

/// How a fake configuration run behaves: it reports
/// [`RunStatus::Running`] for `running_polls` polls, then `outcome`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FakeRun {
    pub running_polls: u32,
    pub outcome: RunStatus,
}

impl FakeRun {
    pub fn succeeds_after(running_polls: u32) -> FakeRun {
        FakeRun { running_polls, outcome: RunStatus::Succeeded }
    }

    pub fn fails_after(running_polls: u32, exit_code: i32) -> FakeRun {
        FakeRun { running_polls, outcome: RunStatus::Failed(Some(exit_code)) }
    }

    pub fn never_finishes() -> FakeRun {
        FakeRun { running_polls: u32::MAX, outcome: RunStatus::Succeeded }
    }
}

/// Arguments of one call to [`HostConfigurator::launch`].
#[derive(Clone, Debug)]
pub struct Launch {
    pub request_name: String,
    pub target_host: String,
    pub extra_vars: ExtraVars,
}

struct Inner {
    scripted: VecDeque<FakeRun>,
    default: FakeRun,
    launches: Vec<Launch>,
    fail_launch: bool,
}

/// A fake [`HostConfigurator`].
///
/// Successful runs leave a secret in the `condor_password_file` named by
/// their extra vars, as the real playbook does.
pub struct FakeConfigurator {
    inner: Mutex<Inner>,
    live_runs: Arc<AtomicUsize>,
    events: EventLog,
}

impl FakeConfigurator {
    pub fn new() -> Arc<Self> {
        Self::with_events(EventLog::new())
    }

    /// Records run cancellations in `events`.
    pub fn with_events(events: EventLog) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                scripted: VecDeque::new(),
                default: FakeRun::succeeds_after(1),
                launches: Vec::new(),
                fail_launch: false,
            }),
            live_runs: Arc::new(AtomicUsize::new(0)),
            events,
        })
    }

    /// Runs launched from now on behave like `runs`, in order.
    pub fn script(&self, runs: &[FakeRun]) {
        self.inner.lock().unwrap().scripted.extend(runs);
    }

    /// Behavior of runs launched once the script runs out.
    pub fn set_default(&self, run: FakeRun) {
        self.inner.lock().unwrap().default = run;
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.inner.lock().unwrap().fail_launch = fail;
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.inner.lock().unwrap().launches.clone()
    }

    /// Number of run handles that have been launched and not yet dropped.
    pub fn live_runs(&self) -> usize {
        self.live_runs.load(Ordering::SeqCst)
    }

    /// The secret a successful run for `request_name` leaves behind.
    pub fn secret_for(request_name: &str) -> String {
        format!("pool-password-{request_name}")
    }
}

impl HostConfigurator for FakeConfigurator {
    fn launch(
        &self,
        request_name: &str,
        target_host: &str,
        extra_vars: &ExtraVars,
    ) -> Result<Box<dyn ConfigurationRun>, ConfiguratorError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_launch {
            return Err(ConfiguratorError::Spawn {
                command: "ansible-playbook".to_string(),
                err: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        inner.launches.push(Launch {
            request_name: request_name.to_string(),
            target_host: target_host.to_string(),
            extra_vars: extra_vars.clone(),
        });
        let script = match inner.scripted.pop_front() {
            Some(script) => script,
            None => inner.default,
        };

        self.live_runs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeRunHandle {
            request_name: request_name.to_string(),
            secret_file: extra_vars.condor_password_file.clone(),
            script,
            polls: 0,
            finished: None,
            live_runs: Arc::clone(&self.live_runs),
            events: self.events.clone(),
        }))
    }
}

struct FakeRunHandle {
    request_name: String,
    secret_file: Utf8PathBuf,
    script: FakeRun,
    polls: u32,
    finished: Option<RunStatus>,
    live_runs: Arc<AtomicUsize>,
    events: EventLog,
}

#[async_trait]
impl ConfigurationRun for FakeRunHandle {
    fn poll(&mut self) -> Result<RunStatus, ConfiguratorError> {
        if let Some(status) = self.finished {
            return Ok(status);
        }
        if self.polls < self.script.running_polls {
            self.polls += 1;
            return Ok(RunStatus::Running);
        }
        if self.script.outcome == RunStatus::Succeeded {
            std::fs::write(
                &self.secret_file,
                FakeConfigurator::secret_for(&self.request_name),
            )
            .map_err(|err| ConfiguratorError::Poll {
                command: "ansible-playbook".to_string(),
                err,
            })?;
        }
        self.finished = Some(self.script.outcome);
        Ok(self.script.outcome)
    }

    async fn cancel(&mut self) -> Result<(), ConfiguratorError> {
        if self.finished.is_none() {
            self.events.record(format!("cancel run {}", self.request_name));
            self.finished = Some(RunStatus::Failed(None));
        }
        Ok(())
    }
}

impl Drop for FakeRunHandle {
    fn drop(&mut self) {
        self.live_runs.fetch_sub(1, Ordering::SeqCst);
    }
}
