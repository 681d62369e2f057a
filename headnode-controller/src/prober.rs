// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checks whether a headnode accepts logins.

use crate::process::execute_with_timeout;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use slog::debug;
use slog::o;
use slog::Logger;
use std::net::IpAddr;
use std::time::Duration;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra time a probe may take on top of its connect timeout, to run the
/// remote command and tear down the session.
const COMMAND_GRACE: Duration = Duration::from_secs(2);

/// Remote command run to prove that we can log in and execute things.
const PROBE_COMMAND: &str = "/bin/date";

/// Credentials used to log in to a headnode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeIdentity {
    pub private_key_file: Utf8PathBuf,
    pub user: String,
}

#[async_trait]
pub trait LivenessProber: Send + Sync {
    /// Returns whether `host` accepted a login within `timeout`.
    ///
    /// Unreachability is not an error.  A malformed host is reported as
    /// unreachable without attempting a connection.
    async fn is_reachable(
        &self,
        host: &str,
        identity: &ProbeIdentity,
        timeout: Duration,
    ) -> bool;
}

/// Whether `host` looks like an address or DNS name we are willing to pass
/// to ssh as a destination.
pub fn is_valid_host(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    !host.is_empty()
        && host.len() <= 253
        && !host.starts_with(['-', '.'])
        && host.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Probes hosts by running a trivial command over ssh.
pub struct SshProber {
    log: Logger,
    program: Utf8PathBuf,
}

impl SshProber {
    pub fn new(log: &Logger) -> SshProber {
        SshProber::with_program(log, "ssh".into())
    }

    /// Uses `program` in place of `ssh`.  It is invoked with ssh's command
    /// line.
    pub fn with_program(log: &Logger, program: Utf8PathBuf) -> SshProber {
        SshProber { log: log.new(o!("component" => "SshProber")), program }
    }

    fn command(
        &self,
        host: &str,
        identity: &ProbeIdentity,
        timeout: Duration,
    ) -> tokio::process::Command {
        let connect_timeout = timeout.as_secs().max(1);
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={connect_timeout}"))
            .arg("-i")
            .arg(identity.private_key_file.as_str())
            .arg("-l")
            .arg(&identity.user)
            .arg(host)
            .arg("--")
            .arg(PROBE_COMMAND)
            .stdin(std::process::Stdio::null());
        command
    }
}

#[async_trait]
impl LivenessProber for SshProber {
    async fn is_reachable(
        &self,
        host: &str,
        identity: &ProbeIdentity,
        timeout: Duration,
    ) -> bool {
        if !is_valid_host(host) {
            debug!(self.log, "not probing malformed host"; "host" => host);
            return false;
        }

        let mut command = self.command(host, identity, timeout);
        match execute_with_timeout(&mut command, timeout + COMMAND_GRACE).await
        {
            Ok(_) => {
                debug!(self.log, "host is reachable"; "host" => host);
                true
            }
            Err(err) => {
                debug!(
                    self.log,
                    "host is not reachable";
                    "host" => host,
                    "error" => %err,
                );
                false
            }
        }
    }
}
