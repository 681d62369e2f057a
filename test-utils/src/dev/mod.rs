// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities intended for development tools and the test suite.  These should
//! not be used in production code.

use anyhow::Context;
use camino::Utf8Path;
use camino::Utf8PathBuf;
pub use dropshot::test_util::LogContext;
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingIfExists;
use dropshot::ConfigLoggingLevel;

/// Set up a [`dropshot::test_util::LogContext`] appropriate for a test named
/// `test_name`
///
/// Callers should invoke `logctx.cleanup_successful()` once the test passes
/// so that the log file is removed.
pub fn test_setup_log(test_name: &str) -> LogContext {
    let log_config = ConfigLogging::File {
        level: ConfigLoggingLevel::Trace,
        path: "UNUSED".into(),
        if_exists: ConfigLoggingIfExists::Fail,
    };

    LogContext::new(test_name, &log_config)
}

/// Writes a `/bin/sh` script named `name` into `dir` and marks it executable.
///
/// Tests use these as stand-ins for `ssh` and `ansible-playbook`.
#[cfg(unix)]
pub fn write_executable(
    dir: &Utf8Path,
    name: &str,
    body: &str,
) -> Result<Utf8PathBuf, anyhow::Error> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    let script = format!("#!/bin/sh\n{body}\n");
    std::fs::write(&path, script)
        .with_context(|| format!("failed to write script {path}"))?;
    let mut perms = std::fs::metadata(&path)
        .with_context(|| format!("failed to stat script {path}"))?
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)
        .with_context(|| format!("failed to chmod script {path}"))?;
    Ok(path)
}
