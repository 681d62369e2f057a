// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with a headnode
//! controller configuration

use crate::backend::NovaCredentials;
use crate::prober::DEFAULT_PROBE_TIMEOUT;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Configuration for a headnode controller
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
    pub controller: ControllerConfig,
    /// What headnode VMs look like and how to log in to them.
    pub node: NodeConfig,
    pub ansible: AnsibleConfig,
    pub directory: DirectoryConfig,
    pub openstack: OpenstackConfig,
}

/// Tunables for the reconciliation loop.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Seconds between reconciliation passes.
    pub period_secs: u64,
    /// Seconds a configuring or running headnode may go without answering a
    /// liveness probe before it is declared failed.
    pub max_no_contact_time_secs: u64,
    /// Number of configuration runs attempted before giving up on a headnode.
    pub max_initializing_count: u32,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Directory configuration runs leave their generated secrets in.
    #[serde(default = "default_secret_dir")]
    pub secret_dir: Utf8PathBuf,
}

fn default_probe_timeout_secs() -> u64 {
    DEFAULT_PROBE_TIMEOUT.as_secs()
}

fn default_secret_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("/tmp")
}

impl ControllerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn max_no_contact_time(&self) -> Duration {
        Duration::from_secs(self.max_no_contact_time_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Path of the secret produced by configuring the headnode of
    /// `request_name`.
    pub fn secret_file(&self, request_name: &str) -> Utf8PathBuf {
        self.secret_dir.join(format!("condor_password.{request_name}"))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub image: String,
    pub flavor: String,
    /// Account used to log in to headnodes.
    pub user: String,
    pub network_id: String,
    pub private_key_file: Utf8PathBuf,
    /// Name under which the compute service knows the matching public key.
    pub public_key_name: String,
    pub security_groups: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AnsibleConfig {
    #[serde(default = "default_ansible_program")]
    pub program: Utf8PathBuf,
    /// Directory playbooks are run from.
    pub path: Utf8PathBuf,
    pub playbook: String,
    /// File that configuration run output is appended to.  Output is
    /// discarded if this is unset.
    #[serde(default)]
    pub debug_file: Option<Utf8PathBuf>,
}

fn default_ansible_program() -> Utf8PathBuf {
    Utf8PathBuf::from("ansible-playbook")
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    /// Base URL of the information service.
    pub url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OpenstackConfig {
    #[serde(flatten)]
    pub credentials: NovaCredentials,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        config.validate().map_err(|message| LoadError::Invalid {
            path: path.into(),
            message,
        })?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.controller.period_secs == 0 {
            return Err("controller.period_secs must be non-zero".to_string());
        }
        if self.controller.probe_timeout_secs == 0 {
            return Err(
                "controller.probe_timeout_secs must be non-zero".to_string()
            );
        }
        if self.controller.max_initializing_count == 0 {
            return Err(
                "controller.max_initializing_count must be at least 1"
                    .to_string(),
            );
        }
        if self.node.security_groups.is_empty() {
            return Err("node.security_groups must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("invalid configuration in \"{path}\": {message}")]
    Invalid { path: Utf8PathBuf, message: String },
}
