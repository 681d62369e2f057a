// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the compute service that hosts headnode VMs.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

mod nova;

pub use nova::NovaBackend;
pub use nova::NovaCredentials;

/// Status string the compute service reports for a booted VM.
pub const STATUS_ACTIVE: &str = "ACTIVE";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no VM named {name:?}")]
    NotFound { name: String },

    #[error("authenticating with the compute service: {message}")]
    Auth { message: String },

    #[error("compute service request failed: {message}")]
    Request { message: String },

    #[error("unexpected response from compute service: {status}: {message}")]
    Http { status: u16, message: String },
}

/// Parameters for booting a VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub image: String,
    pub flavor: String,
    pub key_name: String,
    pub security_groups: Vec<String>,
    pub network_id: String,
}

/// A VM as last reported by the compute service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vm {
    pub id: String,
    pub name: String,
    pub status: String,
    /// Addresses assigned to the VM, by network name.
    pub addresses: BTreeMap<String, Vec<String>>,
}

impl Vm {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }

    /// IPv4 addresses assigned to the VM, once it is active.
    ///
    /// Nothing is returned while the VM is still building: addresses handed
    /// out before then are not guaranteed to be reachable.
    pub fn ipv4_addresses(&self) -> Vec<Ipv4Addr> {
        if !self.is_active() {
            return Vec::new();
        }
        self.addresses
            .values()
            .flatten()
            .filter_map(|addr| addr.parse::<Ipv4Addr>().ok())
            .collect()
    }
}

/// Compute service operations the controller depends on.
///
/// VMs are identified by name.  Implementations are reused sequentially
/// across requests within a pass.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn find_by_name(&self, name: &str) -> Result<Option<Vm>, BackendError>;

    /// Boots a VM described by `spec`, or returns the existing VM if one
    /// with the same name is already present.
    async fn create(&self, spec: &VmSpec) -> Result<Vm, BackendError>;

    /// Deletes the VM named `name`.  Fails with [`BackendError::NotFound`] if
    /// there is no such VM.
    async fn delete(&self, name: &str) -> Result<(), BackendError>;

    /// Addresses the VM can be reached at.
    fn addresses(&self, vm: &Vm) -> Vec<Ipv4Addr> {
        vm.ipv4_addresses()
    }
}
