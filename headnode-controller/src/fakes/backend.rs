// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::EventLog;
use crate::backend::BackendError;
use crate::backend::ProvisioningBackend;
use crate::backend::Vm;
use crate::backend::VmSpec;
use crate::backend::STATUS_ACTIVE;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    vms: BTreeMap<String, Vm>,
    specs: Vec<VmSpec>,
    next_id: u32,
    fail_create: bool,
    fail_delete: bool,
}

/// A fake [`ProvisioningBackend`].
///
/// VMs come up active immediately, each on its own address in 10.0.0.0/24,
/// unless a test changes their status with [`FakeBackend::set_status`].
#[derive(Default)]
pub struct FakeBackend {
    inner: Mutex<Inner>,
    events: EventLog,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records VM creations and deletions in `events`.
    pub fn with_events(events: EventLog) -> Arc<Self> {
        Arc::new(Self { inner: Mutex::default(), events })
    }

    pub fn vm(&self, name: &str) -> Option<Vm> {
        self.inner.lock().unwrap().vms.get(name).cloned()
    }

    /// Every spec a VM was booted from, in order.
    pub fn booted(&self) -> Vec<VmSpec> {
        self.inner.lock().unwrap().specs.clone()
    }

    pub fn set_status(&self, name: &str, status: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(vm) = inner.vms.get_mut(name) {
            vm.status = status.to_string();
        }
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.inner.lock().unwrap().fail_create = fail;
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.inner.lock().unwrap().fail_delete = fail;
    }
}

#[async_trait]
impl ProvisioningBackend for FakeBackend {
    async fn find_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Vm>, BackendError> {
        Ok(self.vm(name))
    }

    async fn create(&self, spec: &VmSpec) -> Result<Vm, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(vm) = inner.vms.get(&spec.name) {
            return Ok(vm.clone());
        }
        if inner.fail_create {
            return Err(BackendError::Http {
                status: 403,
                message: "quota exceeded".to_string(),
            });
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let vm = Vm {
            id: format!("vm-{id}"),
            name: spec.name.clone(),
            status: STATUS_ACTIVE.to_string(),
            addresses: BTreeMap::from([(
                "private".to_string(),
                vec![format!("10.0.0.{id}")],
            )]),
        };
        inner.vms.insert(spec.name.clone(), vm.clone());
        inner.specs.push(spec.clone());
        self.events.record(format!("create vm {}", spec.name));
        Ok(vm)
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_delete {
            return Err(BackendError::Request {
                message: "connection reset".to_string(),
            });
        }
        match inner.vms.remove(name) {
            Some(_) => {
                self.events.record(format!("delete vm {name}"));
                Ok(())
            }
            None => Err(BackendError::NotFound { name: name.to_string() }),
        }
    }
}
