// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::EventLog;
use crate::directory::DirectoryClient;
use crate::directory::DirectoryError;
use crate::directory::Environment;
use crate::directory::Nodeset;
use crate::directory::NodesetState;
use crate::directory::Project;
use crate::directory::Record;
use crate::directory::Request;
use crate::directory::User;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    requests: Vec<Request>,
    nodesets: BTreeMap<String, Nodeset>,
    projects: BTreeMap<String, Project>,
    users: BTreeMap<String, User>,
    environments: BTreeMap<String, Environment>,
    unavailable: bool,
    fail_store_in: Option<NodesetState>,
}

/// A fake [`DirectoryClient`] holding records in memory.
#[derive(Default)]
pub struct FakeDirectory {
    inner: Mutex<Inner>,
    events: EventLog,
}

impl FakeDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records nodeset writes and deletions in `events`.
    pub fn with_events(events: EventLog) -> Arc<Self> {
        Arc::new(Self { inner: Mutex::default(), events })
    }

    /// Adds `request`, or replaces the request of the same name in place.
    pub fn put_request(&self, request: Request) {
        let mut inner = self.inner.lock().unwrap();
        match inner.requests.iter_mut().find(|r| r.name == request.name) {
            Some(existing) => *existing = request,
            None => inner.requests.push(request),
        }
    }

    pub fn remove_request(&self, name: &str) {
        self.inner.lock().unwrap().requests.retain(|r| r.name != name);
    }

    pub fn request(&self, name: &str) -> Option<Request> {
        let inner = self.inner.lock().unwrap();
        inner.requests.iter().find(|r| r.name == name).cloned()
    }

    pub fn put_nodeset(&self, nodeset: Nodeset) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodesets.insert(nodeset.name.clone(), nodeset);
    }

    pub fn nodeset(&self, name: &str) -> Option<Nodeset> {
        self.inner.lock().unwrap().nodesets.get(name).cloned()
    }

    pub fn nodeset_count(&self) -> usize {
        self.inner.lock().unwrap().nodesets.len()
    }

    pub fn put_project(&self, project: Project) {
        let mut inner = self.inner.lock().unwrap();
        inner.projects.insert(project.name.clone(), project);
    }

    pub fn put_user(&self, user: User) {
        let mut inner = self.inner.lock().unwrap();
        inner.users.insert(user.name.clone(), user);
    }

    pub fn put_environment(&self, environment: Environment) {
        let mut inner = self.inner.lock().unwrap();
        inner.environments.insert(environment.name.clone(), environment);
    }

    /// While set, every call fails as though the service were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    /// The next attempt to store a nodeset in `state` fails as though the
    /// service were unreachable.
    pub fn fail_next_store(&self, state: NodesetState) {
        self.inner.lock().unwrap().fail_store_in = Some(state);
    }

    fn check_available(inner: &Inner) -> Result<(), DirectoryError> {
        if inner.unavailable {
            return Err(DirectoryError::Connection {
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

fn lookup<T: Record + Clone>(
    records: &BTreeMap<String, T>,
    name: &str,
) -> Result<T, DirectoryError> {
    records.get(name).cloned().ok_or_else(|| DirectoryError::Missing {
        kind: T::KIND,
        name: name.to_string(),
    })
}

#[async_trait]
impl DirectoryClient for FakeDirectory {
    async fn list_requests(&self) -> Result<Vec<Request>, DirectoryError> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        Ok(inner.requests.clone())
    }

    async fn get_nodeset(&self, name: &str) -> Result<Nodeset, DirectoryError> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        lookup(&inner.nodesets, name)
    }

    async fn store_nodeset(
        &self,
        nodeset: &Nodeset,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        if inner.fail_store_in == Some(nodeset.state) {
            inner.fail_store_in = None;
            return Err(DirectoryError::Connection {
                message: "connection reset".to_string(),
            });
        }
        inner.nodesets.insert(nodeset.name.clone(), nodeset.clone());
        self.events.record(format!("store {} {}", nodeset.name, nodeset.state));
        Ok(())
    }

    async fn delete_nodeset(&self, name: &str) -> Result<(), DirectoryError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        match inner.nodesets.remove(name) {
            Some(_) => {
                self.events.record(format!("delete nodeset {name}"));
                Ok(())
            }
            None => Err(DirectoryError::Missing {
                kind: Nodeset::KIND,
                name: name.to_string(),
            }),
        }
    }

    async fn get_project(&self, name: &str) -> Result<Project, DirectoryError> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        lookup(&inner.projects, name)
    }

    async fn get_user(&self, name: &str) -> Result<User, DirectoryError> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        lookup(&inner.users, name)
    }

    async fn get_environment(
        &self,
        name: &str,
    ) -> Result<Environment, DirectoryError> {
        let inner = self.inner.lock().unwrap();
        Self::check_available(&inner)?;
        lookup(&inner.environments, name)
    }
}
