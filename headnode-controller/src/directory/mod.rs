// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Records held by the directory (information) service, and the client
//! interface the controller uses to read and write them.
//!
//! Requests, projects, users and environments are owned by other services and
//! are only ever read here.  Nodesets describing headnodes are created,
//! updated and deleted by the controller.
//!
//! Records are validated when they cross this boundary: a record missing a
//! required field, or a nodeset in a state we do not know about, is rejected
//! with [`DirectoryError::InvalidRecord`] rather than filled in with defaults.
//! Fields we do not model are kept in an `other` map so that storing a
//! nodeset back never drops data written by another component.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

mod http;

pub use http::HttpDirectory;

/// Fields present in a record that this crate does not interpret.
pub type OtherFields = BTreeMap<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The directory service could not be reached (or answered with a server
    /// error).  Callers should retry on a later pass.
    #[error("directory service unavailable: {message}")]
    Connection { message: String },

    #[error("{kind} {name:?} does not exist")]
    Missing { kind: &'static str, name: String },

    #[error("invalid {kind} record {name:?}: {message}")]
    InvalidRecord { kind: &'static str, name: String, message: String },

    #[error("unexpected response from directory service: {status}: {message}")]
    Http { status: u16, message: String },
}

impl DirectoryError {
    pub fn is_connection(&self) -> bool {
        matches!(self, DirectoryError::Connection { .. })
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, DirectoryError::Missing { .. })
    }
}

/// Lifecycle state of a request, as written by the master process.
///
/// Only the states that drive headnode creation and teardown are
/// distinguished.  Everything else is carried through verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum RequestState {
    Initializing,
    Cleanup,
    Terminated,
    Other(String),
}

impl RequestState {
    /// Whether the headnode for a request in this state should be torn down.
    pub fn is_terminating(&self) -> bool {
        matches!(self, RequestState::Cleanup | RequestState::Terminated)
    }
}

impl From<String> for RequestState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "initializing" => RequestState::Initializing,
            "cleanup" => RequestState::Cleanup,
            "terminated" => RequestState::Terminated,
            _ => RequestState::Other(value),
        }
    }
}

impl From<RequestState> for String {
    fn from(value: RequestState) -> Self {
        match value {
            RequestState::Initializing => "initializing".to_string(),
            RequestState::Cleanup => "cleanup".to_string(),
            RequestState::Terminated => "terminated".to_string(),
            RequestState::Other(s) => s,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestState::Initializing => f.write_str("initializing"),
            RequestState::Cleanup => f.write_str("cleanup"),
            RequestState::Terminated => f.write_str("terminated"),
            RequestState::Other(s) => f.write_str(s),
        }
    }
}

/// A tenant's request for a virtual cluster.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Request {
    pub name: String,
    pub owner: String,
    pub project: Option<String>,
    #[serde(default)]
    pub environments: Vec<String>,
    /// Name of the nodeset describing this request's headnode.  Unset until
    /// the master has picked one.
    pub headnode: Option<String>,
    pub state: RequestState,
    #[serde(flatten)]
    pub other: OtherFields,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodesetState {
    New,
    Booting,
    Initializing,
    Running,
    Failure,
    Terminated,
}

impl fmt::Display for NodesetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodesetState::New => "new",
            NodesetState::Booting => "booting",
            NodesetState::Initializing => "initializing",
            NodesetState::Running => "running",
            NodesetState::Failure => "failure",
            NodesetState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

pub const HEADNODE_APP_TYPE: &str = "htcondor";
pub const HEADNODE_APP_ROLE: &str = "head-node";

/// A set of provisioned nodes.  For headnodes, exactly one VM.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Nodeset {
    pub name: String,
    pub owner: String,
    pub node_number: u32,
    pub app_type: String,
    pub app_role: String,
    /// Address the VM was reached at.
    pub app_host: Option<String>,
    /// Base64-encoded secret produced by configuring the headnode.
    pub app_sectoken: Option<String>,
    pub state: NodesetState,
    pub environment: Option<String>,
    pub description: Option<String>,
    pub displayname: Option<String>,
    #[serde(flatten)]
    pub other: OtherFields,
}

impl Nodeset {
    /// Describes a fresh headnode named `name` for `request`.
    pub fn new_headnode(request: &Request, name: &str) -> Nodeset {
        Nodeset {
            name: name.to_string(),
            owner: request.owner.clone(),
            node_number: 1,
            app_type: HEADNODE_APP_TYPE.to_string(),
            app_role: HEADNODE_APP_ROLE.to_string(),
            app_host: None,
            app_sectoken: None,
            state: NodesetState::New,
            environment: None,
            description: Some(format!(
                "Headnode nodeset automatically created: {name}"
            )),
            displayname: Some(name.to_string()),
            other: OtherFields::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Project {
    pub name: String,
    pub owner: String,
    pub members: Option<Vec<String>>,
    #[serde(flatten)]
    pub other: OtherFields,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct User {
    pub name: String,
    pub sshpubstring: Option<String>,
    #[serde(flatten)]
    pub other: OtherFields,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Environment {
    pub name: String,
    pub packagelist: Option<Vec<String>>,
    #[serde(flatten)]
    pub other: OtherFields,
}

/// Behavior shared by every kind of directory record.
pub trait Record: DeserializeOwned + Serialize {
    /// Name of the document records of this kind are filed under.
    const KIND: &'static str;

    fn name(&self) -> &str;

    /// Fields present in the stored record that this crate does not model.
    fn other_fields(&self) -> &OtherFields;
}

macro_rules! impl_record {
    ($ty:ty, $kind:literal) => {
        impl Record for $ty {
            const KIND: &'static str = $kind;

            fn name(&self) -> &str {
                &self.name
            }

            fn other_fields(&self) -> &OtherFields {
                &self.other
            }
        }
    };
}

impl_record!(Request, "request");
impl_record!(Nodeset, "nodeset");
impl_record!(Project, "project");
impl_record!(User, "user");
impl_record!(Environment, "environment");

/// Access to the directory service.
///
/// Implementations are used sequentially from a single reconciliation pass and
/// need not support concurrent passes.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Lists every request, in the order the directory returns them.
    async fn list_requests(&self) -> Result<Vec<Request>, DirectoryError>;

    async fn get_nodeset(&self, name: &str) -> Result<Nodeset, DirectoryError>;

    /// Creates or replaces the nodeset named `nodeset.name`.
    async fn store_nodeset(
        &self,
        nodeset: &Nodeset,
    ) -> Result<(), DirectoryError>;

    async fn delete_nodeset(&self, name: &str) -> Result<(), DirectoryError>;

    async fn get_project(&self, name: &str) -> Result<Project, DirectoryError>;

    async fn get_user(&self, name: &str) -> Result<User, DirectoryError>;

    async fn get_environment(
        &self,
        name: &str,
    ) -> Result<Environment, DirectoryError>;
}
