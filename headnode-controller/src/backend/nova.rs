// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`ProvisioningBackend`] for OpenStack compute (Nova), authenticating with
//! Keystone v3 passwords.

use super::BackendError;
use super::ProvisioningBackend;
use super::Vm;
use super::VmSpec;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Tokens are refreshed this many seconds before Keystone says they expire.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Keystone credentials, scoped to the project headnodes are booted in.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NovaCredentials {
    /// Keystone endpoint, including the version (e.g. `.../v3`).
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub user_domain_name: String,
    pub project_name: String,
    pub project_domain_name: String,
    /// Region whose compute endpoint to use.  Any region if unset.
    #[serde(default)]
    pub region: Option<String>,
}

struct Session {
    token: String,
    compute_url: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Session {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                now + chrono::TimeDelta::seconds(TOKEN_EXPIRY_MARGIN_SECS)
                    < expires_at
            }
            None => true,
        }
    }
}

pub struct NovaBackend {
    log: Logger,
    credentials: NovaCredentials,
    client: reqwest::Client,
    session: Mutex<Option<Session>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Deserialize)]
struct TokenBody {
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize)]
struct CatalogEndpoint {
    interface: String,
    url: String,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Deserialize)]
struct ServerList {
    servers: Vec<ServerDetail>,
}

#[derive(Deserialize)]
struct ServerDetail {
    id: String,
    name: String,
    status: String,
    #[serde(default)]
    addresses: BTreeMap<String, Vec<ServerAddress>>,
}

#[derive(Deserialize)]
struct ServerAddress {
    addr: String,
}

#[derive(Deserialize)]
struct CreatedServer {
    server: CreatedServerBody,
}

#[derive(Deserialize)]
struct CreatedServerBody {
    id: String,
}

impl From<ServerDetail> for Vm {
    fn from(server: ServerDetail) -> Vm {
        Vm {
            id: server.id,
            name: server.name,
            status: server.status,
            addresses: server
                .addresses
                .into_iter()
                .map(|(network, addrs)| {
                    (network, addrs.into_iter().map(|a| a.addr).collect())
                })
                .collect(),
        }
    }
}

fn request_error(err: reqwest::Error) -> BackendError {
    BackendError::Request { message: err.to_string() }
}

async fn http_error(response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    BackendError::Http { status, message }
}

impl NovaBackend {
    pub fn new(
        log: &Logger,
        credentials: NovaCredentials,
        timeout: Duration,
    ) -> Result<NovaBackend, BackendError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(request_error)?;
        Ok(NovaBackend {
            log: log.new(o!("component" => "NovaBackend")),
            credentials,
            client,
            session: Mutex::new(None),
        })
    }

    /// Returns a token and compute endpoint, authenticating first if we have
    /// no token or it is about to expire.
    async fn session(&self) -> Result<(String, String), BackendError> {
        let mut session = self.session.lock().await;
        if let Some(s) = session.as_ref() {
            if s.is_fresh(Utc::now()) {
                return Ok((s.token.clone(), s.compute_url.clone()));
            }
        }
        let fresh = self.authenticate().await?;
        let result = (fresh.token.clone(), fresh.compute_url.clone());
        *session = Some(fresh);
        Ok(result)
    }

    async fn forget_session(&self) {
        *self.session.lock().await = None;
    }

    async fn authenticate(&self) -> Result<Session, BackendError> {
        let c = &self.credentials;
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": c.username,
                            "domain": { "name": c.user_domain_name },
                            "password": c.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": c.project_name,
                        "domain": { "name": c.project_domain_name },
                    }
                }
            }
        });
        let url =
            format!("{}/auth/tokens", c.auth_url.trim_end_matches('/'));
        debug!(self.log, "authenticating"; "url" => &url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| BackendError::Auth { message: err.to_string() })?;
        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Auth {
                message: format!("{status}: {message}"),
            });
        }
        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Auth {
                message: format!("response is missing {SUBJECT_TOKEN_HEADER}"),
            })?;
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|err| BackendError::Auth { message: err.to_string() })?;
        let compute_url = self.compute_endpoint(&parsed.token.catalog)?;
        info!(
            self.log,
            "authenticated";
            "compute_url" => &compute_url,
            "expires_at" => ?parsed.token.expires_at,
        );
        Ok(Session {
            token,
            compute_url,
            expires_at: parsed.token.expires_at,
        })
    }

    fn compute_endpoint(
        &self,
        catalog: &[CatalogEntry],
    ) -> Result<String, BackendError> {
        let region = self.credentials.region.as_deref();
        catalog
            .iter()
            .filter(|entry| entry.service_type == "compute")
            .flat_map(|entry| entry.endpoints.iter())
            .find(|endpoint| {
                endpoint.interface == "public"
                    && (region.is_none() || endpoint.region.as_deref() == region)
            })
            .map(|endpoint| endpoint.url.trim_end_matches('/').to_string())
            .ok_or_else(|| BackendError::Auth {
                message: "no public compute endpoint in service catalog"
                    .to_string(),
            })
    }

    /// Checks the status of a compute API response, dropping our token if
    /// the service no longer accepts it.
    async fn check(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BackendError> {
        if response.status().is_success() {
            return Ok(response);
        }
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.forget_session().await;
        }
        Err(http_error(response).await)
    }
}

#[async_trait]
impl ProvisioningBackend for NovaBackend {
    async fn find_by_name(&self, name: &str) -> Result<Option<Vm>, BackendError> {
        let (token, compute_url) = self.session().await?;
        let response = self
            .client
            .get(format!("{compute_url}/servers/detail"))
            .header(AUTH_TOKEN_HEADER, token)
            .query(&[("name", name)])
            .send()
            .await
            .map_err(request_error)?;
        let list: ServerList =
            self.check(response).await?.json().await.map_err(request_error)?;

        // The name filter is a regular expression match, so it may return
        // more than we asked for.
        let mut matching =
            list.servers.into_iter().filter(|server| server.name == name);
        let found = matching.next();
        if matching.next().is_some() {
            warn!(
                self.log,
                "more than one VM has this name, using the first";
                "name" => name,
            );
        }
        Ok(found.map(Vm::from))
    }

    async fn create(&self, spec: &VmSpec) -> Result<Vm, BackendError> {
        if let Some(vm) = self.find_by_name(&spec.name).await? {
            info!(
                self.log,
                "VM already exists";
                "name" => &spec.name,
                "id" => &vm.id,
            );
            return Ok(vm);
        }

        let (token, compute_url) = self.session().await?;
        let body = json!({
            "server": {
                "name": spec.name,
                "imageRef": spec.image,
                "flavorRef": spec.flavor,
                "key_name": spec.key_name,
                "security_groups": spec
                    .security_groups
                    .iter()
                    .map(|name| json!({ "name": name }))
                    .collect::<Vec<_>>(),
                "networks": [ { "uuid": spec.network_id } ],
            }
        });
        info!(self.log, "booting VM"; "name" => &spec.name);
        let response = self
            .client
            .post(format!("{compute_url}/servers"))
            .header(AUTH_TOKEN_HEADER, token)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        let created: CreatedServer =
            self.check(response).await?.json().await.map_err(request_error)?;
        Ok(Vm {
            id: created.server.id,
            name: spec.name.clone(),
            status: "BUILD".to_string(),
            addresses: BTreeMap::new(),
        })
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        let vm = self
            .find_by_name(name)
            .await?
            .ok_or_else(|| BackendError::NotFound { name: name.to_string() })?;
        let (token, compute_url) = self.session().await?;
        info!(self.log, "deleting VM"; "name" => name, "id" => &vm.id);
        let response = self
            .client
            .delete(format!("{compute_url}/servers/{}", vm.id))
            .header(AUTH_TOKEN_HEADER, token)
            .send()
            .await
            .map_err(request_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound { name: name.to_string() });
        }
        self.check(response).await?;
        Ok(())
    }
}
