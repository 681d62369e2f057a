// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! REST client for the information service.
//!
//! The service stores documents keyed by record kind.  Each document maps
//! record names to records:
//!
//! ```text
//! GET    /info/<kind>          -> {"<kind>": {"<name>": {...}, ...}}
//! GET    /info/<kind>/<name>   -> {"<kind>": {"<name>": {...}}}
//! PUT    /info/<kind>             body {"<kind>": {"<name>": {...}}}
//! DELETE /info/<kind>/<name>
//! ```

use super::DirectoryClient;
use super::DirectoryError;
use super::Environment;
use super::Nodeset;
use super::Project;
use super::Record;
use super::Request;
use super::User;
use async_trait::async_trait;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::time::Duration;

type Document = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

/// [`DirectoryClient`] backed by the information service's HTTP API.
pub struct HttpDirectory {
    log: Logger,
    base_url: reqwest::Url,
    client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(
        log: &Logger,
        base_url: &str,
        timeout: Duration,
    ) -> Result<HttpDirectory, DirectoryError> {
        let base_url = reqwest::Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| DirectoryError::Connection {
                message: format!("invalid directory URL {base_url:?}"),
            })?;
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|err| DirectoryError::Connection {
                message: format!("building HTTP client: {err}"),
            })?;
        Ok(HttpDirectory {
            log: log.new(o!("component" => "HttpDirectory")),
            base_url,
            client,
        })
    }

    /// Record names are percent-encoded as single path segments.
    fn url(&self, kind: &str, name: Option<&str>) -> reqwest::Url {
        let mut url = self.base_url.clone();
        // Cannot fail: `new` rejects URLs that cannot be a base.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("info").push(kind);
            if let Some(name) = name {
                segments.push(name);
            }
        }
        url
    }

    /// Fetches the document for records of type `T`, or only the record
    /// `name` if one is given.
    async fn fetch_document<T: Record>(
        &self,
        name: Option<&str>,
    ) -> Result<BTreeMap<String, serde_json::Value>, DirectoryError> {
        let response = self
            .client
            .get(self.url(T::KIND, name))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, T::KIND, name).await?;
        let mut document: Document =
            response.json().await.map_err(|err| {
                DirectoryError::InvalidRecord {
                    kind: T::KIND,
                    name: name.unwrap_or_default().to_string(),
                    message: format!("malformed document: {err}"),
                }
            })?;
        Ok(document.remove(T::KIND).unwrap_or_default())
    }

    async fn get_one<T: Record>(&self, name: &str) -> Result<T, DirectoryError> {
        let mut records = self.fetch_document::<T>(Some(name)).await?;
        let value = records.remove(name).ok_or_else(|| {
            DirectoryError::Missing { kind: T::KIND, name: name.to_string() }
        })?;
        parse_record(&self.log, name, value)
    }

    async fn put_one<T: Record>(&self, record: &T) -> Result<(), DirectoryError> {
        let name = record.name();
        let value = serde_json::to_value(record).map_err(|err| {
            DirectoryError::InvalidRecord {
                kind: T::KIND,
                name: name.to_string(),
                message: format!("serializing: {err}"),
            }
        })?;
        let document: Document = BTreeMap::from([(
            T::KIND.to_string(),
            BTreeMap::from([(name.to_string(), value)]),
        )]);
        let response = self
            .client
            .put(self.url(T::KIND, None))
            .json(&document)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, T::KIND, Some(name)).await?;
        Ok(())
    }
}

/// Deserializes one record filed under `name`, flagging any fields we do not
/// model.
fn parse_record<T: Record>(
    log: &Logger,
    name: &str,
    value: serde_json::Value,
) -> Result<T, DirectoryError> {
    let record: T = serde_json::from_value(value).map_err(|err| {
        DirectoryError::InvalidRecord {
            kind: T::KIND,
            name: name.to_string(),
            message: err.to_string(),
        }
    })?;

    if record.name() != name {
        return Err(DirectoryError::InvalidRecord {
            kind: T::KIND,
            name: name.to_string(),
            message: format!(
                "record is filed under {name:?} but names itself {:?}",
                record.name()
            ),
        });
    }

    let other = record.other_fields();
    if !other.is_empty() {
        debug!(
            log,
            "directory record has unrecognized fields";
            "kind" => T::KIND,
            "name" => name,
            "fields" => ?other.keys().collect::<Vec<_>>(),
        );
    }
    Ok(record)
}

fn transport_error(err: reqwest::Error) -> DirectoryError {
    DirectoryError::Connection { message: err.to_string() }
}

async fn check_status(
    response: reqwest::Response,
    kind: &'static str,
    name: Option<&str>,
) -> Result<reqwest::Response, DirectoryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        Err(DirectoryError::Missing {
            kind,
            name: name.unwrap_or_default().to_string(),
        })
    } else if status.is_server_error() {
        Err(DirectoryError::Connection {
            message: format!("{status}: {message}"),
        })
    } else {
        Err(DirectoryError::Http { status: status.as_u16(), message })
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectory {
    async fn list_requests(&self) -> Result<Vec<Request>, DirectoryError> {
        let records = self.fetch_document::<Request>(None).await?;
        let mut requests = Vec::with_capacity(records.len());
        for (name, value) in records {
            match parse_record::<Request>(&self.log, &name, value) {
                Ok(request) => requests.push(request),
                Err(err) => {
                    warn!(
                        self.log,
                        "skipping invalid request record";
                        "request" => &name,
                        "error" => %err,
                    );
                }
            }
        }
        Ok(requests)
    }

    async fn get_nodeset(&self, name: &str) -> Result<Nodeset, DirectoryError> {
        self.get_one(name).await
    }

    async fn store_nodeset(
        &self,
        nodeset: &Nodeset,
    ) -> Result<(), DirectoryError> {
        self.put_one(nodeset).await
    }

    async fn delete_nodeset(&self, name: &str) -> Result<(), DirectoryError> {
        let response = self
            .client
            .delete(self.url(Nodeset::KIND, Some(name)))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, Nodeset::KIND, Some(name)).await?;
        Ok(())
    }

    async fn get_project(&self, name: &str) -> Result<Project, DirectoryError> {
        self.get_one(name).await
    }

    async fn get_user(&self, name: &str) -> Result<User, DirectoryError> {
        self.get_one(name).await
    }

    async fn get_environment(
        &self,
        name: &str,
    ) -> Result<Environment, DirectoryError> {
        self.get_one(name).await
    }
}
