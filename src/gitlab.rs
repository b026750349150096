//! GitLab deploy key API client.
//!
//! The controller talks to the registry through [`DeployKeyRegistry`] so the
//! reconcile logic can be tested without a network. [`GitLabClient`] is the
//! production implementation against the GitLab REST v4 API.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Timeout applied to every GitLab request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on how much of an error body ends up in logs
const MAX_ERROR_BODY: usize = 512;

/// A GitLab project, as much of it as deploy keys need.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Project {
    /// Numeric project id
    pub id: u64,
    /// `group/project` path
    #[serde(default)]
    pub path_with_namespace: String,
}

/// A deploy key registered on a project.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DeployKey {
    /// Registry-assigned key id, recorded on the Secret
    pub id: u64,
    /// Human readable title
    #[serde(default)]
    pub title: String,
    /// Public key in `authorized_keys` form
    #[serde(default)]
    pub key: String,
    /// Whether the key may push
    #[serde(default)]
    pub can_push: bool,
}

#[derive(Serialize)]
struct CreateDeployKey<'a> {
    title: &'a str,
    key: &'a str,
    can_push: bool,
}

/// Operations the controller needs from the deploy key registry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeployKeyRegistry: Send + Sync {
    /// Look up a project by its `group/project` path
    async fn get_project(&self, path: &str) -> Result<Project>;

    /// Register `key` as a deploy key on the project
    async fn create_deploy_key(
        &self,
        project_id: u64,
        title: &str,
        key: &str,
        can_push: bool,
    ) -> Result<DeployKey>;

    /// Remove a deploy key from the project at `project_path`
    async fn delete_deploy_key(&self, project_path: &str, key_id: u64) -> Result<()>;
}

/// [`DeployKeyRegistry`] backed by the GitLab REST API.
#[derive(Clone)]
pub struct GitLabClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl std::fmt::Debug for GitLabClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitLabClient")
            .field("base_url", &self.base_url.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

impl GitLabClient {
    /// Create a client for `https://<hostname>/api/v4`.
    pub fn new(hostname: &str, token: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(&format!("https://{hostname}/api/v4")).map_err(|e| {
            Error::configuration(format!("invalid GitLab hostname {hostname:?}: {e}"))
        })?;
        Self::with_base_url(base_url, token)
    }

    /// Create a client against an explicit API root (e.g. `http://127.0.0.1:8080/api/v4`).
    pub fn with_base_url(base_url: Url, token: impl Into<String>) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(Error::configuration(format!(
                "GitLab API URL {base_url} cannot be a base"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("deploy-key-operator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            token: token.into(),
        })
    }

    /// Build a URL under the API root; each segment is percent-encoded, so a
    /// project path becomes a single `group%2Fproject` segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(&self, method: Method, url: Url, what: &str) -> Result<reqwest::Response> {
        self.send_with(self.http.request(method, url), what).await
    }

    async fn send_with(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response> {
        let response = request
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(|e| Error::registry_unreachable(format!("{what}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(Error::registry(status.as_u16(), format!("{what}: {body}")))
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T> {
    let status = response.status();
    response
        .json::<T>()
        .await
        .map_err(|e| Error::registry(status.as_u16(), format!("{what}: invalid response: {e}")))
}

#[async_trait]
impl DeployKeyRegistry for GitLabClient {
    async fn get_project(&self, path: &str) -> Result<Project> {
        let url = self.endpoint(&["projects", path]);
        debug!(project = %path, "looking up GitLab project");
        let response = self
            .send(Method::GET, url, &format!("get project {path}"))
            .await?;
        decode(response, "get project").await
    }

    async fn create_deploy_key(
        &self,
        project_id: u64,
        title: &str,
        key: &str,
        can_push: bool,
    ) -> Result<DeployKey> {
        let url = self.endpoint(&["projects", &project_id.to_string(), "deploy_keys"]);
        debug!(project_id, title, can_push, "creating deploy key");
        let request = self.http.post(url).json(&CreateDeployKey {
            title,
            key,
            can_push,
        });
        let response = self
            .send_with(request, &format!("create deploy key on project {project_id}"))
            .await?;
        decode(response, "create deploy key").await
    }

    async fn delete_deploy_key(&self, project_path: &str, key_id: u64) -> Result<()> {
        let url = self.endpoint(&[
            "projects",
            project_path,
            "deploy_keys",
            &key_id.to_string(),
        ]);
        debug!(project = %project_path, key_id, "deleting deploy key");
        self.send(
            Method::DELETE,
            url,
            &format!("delete deploy key {key_id} from {project_path}"),
        )
        .await?;
        Ok(())
    }
}
