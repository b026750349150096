//! Operator configuration.

use std::fmt;

use crate::retry::RetryConfig;
use crate::{Error, Result, DEFAULT_GITLAB_HOSTNAME, DEFAULT_WORKERS, SYNC_GC_MARK_LABEL};

/// Runtime configuration, assembled from flags and environment by the binary.
#[derive(Clone, PartialEq)]
pub struct ControllerConfig {
    /// GitLab host, also the host git-url annotations must point at
    pub gitlab_hostname: String,
    /// GitLab personal or project access token
    pub gitlab_token: String,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Namespace to watch; all namespaces when `None`
    pub namespace: Option<String>,
    /// Label selector for the Secret watch
    pub label_selector: String,
    /// Backoff and rate limits for failed items
    pub retry: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            gitlab_hostname: DEFAULT_GITLAB_HOSTNAME.to_string(),
            gitlab_token: String::new(),
            workers: DEFAULT_WORKERS,
            namespace: None,
            label_selector: SYNC_GC_MARK_LABEL.to_string(),
            retry: RetryConfig::default(),
        }
    }
}

// Keep the token out of logs
impl fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("gitlab_hostname", &self.gitlab_hostname)
            .field("gitlab_token", &"<redacted>")
            .field("workers", &self.workers)
            .field("namespace", &self.namespace)
            .field("label_selector", &self.label_selector)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ControllerConfig {
    /// Reject configurations the operator cannot run with
    pub fn validate(&self) -> Result<()> {
        let host = self.gitlab_hostname.trim();
        if host.is_empty() {
            return Err(Error::configuration("GitLab hostname must not be empty"));
        }
        if host.contains("://") || host.contains('/') {
            return Err(Error::configuration(format!(
                "GitLab hostname {host:?} must be a bare host name, not a URL"
            )));
        }
        if self.gitlab_token.trim().is_empty() {
            return Err(Error::configuration(
                "GitLab token is required (--gitlab-token or GITLAB_TOKEN)",
            ));
        }
        if self.workers == 0 {
            return Err(Error::configuration("at least one worker is required"));
        }
        if self.label_selector.trim().is_empty() {
            return Err(Error::configuration("label selector must not be empty"));
        }
        if !(self.retry.qps.is_finite() && self.retry.qps > 0.0) {
            return Err(Error::configuration("retry qps must be positive"));
        }
        if self.retry.burst == 0 {
            return Err(Error::configuration("retry burst must be positive"));
        }
        if self.retry.base_delay.is_zero() || self.retry.base_delay > self.retry.max_delay {
            return Err(Error::configuration(
                "retry base delay must be nonzero and not exceed the max delay",
            ));
        }
        Ok(())
    }
}
