//! Error types for the deploy key operator
//!
//! Errors fall into two groups. Transient failures (Kubernetes API, GitLab
//! API, write conflicts) are retried with rate-limited backoff. Malformed
//! input (bad key material, bad annotations) will never succeed on retry and
//! is dropped until the Secret changes.

use thiserror::Error;

/// Main error type for deploy key operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// GitLab API returned an error or could not be reached
    #[error("registry error{}: {message}", fmt_status(.status))]
    Registry {
        /// HTTP status code, if a response was received
        status: Option<u16>,
        /// Description of what failed
        message: String,
    },

    /// Secret content that can never be reconciled as-is
    #[error("malformed secret {secret}: {message}")]
    Malformed {
        /// Namespaced name of the offending Secret
        secret: String,
        /// Description of what's invalid
        message: String,
    },

    /// Optimistic concurrency failure on the authoritative write
    #[error("conflict updating {0}: object was modified")]
    Conflict(String),

    /// Invalid operator configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a registry error for a response with the given status
    pub fn registry(status: u16, msg: impl Into<String>) -> Self {
        Self::Registry {
            status: Some(status),
            message: msg.into(),
        }
    }

    /// Create a registry error for a request that never got a response
    pub fn registry_unreachable(msg: impl Into<String>) -> Self {
        Self::Registry {
            status: None,
            message: msg.into(),
        }
    }

    /// Create a malformed-input error for the given Secret
    pub fn malformed(secret: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Malformed {
            secret: secret.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is worth retrying
    ///
    /// Malformed input and configuration errors need a human to change
    /// something first. Everything else is treated as transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Malformed { .. } | Error::Configuration(_))
    }

    /// Check if the registry reported the resource as missing
    pub fn is_registry_not_found(&self) -> bool {
        matches!(
            self,
            Error::Registry {
                status: Some(404),
                ..
            }
        )
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}
