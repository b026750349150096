//! Deploy key operator - mints and revokes GitLab deploy keys for Flux git Secrets
//!
//! Flux reads its git credentials from a Kubernetes Secret holding an SSH private
//! key. This operator watches those Secrets and, for each one in scope, registers
//! the matching public key as a deploy key on the GitLab project named by the
//! Secret's git-url annotation. The returned key id is written back onto the
//! Secret; when the Secret is deleted the key is revoked.
//!
//! # Architecture
//!
//! ```text
//! watch stream -> ChangeObserver -> WorkQueue -> workers -> reconcile
//!                      |                                      |
//!                 read cache  <-----------------------  SecretStore / GitLab
//! ```
//!
//! The registry is never polled: once a Secret carries a recorded key id it is
//! considered synced.
//!
//! # Modules
//!
//! - [`queue`] - Deduplicating, rate-limited work queue
//! - [`retry`] - Backoff policies for requeued items
//! - [`observer`] - Translates watch events into queue entries
//! - [`store`] - Cached reads and authoritative writes of Secrets
//! - [`gitlab`] - GitLab deploy key API client
//! - [`keys`] - Public key derivation from Secret key material
//! - [`secret`] - Label/annotation accessors for watched Secrets
//! - [`controller`] - Reconciliation logic and worker pool
//! - [`events`] - Kubernetes Event publishing
//! - [`config`] - Operator configuration
//! - [`signals`] - Two-stage shutdown handling
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod gitlab;
pub mod keys;
pub mod observer;
pub mod queue;
pub mod retry;
pub mod secret;
pub mod signals;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Wire contract
// =============================================================================
// Names shared with Flux and with Secrets already deployed in clusters. Changing
// any of these orphans existing deploy keys.

/// Label marking a Secret as in scope (presence only, value is ignored)
pub const SYNC_GC_MARK_LABEL: &str = "fluxcd.io/sync-gc-mark";

/// Annotation holding the git remote, `git@<host>:<group>/<project>[.git]`
pub const GIT_URL_ANNOTATION: &str = "fluxcd.io/git-url";

/// Annotation recording the GitLab deploy key id once minted
pub const DEPLOY_KEY_ID_ANNOTATION: &str = "fluxcd.io/deployKeyId";

/// Secret data field holding the SSH private key
pub const IDENTITY_DATA_KEY: &str = "identity";

/// Title given to every deploy key this operator creates
pub const DEPLOY_KEY_TITLE: &str = "Flux deployment key";

/// Name reported on Kubernetes Events and used as the field manager
pub const CONTROLLER_NAME: &str = "deploy-key-operator";

/// Default number of concurrent reconcile workers
pub const DEFAULT_WORKERS: usize = 2;

/// Default GitLab host
pub const DEFAULT_GITLAB_HOSTNAME: &str = "gitlab.com";
