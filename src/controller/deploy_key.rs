//! Deploy key reconciliation for a single Secret identity.
//!
//! Given a queued identity the reconciler re-reads the Secret and makes one of
//! a handful of decisions:
//!
//! | Observed                                   | Action                          |
//! |--------------------------------------------|---------------------------------|
//! | not in the cache                           | revoke the key recorded at deletion, if any |
//! | missing sync label or git-url annotation   | nothing                         |
//! | already has a deploy key id                | nothing (registry is not polled) |
//! | in scope, no key id                        | create key, record its id       |
//!
//! Errors are returned unchanged; the worker decides between backoff and drop
//! based on [`Error::is_retryable`].

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::events::{EventPublisher, NoopEventPublisher, SecretEvent};
use crate::gitlab::DeployKeyRegistry;
use crate::keys::public_key_from_private;
use crate::secret::{
    deploy_key_id, identity, is_in_scope, key_name, project_path, qualified_name,
    with_deploy_key_id,
};
use crate::store::{LastKnownState, SecretStore};
use crate::{Error, Result, DEFAULT_GITLAB_HOSTNAME, DEPLOY_KEY_TITLE};

/// What a single reconcile did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A deploy key was created and its id recorded on the Secret
    Created {
        /// Registry id of the new key
        deploy_key_id: u64,
    },
    /// The Secret already records a deploy key
    AlreadySynced,
    /// The Secret is not managed by this controller
    OutOfScope,
    /// The Secret is gone and its deploy key was revoked
    Revoked {
        /// Registry id of the revoked key
        deploy_key_id: u64,
    },
    /// The Secret is gone and there was no key to revoke
    Gone,
}

/// Controller context containing shared clients and configuration
///
/// Shared by every worker. Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(store, registry)
///     .events(Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)))
///     .gitlab_hostname("gitlab.example.io")
///     .build();
/// ```
pub struct Context {
    /// Cached reads and authoritative writes of Secrets
    pub store: Arc<dyn SecretStore>,
    /// Deploy key registry (GitLab)
    pub registry: Arc<dyn DeployKeyRegistry>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Final state of deleted Secrets, filled by the change observer
    pub last_known: LastKnownState,
    /// Host git-url annotations must point at
    pub gitlab_hostname: String,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        store: Arc<dyn SecretStore>,
        registry: Arc<dyn DeployKeyRegistry>,
    ) -> ContextBuilder {
        ContextBuilder::new(store, registry)
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    store: Arc<dyn SecretStore>,
    registry: Arc<dyn DeployKeyRegistry>,
    events: Option<Arc<dyn EventPublisher>>,
    last_known: Option<LastKnownState>,
    gitlab_hostname: String,
}

impl ContextBuilder {
    fn new(store: Arc<dyn SecretStore>, registry: Arc<dyn DeployKeyRegistry>) -> Self {
        Self {
            store,
            registry,
            events: None,
            last_known: None,
            gitlab_hostname: DEFAULT_GITLAB_HOSTNAME.to_string(),
        }
    }

    /// Set the Event publisher (defaults to dropping events)
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share the deletion ledger with the change observer
    pub fn last_known(mut self, last_known: LastKnownState) -> Self {
        self.last_known = Some(last_known);
        self
    }

    /// Set the GitLab host git-url annotations must match
    pub fn gitlab_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.gitlab_hostname = hostname.into();
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self.store,
            registry: self.registry,
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            last_known: self.last_known.unwrap_or_default(),
            gitlab_hostname: self.gitlab_hostname,
        }
    }
}

/// Reconcile the Secret identified by `key`
///
/// Always works from the current cache contents, never from the event that
/// queued the key.
#[instrument(skip(key, ctx), fields(secret = %key_name(&key)))]
pub async fn reconcile(key: ObjectRef<Secret>, ctx: Arc<Context>) -> Result<SyncOutcome> {
    let Some(secret) = ctx.store.get(&key) else {
        return revoke_deleted(&key, &ctx).await;
    };

    if let Some(stale) = ctx.last_known.get(&key) {
        revoke_replaced(&key, &stale, &secret, &ctx).await?;
    }

    if !is_in_scope(&secret) {
        debug!("secret is not managed by this controller");
        return Ok(SyncOutcome::OutOfScope);
    }

    if let Some(id) = deploy_key_id(&secret)? {
        debug!(deploy_key_id = id, "secret already synced");
        return Ok(SyncOutcome::AlreadySynced);
    }

    create(secret, &ctx).await
}

/// Create a deploy key for an unsynced Secret and record its id.
async fn create(secret: Arc<Secret>, ctx: &Context) -> Result<SyncOutcome> {
    let name = qualified_name(&secret);
    let path = project_path(&secret, &ctx.gitlab_hostname)?;
    // Parse before any registry call: malformed keys never cost an API round trip
    let public_key = public_key_from_private(&name, identity(&secret)?)?;

    let project = ctx.registry.get_project(&path).await?;
    let key = ctx
        .registry
        .create_deploy_key(project.id, DEPLOY_KEY_TITLE, &public_key, true)
        .await?;
    info!(project = %path, deploy_key_id = key.id, "deploy key created");

    // The cached object is shared; the write takes an owned copy
    let updated = with_deploy_key_id(Secret::clone(&secret), key.id);
    if let Err(e) = ctx.store.update(updated).await {
        // The key id was not recorded, so the next attempt mints a new key.
        // Remove this one rather than leave it orphaned in GitLab.
        warn!(
            deploy_key_id = key.id,
            error = %e,
            "failed to record deploy key, revoking it"
        );
        if let Err(revoke_err) = ctx.registry.delete_deploy_key(&path, key.id).await {
            warn!(
                deploy_key_id = key.id,
                error = %revoke_err,
                "failed to revoke unrecorded deploy key"
            );
        }
        return Err(e);
    }

    ctx.events.publish(&secret, SecretEvent::Synced).await;
    info!(deploy_key_id = key.id, "secret synced");
    Ok(SyncOutcome::Created {
        deploy_key_id: key.id,
    })
}

/// Handle a Secret that is no longer in the cache.
async fn revoke_deleted(key: &ObjectRef<Secret>, ctx: &Context) -> Result<SyncOutcome> {
    let Some(last) = ctx.last_known.get(key) else {
        debug!("secret not found and no deletion recorded");
        return Ok(SyncOutcome::Gone);
    };

    let revoked = revoke(&last, ctx).await?;
    ctx.last_known.remove(key);
    Ok(match revoked {
        Some(deploy_key_id) => SyncOutcome::Revoked { deploy_key_id },
        None => SyncOutcome::Gone,
    })
}

/// A Secret was deleted and recreated under the same name before the deletion
/// was reconciled. Revoke the old object's key unless the new one reuses it.
async fn revoke_replaced(
    key: &ObjectRef<Secret>,
    stale: &Secret,
    current: &Secret,
    ctx: &Context,
) -> Result<()> {
    let same_object = stale.uid().is_some() && stale.uid() == current.uid();
    let same_key = matches!(
        (deploy_key_id(stale), deploy_key_id(current)),
        (Ok(Some(a)), Ok(Some(b))) if a == b
    );
    if !same_object && !same_key {
        info!("secret was recreated, revoking the previous deploy key");
        revoke(stale, ctx).await?;
    }
    ctx.last_known.remove(key);
    Ok(())
}

/// Revoke the deploy key recorded on `secret`.
///
/// Returns the revoked id, or `None` if nothing usable was recorded. A key the
/// registry no longer knows counts as revoked.
async fn revoke(secret: &Secret, ctx: &Context) -> Result<Option<u64>> {
    let id = match deploy_key_id(secret) {
        Ok(Some(id)) => id,
        Ok(None) => {
            debug!("no deploy key recorded, nothing to revoke");
            return Ok(None);
        }
        Err(e) => {
            warn!(error = %e, "recorded deploy key id is unusable, skipping revoke");
            return Ok(None);
        }
    };
    let path = match project_path(secret, &ctx.gitlab_hostname) {
        Ok(path) => path,
        Err(e) => {
            warn!(deploy_key_id = id, error = %e, "cannot locate project, skipping revoke");
            return Ok(None);
        }
    };

    match ctx.registry.delete_deploy_key(&path, id).await {
        Ok(()) => info!(project = %path, deploy_key_id = id, "deploy key revoked"),
        Err(e) if e.is_registry_not_found() => {
            info!(project = %path, deploy_key_id = id, "deploy key already gone")
        }
        Err(e) => return Err(e),
    }

    ctx.events
        .publish(
            secret,
            SecretEvent::Revoked {
                deploy_key_id: id,
                project: path,
            },
        )
        .await;
    Ok(Some(id))
}

/// Record a Warning event for input that will not be retried.
pub(crate) async fn report_malformed(key: &ObjectRef<Secret>, error: &Error, ctx: &Context) {
    let Some(secret) = ctx.store.get(key).or_else(|| ctx.last_known.get(key)) else {
        return;
    };
    ctx.events
        .publish(
            &secret,
            SecretEvent::Invalid {
                message: error.to_string(),
            },
        )
        .await;
}
