//! Read and write access to watched Secrets.
//!
//! Reads come from the local reflector cache and hand out `Arc<Secret>`: shared,
//! immutable, possibly a little stale. Writes go to the API server and take an
//! owned `Secret`, so the only way to produce one from a cached read is an
//! explicit clone. The cache itself is never written through this module; the
//! change observer feeds it from the watch stream.
//!
//! [`LastKnownState`] is the side channel for deletions. Once a Secret is gone
//! from the cache its annotations are gone too, so the observer stashes the
//! final object here for the reconciler to revoke its key.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::secret::qualified_name;
use crate::{Error, Result, CONTROLLER_NAME};

/// Cached reads and authoritative writes of Secrets.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Current cached state of `key`, `None` if it does not exist
    fn get(&self, key: &ObjectRef<Secret>) -> Option<Arc<Secret>>;

    /// Replace the Secret on the API server, failing with
    /// [`Error::Conflict`] if it changed since it was read
    async fn update(&self, secret: Secret) -> Result<Secret>;
}

/// [`SecretStore`] backed by a reflector cache and the Kubernetes API.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
    cache: Store<Secret>,
}

impl KubeSecretStore {
    /// Create a store reading from `cache` and writing through `client`
    pub fn new(client: Client, cache: Store<Secret>) -> Self {
        Self { client, cache }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    fn get(&self, key: &ObjectRef<Secret>) -> Option<Arc<Secret>> {
        self.cache.get(key)
    }

    async fn update(&self, secret: Secret) -> Result<Secret> {
        let name = secret.name_any();
        let namespace = secret
            .namespace()
            .ok_or_else(|| Error::internal(format!("secret {name} has no namespace")))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        };

        match api.replace(&name, &params, &secret).await {
            Ok(updated) => {
                debug!(
                    secret = %qualified_name(&updated),
                    resource_version = ?updated.resource_version(),
                    "secret updated"
                );
                Ok(updated)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(Error::Conflict(qualified_name(&secret)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Last observed state of Secrets that have been deleted but whose deploy keys
/// may not be revoked yet.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct LastKnownState {
    entries: Arc<DashMap<ObjectRef<Secret>, Arc<Secret>>>,
}

impl LastKnownState {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the final state of a deleted Secret, replacing any older entry
    pub fn record(&self, key: ObjectRef<Secret>, secret: Arc<Secret>) {
        self.entries.insert(key, secret);
    }

    /// Last known state of `key`, if a deletion was observed
    pub fn get(&self, key: &ObjectRef<Secret>) -> Option<Arc<Secret>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the entry for `key` once its deploy key is handled
    pub fn remove(&self, key: &ObjectRef<Secret>) -> Option<Arc<Secret>> {
        self.entries.remove(key).map(|(_, secret)| secret)
    }

    /// Number of deletions awaiting revocation
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no deletions are pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
