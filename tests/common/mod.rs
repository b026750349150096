//! Shared fakes for integration tests.
//!
//! `FakeCluster` stands in for the API server: it owns the authoritative
//! Secrets and feeds every change through a real [`ChangeObserver`], so the
//! reflector cache, the deletion ledger and the work queue behave as they do
//! against a live watch. `FakeRegistry` records every GitLab call.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::runtime::events::EventType;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher;
use parking_lot::Mutex;

use deploy_key_operator::controller::{Context, SecretQueue};
use deploy_key_operator::events::{EventPublisher, SecretEvent};
use deploy_key_operator::gitlab::{DeployKey, DeployKeyRegistry, Project};
use deploy_key_operator::observer::ChangeObserver;
use deploy_key_operator::queue::WorkQueue;
use deploy_key_operator::retry::ItemExponentialLimiter;
use deploy_key_operator::store::{LastKnownState, SecretStore};
use deploy_key_operator::{
    Error, Result, DEPLOY_KEY_ID_ANNOTATION, GIT_URL_ANNOTATION, IDENTITY_DATA_KEY,
    SYNC_GC_MARK_LABEL,
};

pub const IDENTITY: &str = include_str!("../fixtures/identity_ed25519");
pub const PUBLIC_KEY: &str = include_str!("../fixtures/identity_ed25519.pub");

/// A Flux git Secret for `git@gitlab.com:{path}.git` with a valid identity.
pub fn flux_secret(namespace: &str, name: &str, path: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                SYNC_GC_MARK_LABEL.to_string(),
                "sha256.abc".to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                GIT_URL_ANNOTATION.to_string(),
                format!("git@gitlab.com:{path}.git"),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            IDENTITY_DATA_KEY.to_string(),
            ByteString(IDENTITY.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// The deploy key id recorded on `secret`, if any.
pub fn recorded_key_id(secret: &Secret) -> Option<String> {
    secret
        .metadata
        .annotations
        .as_ref()?
        .get(DEPLOY_KEY_ID_ANNOTATION)
        .cloned()
}

pub fn test_queue() -> Arc<SecretQueue> {
    WorkQueue::new(
        "test",
        ItemExponentialLimiter::new(Duration::from_millis(10), Duration::from_secs(1)),
    )
}

// =============================================================================
// API server
// =============================================================================

pub struct FakeCluster {
    objects: Mutex<HashMap<ObjectRef<Secret>, Secret>>,
    observer: Mutex<ChangeObserver>,
    cache: Store<Secret>,
    writes: Mutex<HashMap<ObjectRef<Secret>, usize>>,
    next_version: AtomicU64,
}

impl FakeCluster {
    pub fn new(queue: Arc<SecretQueue>, last_known: LastKnownState) -> Arc<Self> {
        let (cache, writer) = reflector::store::<Secret>();
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            observer: Mutex::new(ChangeObserver::new(writer, queue, last_known)),
            cache,
            writes: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(1),
        })
    }

    fn bump(&self, secret: &mut Secret) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        secret.metadata.resource_version = Some(version.to_string());
    }

    /// Create or overwrite a Secret as a user would, emitting a watch event.
    pub fn apply(&self, mut secret: Secret) -> ObjectRef<Secret> {
        let key = ObjectRef::from_obj(&secret);
        let mut objects = self.objects.lock();
        let uid = match objects.get(&key) {
            Some(existing) => existing.metadata.uid.clone(),
            None => Some(format!(
                "uid-{}",
                self.next_version.load(Ordering::SeqCst)
            )),
        };
        secret.metadata.uid = uid;
        self.bump(&mut secret);
        objects.insert(key.clone(), secret.clone());
        self.observer.lock().observe(watcher::Event::Apply(secret));
        key
    }

    /// Delete a Secret, emitting the final state on the watch.
    pub fn delete(&self, key: &ObjectRef<Secret>) {
        if let Some(secret) = self.objects.lock().remove(key) {
            self.observer.lock().observe(watcher::Event::Delete(secret));
        }
    }

    /// Delete a Secret without telling the watch, as if it happened during
    /// a disconnect.
    pub fn delete_silently(&self, key: &ObjectRef<Secret>) {
        self.objects.lock().remove(key);
    }

    /// Create a Secret without telling the watch, as if it happened during
    /// a disconnect.
    pub fn create_silently(&self, mut secret: Secret) -> ObjectRef<Secret> {
        let key = ObjectRef::from_obj(&secret);
        secret.metadata.uid = Some(format!(
            "uid-{}",
            self.next_version.load(Ordering::SeqCst)
        ));
        self.bump(&mut secret);
        self.objects.lock().insert(key.clone(), secret);
        key
    }

    /// Replay a full re-list of the current objects.
    pub fn relist(&self) {
        self.begin_relist();
        self.finish_relist();
    }

    /// Stream the listing of a re-list without completing it.
    pub fn begin_relist(&self) {
        let objects: Vec<Secret> = self.objects.lock().values().cloned().collect();
        let mut observer = self.observer.lock();
        observer.observe(watcher::Event::Init);
        for secret in objects {
            observer.observe(watcher::Event::InitApply(secret));
        }
    }

    /// Complete a re-list started with [`begin_relist`](Self::begin_relist).
    pub fn finish_relist(&self) {
        self.observer.lock().observe(watcher::Event::InitDone);
    }

    pub fn get_authoritative(&self, key: &ObjectRef<Secret>) -> Option<Secret> {
        self.objects.lock().get(key).cloned()
    }

    pub fn writes(&self, key: &ObjectRef<Secret>) -> usize {
        self.writes.lock().get(key).copied().unwrap_or(0)
    }

    pub fn total_writes(&self) -> usize {
        self.writes.lock().values().sum()
    }
}

#[async_trait]
impl SecretStore for FakeCluster {
    fn get(&self, key: &ObjectRef<Secret>) -> Option<Arc<Secret>> {
        self.cache.get(key)
    }

    async fn update(&self, mut secret: Secret) -> Result<Secret> {
        let key = ObjectRef::from_obj(&secret);
        {
            let mut objects = self.objects.lock();
            let Some(current) = objects.get(&key) else {
                return Err(Error::internal(format!("secret {key} not found")));
            };
            if current.metadata.resource_version != secret.metadata.resource_version {
                return Err(Error::Conflict(key.to_string()));
            }
            self.bump(&mut secret);
            objects.insert(key.clone(), secret.clone());
            *self.writes.lock().entry(key).or_default() += 1;
        }
        self.observer
            .lock()
            .observe(watcher::Event::Apply(secret.clone()));
        Ok(secret)
    }
}

// =============================================================================
// GitLab
// =============================================================================

#[derive(Default)]
pub struct FakeRegistry {
    projects: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
    pub looked_up: Mutex<Vec<String>>,
    /// (project id, public key) of every successful create
    pub created: Mutex<Vec<(u64, String)>>,
    /// (project path, key id) of every delete
    pub deleted: Mutex<Vec<(String, u64)>>,
    fail_creates: AtomicUsize,
}

impl FakeRegistry {
    /// Fail the next `n` create calls with a 503.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn project_id(&self, path: &str) -> Option<u64> {
        self.projects.lock().get(path).copied()
    }

    pub fn creates(&self) -> usize {
        self.created.lock().len()
    }

    pub fn calls(&self) -> usize {
        self.looked_up.lock().len() + self.created.lock().len() + self.deleted.lock().len()
    }
}

#[async_trait]
impl DeployKeyRegistry for FakeRegistry {
    async fn get_project(&self, path: &str) -> Result<Project> {
        self.looked_up.lock().push(path.to_string());
        let id = *self
            .projects
            .lock()
            .entry(path.to_string())
            .or_insert_with(|| 1000 + self.next_id.fetch_add(1, Ordering::SeqCst));
        Ok(Project {
            id,
            path_with_namespace: path.to_string(),
        })
    }

    async fn create_deploy_key(
        &self,
        project_id: u64,
        title: &str,
        key: &str,
        can_push: bool,
    ) -> Result<DeployKey> {
        let failing = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::registry(503, "service unavailable"));
        }
        self.created.lock().push((project_id, key.to_string()));
        Ok(DeployKey {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            title: title.to_string(),
            key: key.to_string(),
            can_push,
        })
    }

    async fn delete_deploy_key(&self, project_path: &str, key_id: u64) -> Result<()> {
        self.deleted.lock().push((project_path.to_string(), key_id));
        Ok(())
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Default)]
pub struct EventCapture {
    pub events: Mutex<Vec<(EventType, String)>>,
}

impl EventCapture {
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, r)| r.clone()).collect()
    }
}

#[async_trait]
impl EventPublisher for EventCapture {
    async fn publish(&self, _secret: &Secret, event: SecretEvent) {
        self.events
            .lock()
            .push((event.type_(), event.reason().to_string()));
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub queue: Arc<SecretQueue>,
    pub cluster: Arc<FakeCluster>,
    pub registry: Arc<FakeRegistry>,
    pub events: Arc<EventCapture>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new() -> Self {
        let queue = test_queue();
        let last_known = LastKnownState::new();
        let cluster = FakeCluster::new(queue.clone(), last_known.clone());
        let registry = Arc::new(FakeRegistry::default());
        let events = Arc::new(EventCapture::default());
        let ctx = Arc::new(
            Context::builder(cluster.clone(), registry.clone())
                .events(events.clone())
                .last_known(last_known)
                .build(),
        );
        Self {
            queue,
            cluster,
            registry,
            events,
            ctx,
        }
    }

    /// Process items until the queue has nothing ready.
    pub async fn drain(&self) {
        while !self.queue.is_empty() {
            deploy_key_operator::controller::process_next_work_item(&self.queue, &self.ctx)
                .await;
        }
    }
}
