//! Change observer: watch stream to queue.
//!
//! Every watch event is applied to the reflector cache and turned into one or
//! more [`ResourceEvent`]s. Only the identity of the Secret is queued; workers
//! always re-read the cache, so a payload that raced a later update or deletion
//! is never acted on.
//!
//! Deletions are the exception: the final object is stored in the
//! [`LastKnownState`] ledger before the identity is queued, because a deleted
//! Secret can no longer be read and its recorded deploy key id would be lost.
//!
//! A watch that restarts re-lists everything (`Init`, `InitApply`*, `InitDone`).
//! The cache only switches to the new listing at `InitDone`, so changes seen
//! during a re-list are held back until then; queueing them earlier would let
//! a worker read the old listing. Objects that were cached before the re-list
//! but are absent from it were deleted while the watch was down; they surface
//! as tombstones carrying the last object the cache held.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::queue::WorkQueue;
use crate::secret::{key_name, qualified_name};
use crate::store::LastKnownState;

/// A normalized change to a watched Secret.
#[derive(Clone, Debug)]
pub enum ResourceEvent {
    /// Secret seen for the first time
    Added(Arc<Secret>),
    /// Known Secret changed
    Updated(Arc<Secret>),
    /// Secret removed
    Deleted(Deletion),
}

/// What is known about a deleted Secret.
#[derive(Clone, Debug)]
pub enum Deletion {
    /// Delete event carrying the final object
    Final(Arc<Secret>),
    /// Deletion inferred from a re-list, with whatever the cache last held
    Tombstone {
        /// Identity of the deleted Secret
        key: ObjectRef<Secret>,
        /// Last cached state, if any
        last_known: Option<Arc<Secret>>,
    },
}

impl ResourceEvent {
    /// Identity of the Secret this event is about
    pub fn key(&self) -> ObjectRef<Secret> {
        match self {
            ResourceEvent::Added(s) | ResourceEvent::Updated(s) => ObjectRef::from_obj(s.as_ref()),
            ResourceEvent::Deleted(Deletion::Final(s)) => ObjectRef::from_obj(s.as_ref()),
            ResourceEvent::Deleted(Deletion::Tombstone { key, .. }) => key.clone(),
        }
    }
}

/// Feeds the read cache and the work queue from a Secret watch.
pub struct ChangeObserver {
    writer: Writer<Secret>,
    cache: Store<Secret>,
    queue: Arc<WorkQueue<ObjectRef<Secret>>>,
    last_known: LastKnownState,
    /// In-progress re-list, if any
    relisting: Option<Relist>,
}

/// Objects listed since `Init`, released once the cache holds them.
#[derive(Default)]
struct Relist {
    seen: HashSet<ObjectRef<Secret>>,
    held: Vec<ResourceEvent>,
}

impl ChangeObserver {
    /// Create an observer owning the cache `writer`.
    pub fn new(
        writer: Writer<Secret>,
        queue: Arc<WorkQueue<ObjectRef<Secret>>>,
        last_known: LastKnownState,
    ) -> Self {
        let cache = writer.as_reader();
        Self {
            writer,
            cache,
            queue,
            last_known,
            relisting: None,
        }
    }

    /// Apply one watch event to the cache and queue the affected identities.
    pub fn observe(&mut self, event: watcher::Event<Secret>) {
        if let Some(nameless) = nameless_object(&event) {
            warn!(
                namespace = ?nameless.metadata.namespace,
                "discarding watch event for object without a name"
            );
            return;
        }

        // Classification needs the cache as it was before this event
        let changes = self.classify(&event);
        self.writer.apply_watcher_event(&event);
        for change in changes {
            self.dispatch(change);
        }
    }

    /// Queue a normalized event, capturing the final state of deletions.
    pub fn dispatch(&self, event: ResourceEvent) {
        let key = event.key();
        match &event {
            ResourceEvent::Added(secret) => {
                debug!(secret = %qualified_name(secret), "secret added");
            }
            ResourceEvent::Updated(secret) => {
                trace!(secret = %qualified_name(secret), "secret updated");
            }
            ResourceEvent::Deleted(Deletion::Final(secret)) => {
                info!(secret = %qualified_name(secret), "secret deleted");
                self.last_known.record(key.clone(), Arc::clone(secret));
            }
            ResourceEvent::Deleted(Deletion::Tombstone { key, last_known }) => match last_known {
                Some(secret) => {
                    info!(secret = %key_name(key), "secret deleted while watch was down");
                    self.last_known.record(key.clone(), Arc::clone(secret));
                }
                None => {
                    warn!(secret = %key_name(key), "tombstone without last known state");
                }
            },
        }
        self.queue.add(key);
    }

    fn classify(&mut self, event: &watcher::Event<Secret>) -> Vec<ResourceEvent> {
        match event {
            watcher::Event::Apply(secret) => vec![self.added_or_updated(secret)],
            watcher::Event::Delete(secret) => {
                vec![ResourceEvent::Deleted(Deletion::Final(Arc::new(secret.clone())))]
            }
            watcher::Event::Init => {
                self.relisting = Some(Relist::default());
                Vec::new()
            }
            watcher::Event::InitApply(secret) => {
                let change = self.added_or_updated(secret);
                match self.relisting.as_mut() {
                    Some(relist) => {
                        relist.seen.insert(change.key());
                        relist.held.push(change);
                        Vec::new()
                    }
                    None => vec![change],
                }
            }
            watcher::Event::InitDone => {
                let Relist { seen, mut held } = self.relisting.take().unwrap_or_default();
                // Dispatched after the writer swaps in the new listing
                held.extend(self.cache.state().into_iter().filter_map(|secret| {
                    let key = ObjectRef::from_obj(secret.as_ref());
                    (!seen.contains(&key)).then(|| {
                        ResourceEvent::Deleted(Deletion::Tombstone {
                            key,
                            last_known: Some(secret),
                        })
                    })
                }));
                held
            }
        }
    }

    fn added_or_updated(&self, secret: &Secret) -> ResourceEvent {
        let secret = Arc::new(secret.clone());
        if self.cache.get(&ObjectRef::from_obj(secret.as_ref())).is_some() {
            ResourceEvent::Updated(secret)
        } else {
            ResourceEvent::Added(secret)
        }
    }

    /// Drive the observer from a watch stream until it ends or `cancel` fires.
    ///
    /// Watch errors are logged; the stream is expected to back off and
    /// reconnect on its own.
    pub async fn run<S>(mut self, stream: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<Secret>, watcher::Error>> + Send,
    {
        let mut stream = std::pin::pin!(stream);
        info!("change observer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("change observer cancelled");
                    break;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => self.observe(event),
                    Some(Err(e)) => warn!(error = %e, "watch error, will retry"),
                    None => {
                        warn!("watch stream ended");
                        break;
                    }
                }
            }
        }
    }
}

fn nameless_object(event: &watcher::Event<Secret>) -> Option<&Secret> {
    match event {
        watcher::Event::Apply(s) | watcher::Event::Delete(s) | watcher::Event::InitApply(s)
            if s.metadata.name.as_deref().map_or(true, str::is_empty) =>
        {
            Some(s)
        }
        _ => None,
    }
}
