//! Worker pool driving reconciliation from the work queue.
//!
//! Each worker loops `get -> reconcile -> done` until the queue shuts down.
//! The outcome of every reconcile decides what happens to the item:
//!
//! - success: backoff history is forgotten
//! - retryable error: re-added with rate-limited backoff
//! - malformed input: forgotten and dropped until the Secret changes again

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::ObjectRef;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::deploy_key::{reconcile, report_malformed, Context};
use crate::queue::WorkQueue;
use crate::secret::key_name;
use crate::Result;

/// Queue of Secret identities shared by the observer and the workers
pub type SecretQueue = WorkQueue<ObjectRef<Secret>>;

/// Take one item off the queue and reconcile it.
///
/// Returns `false` once the queue is shutting down.
pub async fn process_next_work_item(queue: &SecretQueue, ctx: &Arc<Context>) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    match reconcile(key.clone(), Arc::clone(ctx)).await {
        Ok(outcome) => {
            debug!(secret = %key_name(&key), ?outcome, "reconciled");
            queue.forget(&key);
        }
        Err(e) if e.is_retryable() => {
            warn!(
                secret = %key_name(&key),
                error = %e,
                requeues = queue.num_requeues(&key),
                "reconcile failed, retrying with backoff"
            );
            queue.add_rate_limited(key.clone());
        }
        Err(e) => {
            error!(
                secret = %key_name(&key),
                error = %e,
                "secret cannot be synced until it changes, dropping"
            );
            report_malformed(&key, &e, ctx).await;
            queue.forget(&key);
        }
    }

    queue.done(&key);
    true
}

/// Process items until the queue shuts down.
pub async fn run_worker(queue: Arc<SecretQueue>, ctx: Arc<Context>, id: usize) {
    debug!(worker = id, "worker started");
    while process_next_work_item(&queue, &ctx).await {}
    debug!(worker = id, "worker stopped");
}

/// Run `workers` workers against `queue`.
///
/// No worker starts before `cache_ready` resolves. Once `shutdown` is
/// cancelled the queue is shut down; workers finish their current item and
/// this returns when all of them have exited.
pub async fn run_workers<F>(
    queue: Arc<SecretQueue>,
    ctx: Arc<Context>,
    workers: usize,
    cache_ready: F,
    shutdown: CancellationToken,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    info!("waiting for secret cache to sync");
    tokio::select! {
        ready = cache_ready => ready?,
        _ = shutdown.cancelled() => {
            info!("shutdown requested before cache synced");
            queue.shut_down();
            return Ok(());
        }
    }

    info!(workers, "starting workers");
    let handles: Vec<_> = (0..workers)
        .map(|id| tokio::spawn(run_worker(Arc::clone(&queue), Arc::clone(&ctx), id)))
        .collect();

    let closer = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move {
            shutdown.cancelled().await;
            info!("shutting down work queue");
            queue.shut_down();
        }
    });

    for result in join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "worker task failed");
        }
    }
    closer.abort();
    info!("all workers stopped");
    Ok(())
}
