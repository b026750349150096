//! Controller for Flux git Secrets
//!
//! [`reconcile`] holds the per-Secret decision logic; the [`worker`] functions
//! drive it from the work queue.

mod deploy_key;
pub mod worker;

pub use deploy_key::{reconcile, Context, ContextBuilder, SyncOutcome};
pub use worker::{process_next_work_item, run_worker, run_workers, SecretQueue};
