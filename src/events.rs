//! Kubernetes Events on watched Secrets.
//!
//! Operators follow a Secret's deploy key through `kubectl describe secret`:
//! a `Synced` event when the key is minted, `DeployKeyRevoked` when it is
//! removed, and a `Warning` when the Secret cannot be synced as written.
//! Publishing never fails a reconcile; a rejected event is only logged.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crate::secret::qualified_name;

/// Event reasons, as shown in the REASON column of `kubectl get events`.
pub mod reasons {
    /// Deploy key created and its id recorded on the Secret
    pub const SYNCED: &str = "Synced";
    /// Deploy key of a deleted or replaced Secret revoked
    pub const REVOKED: &str = "DeployKeyRevoked";
    /// Secret content can never be synced as-is
    pub const INVALID_SECRET: &str = "InvalidSecret";
}

/// Event actions.
pub mod actions {
    /// Creating a deploy key and recording it
    pub const SYNC: &str = "Sync";
    /// Revoking a deploy key
    pub const REVOKE: &str = "Revoke";
}

/// Note attached to the success event.
pub const SYNCED_NOTE: &str = "Secret synced successfully";

/// Something that happened to a Secret's deploy key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretEvent {
    /// A deploy key was created and recorded on the Secret
    Synced,
    /// The Secret's deploy key was removed from its project
    Revoked {
        /// Registry id of the removed key
        deploy_key_id: u64,
        /// Project the key was removed from
        project: String,
    },
    /// The Secret cannot be synced until it is edited
    Invalid {
        /// Why the Secret was rejected
        message: String,
    },
}

impl SecretEvent {
    /// Normal or Warning
    pub fn type_(&self) -> EventType {
        match self {
            SecretEvent::Synced | SecretEvent::Revoked { .. } => EventType::Normal,
            SecretEvent::Invalid { .. } => EventType::Warning,
        }
    }

    /// Machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            SecretEvent::Synced => reasons::SYNCED,
            SecretEvent::Revoked { .. } => reasons::REVOKED,
            SecretEvent::Invalid { .. } => reasons::INVALID_SECRET,
        }
    }

    /// What the controller was doing
    pub fn action(&self) -> &'static str {
        match self {
            SecretEvent::Synced | SecretEvent::Invalid { .. } => actions::SYNC,
            SecretEvent::Revoked { .. } => actions::REVOKE,
        }
    }

    /// Human-readable note
    pub fn note(&self) -> String {
        match self {
            SecretEvent::Synced => SYNCED_NOTE.to_string(),
            SecretEvent::Revoked {
                deploy_key_id,
                project,
            } => format!("Deploy key {deploy_key_id} removed from {project}"),
            SecretEvent::Invalid { message } => message.clone(),
        }
    }
}

/// Records [`SecretEvent`]s against the Secret they concern.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` on `secret`; failures are swallowed
    async fn publish(&self, secret: &Secret, event: SecretEvent);
}

/// [`EventPublisher`] writing to the Kubernetes events API.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, tagged with the pod name when `POD_NAME` is set.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, secret: &Secret, event: SecretEvent) {
        let record = Event {
            type_: event.type_(),
            reason: event.reason().to_string(),
            note: Some(event.note()),
            action: event.action().to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&record, &secret.object_ref(&())).await {
            warn!(
                secret = %qualified_name(secret),
                reason = event.reason(),
                error = %e,
                "failed to record event"
            );
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _secret: &Secret, _event: SecretEvent) {}
}
