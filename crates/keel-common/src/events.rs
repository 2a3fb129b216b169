//! Kubernetes Events emitted by the apply and prune engines
//!
//! Every create, update and delete of a child object is reported as an Event
//! on the child, so `kubectl describe` shows what the operator did and why a
//! write failed. Publishing never fails a sync: errors are logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Upper bound the API server accepts for an Event note, in bytes
pub const MAX_NOTE_BYTES: usize = 1024;

/// Sink for Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`
    ///
    /// `reason` is machine-readable (e.g. "JobCreated"), `action` names the
    /// engine step (e.g. "Apply"), `note` is free text.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the kube-rs event `Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Publisher reporting as `controller_name` (the Event's reportingComponent)
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
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: note.map(truncate_note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                kind = resource_ref.kind.as_deref().unwrap_or_default(),
                name = resource_ref.name.as_deref().unwrap_or_default(),
                reason,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Cut `note` to [`MAX_NOTE_BYTES`] on a character boundary
pub fn truncate_note(mut note: String) -> String {
    if note.len() <= MAX_NOTE_BYTES {
        return note;
    }
    let mut end = MAX_NOTE_BYTES;
    while !note.is_char_boundary(end) {
        end -= 1;
    }
    note.truncate(end);
    note
}

/// Event reasons
///
/// Object lifecycle reasons are prefixed with the object kind when published
/// (e.g. "JobCreated"), see [`reasons::for_kind`].
pub mod reasons {
    /// Object was created
    pub const CREATED: &str = "Created";
    /// Creating an object failed
    pub const CREATE_FAILED: &str = "CreateFailed";
    /// Object was updated
    pub const UPDATED: &str = "Updated";
    /// Updating an object failed
    pub const UPDATE_FAILED: &str = "UpdateFailed";
    /// Object was deleted
    pub const DELETED: &str = "Deleted";
    /// Deleting an object failed
    pub const DELETE_FAILED: &str = "DeleteFailed";
    /// Existing object is controlled by someone else
    pub const OWNERSHIP_MISMATCH: &str = "OwnershipMismatch";

    /// Prefix a lifecycle reason with the object kind
    pub fn for_kind(kind: &str, reason: &str) -> String {
        format!("{kind}{reason}")
    }
}

/// Event actions, shown under ACTION in `kubectl get events`
pub mod actions {
    /// Create-or-update of a desired object
    pub const APPLY: &str = "Apply";
    /// Removal of an object no longer desired
    pub const PRUNE: &str = "Prune";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_reasons_are_prefixed_with_kind() {
        assert_eq!(reasons::for_kind("Job", reasons::CREATED), "JobCreated");
        assert_eq!(
            reasons::for_kind("ConfigMap", reasons::DELETE_FAILED),
            "ConfigMapDeleteFailed"
        );
    }

    #[test]
    fn short_notes_are_kept() {
        assert_eq!(truncate_note("job failed".to_string()), "job failed");
    }

    #[test]
    fn long_notes_are_cut_on_a_char_boundary() {
        let note = "é".repeat(MAX_NOTE_BYTES);
        let cut = truncate_note(note);
        assert!(cut.len() <= MAX_NOTE_BYTES);
        assert_eq!(cut.len() % 2, 0);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
