//! Deletion of owned objects that are no longer desired

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{DeleteParams, Preconditions, PropagationPolicy};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use keel_common::events::{actions, reasons, EventPublisher};
use keel_common::Error;

use crate::object::{is_being_deleted, ObjectKey};

/// Remote delete for one kind
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PruneControl: Send + Sync {
    /// Delete the object `key` with `params`
    async fn delete(&self, key: &ObjectKey, params: &DeleteParams) -> keel_common::Result<()>;
}

/// Delete parameters pinned to one object incarnation
///
/// The UID precondition makes the delete fail if the object was replaced in
/// the meantime; dependents are collected in the background.
pub fn delete_params_for_uid(uid: Option<String>) -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        preconditions: Some(Preconditions {
            uid,
            resource_version: None,
        }),
        ..Default::default()
    }
}

/// Prune engine for kind `T`
pub struct Pruner<T> {
    control: Arc<dyn PruneControl>,
    events: Arc<dyn EventPublisher>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Clone for Pruner<T> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
            events: Arc::clone(&self.events),
            _kind: PhantomData,
        }
    }
}

impl<T> Pruner<T>
where
    T: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    /// Create a pruner
    pub fn new(control: Arc<dyn PruneControl>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            control,
            events,
            _kind: PhantomData,
        }
    }

    /// Delete every owned object whose key is not among `desired`
    ///
    /// Objects already being deleted are skipped and NotFound counts as
    /// pruned. Other failures, including UID precondition conflicts, are
    /// collected and returned together.
    pub async fn prune<'a, I>(&self, desired: &[T], owned: I) -> keel_common::Result<()>
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        let kind = T::kind(&());
        let wanted: HashSet<ObjectKey> = desired.iter().map(ObjectKey::from_object).collect();
        let mut errors = Vec::new();

        for obj in owned {
            if is_being_deleted(obj) {
                continue;
            }
            let key = ObjectKey::from_object(obj);
            if wanted.contains(&key) {
                continue;
            }

            let params = delete_params_for_uid(obj.uid());
            match self.control.delete(&key, &params).await {
                Ok(()) => {
                    info!(%kind, object = %key, "Pruned object");
                    self.events
                        .publish(
                            &obj.object_ref(&()),
                            EventType::Normal,
                            &reasons::for_kind(&kind, reasons::DELETED),
                            actions::PRUNE,
                            Some(format!("{kind} {key} deleted")),
                        )
                        .await;
                }
                Err(e) if e.is_not_found() => {
                    debug!(%kind, object = %key, "Object already gone");
                }
                Err(e) => {
                    self.events
                        .publish(
                            &obj.object_ref(&()),
                            EventType::Warning,
                            &reasons::for_kind(&kind, reasons::DELETE_FAILED),
                            actions::PRUNE,
                            Some(e.to_string()),
                        )
                        .await;
                    errors.push(e);
                }
            }
        }

        Error::aggregate(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::RecordingEventPublisher;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn cm(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                uid: Some(format!("{name}-uid")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pruner(mock: MockPruneControl) -> (Pruner<ConfigMap>, Arc<RecordingEventPublisher>) {
        let events = Arc::new(RecordingEventPublisher::default());
        (
            Pruner::new(Arc::new(mock), events.clone() as Arc<dyn EventPublisher>),
            events,
        )
    }

    // ==========================================================================
    // Story Tests: Removing what is no longer desired
    // ==========================================================================

    /// Story: Only undesired objects are deleted, pinned to their UID
    #[tokio::test]
    async fn story_undesired_objects_are_deleted_with_uid_precondition() {
        let mut mock = MockPruneControl::new();
        mock.expect_delete().times(1).returning(|key, params| {
            assert_eq!(key, &ObjectKey::namespaced("ns", "stale"));
            assert_eq!(
                params.preconditions.as_ref().and_then(|p| p.uid.as_deref()),
                Some("stale-uid")
            );
            assert!(matches!(
                params.propagation_policy,
                Some(PropagationPolicy::Background)
            ));
            Ok(())
        });
        let (pruner, events) = pruner(mock);

        let owned = [cm("keep"), cm("stale")];
        pruner.prune(&[cm("keep")], owned.iter()).await.unwrap();
        assert_eq!(events.reasons(), vec!["ConfigMapDeleted"]);
    }

    /// Story: Objects already being deleted are left to finish
    #[tokio::test]
    async fn story_objects_being_deleted_are_skipped() {
        let mut mock = MockPruneControl::new();
        mock.expect_delete().never();
        let (pruner, _) = pruner(mock);

        let mut deleting = cm("stale");
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        pruner.prune(&[], [deleting].iter()).await.unwrap();
    }

    /// Story: A replaced object fails the precondition and is reported
    #[tokio::test]
    async fn story_precondition_conflicts_are_reported() {
        let mut mock = MockPruneControl::new();
        mock.expect_delete().times(2).returning(|key, _| match key.name.as_str() {
            "replaced" => Err(Error::api_status(
                409,
                "Conflict",
                "Precondition failed: UID in precondition does not match",
            )),
            _ => Err(Error::api_status(404, "NotFound", "gone")),
        });
        let (pruner, events) = pruner(mock);

        let err = pruner
            .prune(&[], [cm("replaced"), cm("gone")].iter())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(events.reasons(), vec!["ConfigMapDeleteFailed"]);
    }

    #[tokio::test]
    async fn failures_are_aggregated_after_all_deletes() {
        let mut mock = MockPruneControl::new();
        mock.expect_delete()
            .times(3)
            .returning(|key, _| Err(Error::internal(format!("can't delete {key}"))));
        let (pruner, _) = pruner(mock);

        let err = pruner
            .prune(&[], [cm("a"), cm("b"), cm("c")].iter())
            .await
            .unwrap_err();
        match err {
            Error::Aggregate(errs) => assert_eq!(errs.len(), 3),
            other => panic!("Expected Aggregate, got {other:?}"),
        }
    }

    #[test]
    fn delete_params_pin_uid_and_propagate_in_background() {
        let params = delete_params_for_uid(Some("u".to_string()));
        assert_eq!(params.preconditions.and_then(|p| p.uid).as_deref(), Some("u"));
        assert!(matches!(
            params.propagation_policy,
            Some(PropagationPolicy::Background)
        ));
    }
}
