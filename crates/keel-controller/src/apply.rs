//! Idempotent create-or-update of desired child objects
//!
//! The desired object is stamped with a digest of its managed fields. An
//! existing object whose stored digest matches is left untouched, so a
//! converged sync issues no writes at all. Ownership is never reassigned: an
//! existing object controlled by someone else is an error.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use keel_common::events::{actions, reasons, EventPublisher};
use keel_common::Error;

use crate::digest::{set_digest, stored_digest, DigestConfig};
use crate::object::{controller_ref_of, ObjectKey};

/// Remote operations needed to apply objects of kind `T`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplyControl<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// The object as currently held in the local cache
    fn get_cached(&self, key: &ObjectKey) -> Option<T>;

    /// Create `obj`
    async fn create(&self, obj: &T) -> keel_common::Result<T>;

    /// Replace `obj`; the write is conditional on its resourceVersion
    async fn update(&self, obj: &T) -> keel_common::Result<T>;
}

/// Per-call apply options
#[derive(Clone, Copy, Debug, Default)]
pub struct ApplyOptions {
    /// Accept desired objects without a controller reference
    pub allow_missing_controller_ref: bool,
}

/// Result of one apply
#[derive(Clone, Debug)]
pub struct ApplyOutcome<T> {
    /// The object as returned by the API server (or the cached copy if unchanged)
    pub object: T,
    /// Whether a write was issued
    pub changed: bool,
}

/// Apply engine for one kind
pub struct Applier<T> {
    control: Arc<dyn ApplyControl<T>>,
    events: Arc<dyn EventPublisher>,
    digest: DigestConfig,
}

impl<T> Clone for Applier<T> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
            events: Arc::clone(&self.events),
            digest: self.digest.clone(),
        }
    }
}

impl<T> Applier<T>
where
    T: Resource<DynamicType = ()> + Clone + Debug + Serialize + Send + Sync + 'static,
{
    /// Create an applier; `digest` selects the fields that take part in change detection
    pub fn new(
        control: Arc<dyn ApplyControl<T>>,
        events: Arc<dyn EventPublisher>,
        digest: DigestConfig,
    ) -> Self {
        Self {
            control,
            events,
            digest,
        }
    }

    /// Make the live object match `desired`
    pub async fn apply(
        &self,
        desired: T,
        options: ApplyOptions,
    ) -> keel_common::Result<ApplyOutcome<T>> {
        let kind = T::kind(&());
        let key = ObjectKey::from_object(&desired);

        let desired_owner = controller_ref_of(&desired).map(|r| r.uid.clone());
        if desired_owner.is_none() && !options.allow_missing_controller_ref {
            return Err(Error::missing_controller_ref(kind.as_ref(), key.to_string()));
        }

        let digest = self.digest.compute(&desired)?;
        let mut required = desired;
        set_digest(&mut required, digest.clone());

        let Some(existing) = self.control.get_cached(&key) else {
            return self.create(required, &key).await;
        };

        let existing_owner = controller_ref_of(&existing).map(|r| r.uid.clone());
        if existing_owner != desired_owner {
            let err = Error::ownership_mismatch(
                kind.as_ref(),
                key.to_string(),
                match &existing_owner {
                    Some(uid) => format!("controlled by uid {uid}"),
                    None => "it has no controller reference".to_string(),
                },
            );
            self.publish_warning(&existing, reasons::OWNERSHIP_MISMATCH, &err).await;
            return Err(err);
        }

        if stored_digest(&existing) == Some(digest.as_str()) {
            debug!(%kind, object = %key, "Object is up to date");
            return Ok(ApplyOutcome {
                object: existing,
                changed: false,
            });
        }

        if required.meta().resource_version.is_none() {
            required.meta_mut().resource_version = existing.resource_version();
        }

        match self.control.update(&required).await {
            Ok(updated) => {
                info!(%kind, object = %key, "Updated object");
                self.publish_ok(&updated, reasons::UPDATED, "updated").await;
                Ok(ApplyOutcome {
                    object: updated,
                    changed: true,
                })
            }
            Err(e) if e.is_conflict() => {
                debug!(%kind, object = %key, "Hit update conflict, will retry");
                Err(e)
            }
            Err(e) => {
                let reason = reasons::for_kind(&kind, reasons::UPDATE_FAILED);
                self.publish_warning(&required, &reason, &e).await;
                Err(e)
            }
        }
    }

    async fn create(&self, required: T, key: &ObjectKey) -> keel_common::Result<ApplyOutcome<T>> {
        let kind = T::kind(&());
        match self.control.create(&required).await {
            Ok(created) => {
                info!(%kind, object = %key, "Created object");
                self.publish_ok(&created, reasons::CREATED, "created").await;
                Ok(ApplyOutcome {
                    object: created,
                    changed: true,
                })
            }
            Err(e) if e.is_already_exists() => {
                // The cache lagged behind a create; the next pass sees the object
                debug!(%kind, object = %key, "Object already exists, cache is stale");
                Ok(ApplyOutcome {
                    object: required,
                    changed: true,
                })
            }
            Err(e) => {
                let reason = reasons::for_kind(&kind, reasons::CREATE_FAILED);
                self.publish_warning(&required, &reason, &e).await;
                Err(e)
            }
        }
    }

    async fn publish_ok(&self, obj: &T, reason: &str, verb: &str) {
        let kind = T::kind(&());
        self.events
            .publish(
                &obj.object_ref(&()),
                EventType::Normal,
                &reasons::for_kind(&kind, reason),
                actions::APPLY,
                Some(format!("{kind} {} {verb}", ObjectKey::from_object(obj))),
            )
            .await;
    }

    async fn publish_warning(&self, obj: &T, reason: &str, err: &Error) {
        self.events
            .publish(
                &obj.object_ref(&()),
                EventType::Warning,
                reason,
                actions::APPLY,
                Some(err.to_string()),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::RecordingEventPublisher;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
            name: "db".to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn desired(value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cfg".to_string()),
                namespace: Some("ns".to_string()),
                owner_references: Some(vec![owner("ctrl-uid")]),
                ..Default::default()
            },
            data: Some([("k".to_string(), value.to_string())].into()),
            ..Default::default()
        }
    }

    fn live(value: &str) -> ConfigMap {
        let mut obj = desired(value);
        let digest = DigestConfig::default().compute(&obj).unwrap();
        set_digest(&mut obj, digest);
        obj.metadata.uid = Some("cfg-uid".to_string());
        obj.metadata.resource_version = Some("11".to_string());
        obj
    }

    fn applier(mock: MockApplyControl<ConfigMap>) -> (Applier<ConfigMap>, Arc<RecordingEventPublisher>) {
        let events = Arc::new(RecordingEventPublisher::default());
        let applier = Applier::new(
            Arc::new(mock),
            events.clone() as Arc<dyn EventPublisher>,
            DigestConfig::default(),
        );
        (applier, events)
    }

    // ==========================================================================
    // Story Tests: Applying desired objects
    // ==========================================================================

    /// Story: A missing object is created with its digest
    #[tokio::test]
    async fn story_missing_object_is_created() {
        let mut mock = MockApplyControl::<ConfigMap>::new();
        mock.expect_get_cached().returning(|_| None);
        mock.expect_create().times(1).returning(|obj| {
            assert!(stored_digest(obj).is_some());
            Ok(obj.clone())
        });
        mock.expect_update().never();
        let (applier, events) = applier(mock);

        let out = applier
            .apply(desired("a"), ApplyOptions::default())
            .await
            .unwrap();
        assert!(out.changed);
        assert_eq!(events.reasons(), vec!["ConfigMapCreated"]);
    }

    /// Story: A converged object is not written again
    #[tokio::test]
    async fn story_converged_object_is_left_alone() {
        let mut mock = MockApplyControl::<ConfigMap>::new();
        mock.expect_get_cached().returning(|_| Some(live("a")));
        mock.expect_create().never();
        mock.expect_update().never();
        let (applier, events) = applier(mock);

        let out = applier
            .apply(desired("a"), ApplyOptions::default())
            .await
            .unwrap();
        assert!(!out.changed);
        assert_eq!(out.object.metadata.uid.as_deref(), Some("cfg-uid"));
        assert!(events.reasons().is_empty());
    }

    /// Story: A changed object is updated at the live resourceVersion
    #[tokio::test]
    async fn story_changed_object_is_updated() {
        let mut mock = MockApplyControl::<ConfigMap>::new();
        mock.expect_get_cached().returning(|_| Some(live("a")));
        mock.expect_update().times(1).returning(|obj| {
            assert_eq!(obj.metadata.resource_version.as_deref(), Some("11"));
            assert_eq!(obj.data.as_ref().unwrap()["k"], "b");
            Ok(obj.clone())
        });
        let (applier, events) = applier(mock);

        let out = applier
            .apply(desired("b"), ApplyOptions::default())
            .await
            .unwrap();
        assert!(out.changed);
        assert_eq!(events.reasons(), vec!["ConfigMapUpdated"]);
    }

    /// Story: Objects controlled by someone else are never taken over
    #[tokio::test]
    async fn story_foreign_objects_are_not_reassigned() {
        let mut mock = MockApplyControl::<ConfigMap>::new();
        mock.expect_get_cached().returning(|_| {
            let mut obj = live("a");
            obj.metadata.owner_references = Some(vec![owner("other-uid")]);
            Some(obj)
        });
        mock.expect_update().never();
        let (applier, events) = applier(mock);

        let err = applier
            .apply(desired("b"), ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OwnershipMismatch { .. }));
        assert_eq!(events.reasons(), vec!["OwnershipMismatch"]);
    }

    /// Story: A racing create is treated as a stale cache
    #[tokio::test]
    async fn story_racing_create_is_not_an_error() {
        let mut mock = MockApplyControl::<ConfigMap>::new();
        mock.expect_get_cached().returning(|_| None);
        mock.expect_create()
            .returning(|_| Err(Error::api_status(409, "AlreadyExists", "exists")));
        let (applier, _) = applier(mock);

        let out = applier
            .apply(desired("a"), ApplyOptions::default())
            .await
            .unwrap();
        assert!(out.changed);
    }

    /// Story: An update conflict is retried quietly, without a Warning event
    #[tokio::test]
    async fn story_update_conflict_is_not_surfaced_as_event() {
        let mut mock = MockApplyControl::<ConfigMap>::new();
        mock.expect_get_cached().returning(|_| Some(live("a")));
        mock.expect_update()
            .returning(|_| Err(Error::api_status(409, "Conflict", "modified")));
        let (applier, events) = applier(mock);

        let err = applier
            .apply(desired("b"), ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn update_failures_other_than_conflicts_emit_warning_events() {
        let mut mock = MockApplyControl::<ConfigMap>::new();
        mock.expect_get_cached().returning(|_| Some(live("a")));
        mock.expect_update()
            .returning(|_| Err(Error::api_status(422, "Invalid", "bad field")));
        let (applier, events) = applier(mock);

        assert!(applier
            .apply(desired("b"), ApplyOptions::default())
            .await
            .is_err());
        assert_eq!(events.reasons(), vec!["ConfigMapUpdateFailed"]);
    }

    #[tokio::test]
    async fn missing_controller_ref_is_rejected_unless_allowed() {
        let mut unowned = desired("a");
        unowned.metadata.owner_references = None;

        let mut mock = MockApplyControl::<ConfigMap>::new();
        mock.expect_get_cached().returning(|_| None);
        mock.expect_create().times(1).returning(|obj| Ok(obj.clone()));
        let (applier, _) = applier(mock);

        let err = applier
            .apply(unowned.clone(), ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingControllerRef { .. }));

        let out = applier
            .apply(
                unowned,
                ApplyOptions {
                    allow_missing_controller_ref: true,
                },
            )
            .await
            .unwrap();
        assert!(out.changed);
    }

    #[tokio::test]
    async fn create_failures_emit_warning_events() {
        let mut mock = MockApplyControl::<ConfigMap>::new();
        mock.expect_get_cached().returning(|_| None);
        mock.expect_create()
            .returning(|_| Err(Error::api_status(403, "Forbidden", "denied")));
        let (applier, events) = applier(mock);

        assert!(applier
            .apply(desired("a"), ApplyOptions::default())
            .await
            .is_err());
        assert_eq!(events.reasons(), vec!["ConfigMapCreateFailed"]);
    }
}
