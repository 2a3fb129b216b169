//! Event router: maps cache notifications to reconcile keys
//!
//! A controller registers one [`Handlers`] per controller kind and feeds it
//! the notifications of every kind it watches. The enqueue strategy decides
//! which controller objects a change affects:
//!
//! - [`Handlers::enqueue`]: the changed object is the controller object itself
//! - [`Handlers::enqueue_owner`]: the changed object is a child; reconcile its controller
//! - [`Handlers::enqueue_all`] / [`Handlers::enqueue_all_with_filter`]: a shared
//!   dependency changed; reconcile every (matching) controller in the namespace

use std::fmt;
use std::sync::Arc;

use kube::core::Selector;
use kube::{Resource, ResourceExt};
use tracing::{debug, trace};

use crate::lister::ObjectLister;
use crate::object::{controller_ref_of, ControllerIdentity, ObjectKey};
use crate::queue::WorkQueue;

/// Kind of change that triggered an enqueue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerOperation {
    /// Object appeared
    Add,
    /// Object changed
    Update,
    /// Object disappeared
    Delete,
}

impl fmt::Display for HandlerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Payload of a delete notification
#[derive(Clone, Debug, PartialEq)]
pub enum DeletedObject<K> {
    /// The deletion was observed directly
    Object(K),
    /// The object vanished while the watch was disconnected; only its last
    /// cached state is known
    Tombstone {
        /// Key of the vanished object
        key: ObjectKey,
        /// Last state seen in the cache
        last_known: K,
    },
}

impl<K> DeletedObject<K> {
    /// The best known state of the deleted object
    pub fn into_object(self) -> K {
        match self {
            DeletedObject::Object(obj) => obj,
            DeletedObject::Tombstone { last_known, .. } => last_known,
        }
    }
}

/// Typed change notification from the cache
#[derive(Clone, Debug, PartialEq)]
pub enum Notification<K> {
    /// Object appeared
    Added(K),
    /// Object changed
    Updated {
        /// Previously cached state
        old: K,
        /// New state
        new: K,
    },
    /// Object disappeared
    Deleted(DeletedObject<K>),
}

/// Routes notifications into the work queue of controller kind `C`
pub struct Handlers<C> {
    queue: WorkQueue<ObjectKey>,
    identity: ControllerIdentity,
    controllers: Arc<dyn ObjectLister<C>>,
}

impl<C> Clone for Handlers<C> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            identity: self.identity.clone(),
            controllers: Arc::clone(&self.controllers),
        }
    }
}

impl<C> Handlers<C>
where
    C: Resource + Clone + Send + Sync + 'static,
{
    /// Create handlers for the controller kind described by `identity`
    pub fn new(
        queue: WorkQueue<ObjectKey>,
        identity: ControllerIdentity,
        controllers: Arc<dyn ObjectLister<C>>,
    ) -> Self {
        Self {
            queue,
            identity,
            controllers,
        }
    }

    /// The queue keys are added to
    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Dispatch one notification
    pub fn handle<K>(&self, notification: Notification<K>, enqueue: &dyn Fn(&K, HandlerOperation))
    where
        K: Resource<DynamicType = ()> + Clone,
    {
        match notification {
            Notification::Added(obj) => self.handle_add(&obj, enqueue),
            Notification::Updated { old, new } => {
                let delete = |deleted: DeletedObject<K>| self.handle_delete(deleted, enqueue);
                self.handle_update(&old, &new, enqueue, &delete)
            }
            Notification::Deleted(deleted) => self.handle_delete(deleted, enqueue),
        }
    }

    /// Object was added
    pub fn handle_add<K>(&self, obj: &K, enqueue: &dyn Fn(&K, HandlerOperation))
    where
        K: Resource<DynamicType = ()>,
    {
        trace!(kind = %K::kind(&()), key = %ObjectKey::from_object(obj), "Observed addition");
        enqueue(obj, HandlerOperation::Add);
    }

    /// Object was updated
    ///
    /// A changed UID means the object was deleted and recreated under the same
    /// name between two observations. That is reported as a delete of the old
    /// instance followed by an add of the new one.
    pub fn handle_update<K>(
        &self,
        old: &K,
        cur: &K,
        enqueue: &dyn Fn(&K, HandlerOperation),
        delete: &dyn Fn(DeletedObject<K>),
    ) where
        K: Resource<DynamicType = ()> + Clone,
    {
        let key = ObjectKey::from_object(cur);
        if old.uid() != cur.uid() {
            debug!(
                kind = %K::kind(&()),
                %key,
                old_uid = ?old.uid(),
                new_uid = ?cur.uid(),
                "Object was recreated, handling as delete and add"
            );
            delete(DeletedObject::Tombstone {
                key: ObjectKey::from_object(old),
                last_known: old.clone(),
            });
            enqueue(cur, HandlerOperation::Add);
            return;
        }

        trace!(kind = %K::kind(&()), %key, "Observed update");
        enqueue(cur, HandlerOperation::Update);
    }

    /// Object was deleted
    pub fn handle_delete<K>(&self, deleted: DeletedObject<K>, enqueue: &dyn Fn(&K, HandlerOperation))
    where
        K: Resource<DynamicType = ()>,
    {
        if let DeletedObject::Tombstone { key, .. } = &deleted {
            debug!(kind = %K::kind(&()), %key, "Observed deletion of an already evicted object");
        }
        let obj = deleted.into_object();
        trace!(kind = %K::kind(&()), key = %ObjectKey::from_object(&obj), "Observed deletion");
        enqueue(&obj, HandlerOperation::Delete);
    }

    /// Enqueue the object's own key
    pub fn enqueue<K: Resource>(&self, obj: &K, op: HandlerOperation) {
        let key = ObjectKey::from_object(obj);
        trace!(%key, %op, "Enqueuing");
        self.queue.add(key);
    }

    /// Enqueue the controller that owns `obj`, if it is one of ours
    ///
    /// The owner is looked up in the cache and must have the UID recorded in
    /// the reference; a reference to a deleted and recreated controller of the
    /// same name is ignored.
    pub fn enqueue_owner<K: Resource>(&self, obj: &K, op: HandlerOperation) {
        let Some(owner) = controller_ref_of(obj) else {
            trace!(key = %ObjectKey::from_object(obj), "Object has no controller, not enqueuing");
            return;
        };
        if !self.identity.matches(owner) {
            trace!(
                key = %ObjectKey::from_object(obj),
                owner_kind = %owner.kind,
                "Object is controlled by another kind, not enqueuing"
            );
            return;
        }

        let owner_key = ObjectKey {
            namespace: obj.meta().namespace.clone(),
            name: owner.name.clone(),
        };
        let Some(controller) = self.controllers.get(&owner_key) else {
            trace!(key = %owner_key, "Owner not found in cache, not enqueuing");
            return;
        };
        if controller.uid().as_deref() != Some(owner.uid.as_str()) {
            trace!(key = %owner_key, "Owner UID differs from reference, not enqueuing");
            return;
        }

        trace!(key = %owner_key, child = %ObjectKey::from_object(obj), %op, "Enqueuing owner");
        self.queue.add(owner_key);
    }

    /// Enqueue every controller in the object's namespace
    pub fn enqueue_all<K: Resource>(&self, obj: &K, op: HandlerOperation) {
        self.enqueue_all_with_filter(obj, op, &|_| true);
    }

    /// Enqueue every controller in the object's namespace accepted by `filter`
    ///
    /// Cluster-scoped objects affect controllers in all namespaces.
    pub fn enqueue_all_with_filter<K: Resource>(
        &self,
        obj: &K,
        op: HandlerOperation,
        filter: &dyn Fn(&C) -> bool,
    ) {
        let namespace = obj.meta().namespace.as_deref();
        for controller in self.controllers.list(namespace, &Selector::default()) {
            if !filter(&controller) {
                continue;
            }
            let key = ObjectKey::from_object(&controller);
            trace!(%key, trigger = %ObjectKey::from_object(obj), %op, "Enqueuing");
            self.queue.add(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::ItemExponentialFailureRateLimiter;
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use kube::runtime::reflector;
    use kube::runtime::watcher;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn sts(name: &str, uid: &str) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn child(name: &str, uid: &str, owner: Option<(&str, &str, &str)>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                uid: Some(uid.to_string()),
                owner_references: owner.map(|(kind, owner_name, owner_uid)| {
                    vec![OwnerReference {
                        api_version: "apps/v1".to_string(),
                        kind: kind.to_string(),
                        name: owner_name.to_string(),
                        uid: owner_uid.to_string(),
                        controller: Some(true),
                        block_owner_deletion: Some(true),
                    }]
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn handlers(controllers: Vec<StatefulSet>) -> Handlers<StatefulSet> {
        let (reader, mut writer) = reflector::store();
        for obj in controllers {
            writer.apply_watcher_event(&watcher::Event::Apply(obj));
        }
        let lister: Arc<dyn ObjectLister<StatefulSet>> = Arc::new(reader);
        let queue = WorkQueue::new(
            "test",
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1)),
        );
        Handlers::new(queue, ControllerIdentity::of::<StatefulSet>(), lister)
    }

    async fn drain(queue: &WorkQueue<ObjectKey>) -> Vec<String> {
        let mut keys = Vec::new();
        while !queue.is_empty() {
            if let Some(key) = queue.get().await {
                queue.done(&key);
                keys.push(key.to_string());
            }
        }
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn direct_enqueue_uses_own_key() {
        let h = handlers(vec![]);
        h.handle(Notification::Added(sts("db", "u1")), &|o, op| h.enqueue(o, op));
        assert_eq!(drain(h.queue()).await, vec!["ns/db"]);
    }

    #[tokio::test]
    async fn enqueue_owner_resolves_matching_controller() {
        let h = handlers(vec![sts("db", "u1")]);
        let cm = child("cfg", "c1", Some(("StatefulSet", "db", "u1")));
        h.handle(Notification::Added(cm), &|o, op| h.enqueue_owner(o, op));
        assert_eq!(drain(h.queue()).await, vec!["ns/db"]);
    }

    #[tokio::test]
    async fn enqueue_owner_ignores_other_kinds_stale_uids_and_orphans() {
        let h = handlers(vec![sts("db", "u1")]);
        let enqueue = |o: &ConfigMap, op| h.enqueue_owner(o, op);

        h.handle_add(&child("a", "c1", Some(("Deployment", "db", "u1"))), &enqueue);
        h.handle_add(&child("b", "c2", Some(("StatefulSet", "db", "old-uid"))), &enqueue);
        h.handle_add(&child("c", "c3", Some(("StatefulSet", "missing", "u9"))), &enqueue);
        h.handle_add(&child("d", "c4", None), &enqueue);

        assert!(h.queue().is_empty());
    }

    #[tokio::test]
    async fn tombstones_are_unwrapped() {
        let h = handlers(vec![sts("db", "u1")]);
        let last_known = child("cfg", "c1", Some(("StatefulSet", "db", "u1")));
        h.handle(
            Notification::Deleted(DeletedObject::Tombstone {
                key: ObjectKey::namespaced("ns", "cfg"),
                last_known,
            }),
            &|o, op| {
                assert_eq!(op, HandlerOperation::Delete);
                h.enqueue_owner(o, op)
            },
        );
        assert_eq!(drain(h.queue()).await, vec!["ns/db"]);
    }

    #[tokio::test]
    async fn uid_change_is_split_into_delete_and_add() {
        let h = handlers(vec![]);
        let ops = Mutex::new(Vec::new());
        let deletes = Mutex::new(Vec::new());

        h.handle_update(
            &sts("db", "old"),
            &sts("db", "new"),
            &|o, op| ops.lock().push((o.uid().unwrap_or_default(), op)),
            &|deleted| deletes.lock().push(deleted),
        );

        let deletes = deletes.into_inner();
        assert_eq!(deletes.len(), 1);
        assert!(matches!(
            &deletes[0],
            DeletedObject::Tombstone { last_known, .. } if last_known.uid().as_deref() == Some("old")
        ));
        assert_eq!(ops.into_inner(), vec![("new".to_string(), HandlerOperation::Add)]);
    }

    #[tokio::test]
    async fn plain_update_is_an_update() {
        let h = handlers(vec![]);
        let ops = Mutex::new(Vec::new());
        h.handle_update(
            &sts("db", "same"),
            &sts("db", "same"),
            &|_, op| ops.lock().push(op),
            &|_| panic!("no delete expected"),
        );
        assert_eq!(ops.into_inner(), vec![HandlerOperation::Update]);
    }

    #[tokio::test]
    async fn enqueue_all_with_filter_broadcasts_within_namespace() {
        let mut other_ns = sts("elsewhere", "u3");
        other_ns.metadata.namespace = Some("other".to_string());
        let h = handlers(vec![sts("a", "u1"), sts("b", "u2"), other_ns]);

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("creds".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        h.enqueue_all(&secret, HandlerOperation::Update);
        assert_eq!(drain(h.queue()).await, vec!["ns/a", "ns/b"]);

        h.enqueue_all_with_filter(&secret, HandlerOperation::Update, &|c| c.name_any() == "b");
        assert_eq!(drain(h.queue()).await, vec!["ns/b"]);
    }
}
