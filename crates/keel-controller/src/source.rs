//! Adapter from kube-rs watch streams to typed [`Notification`]s
//!
//! The reflector store is the shared cache every controller reads from. This
//! module keeps it up to date and, for every change, produces the notification
//! the event router understands: the previous state for updates, and
//! tombstones for objects that disappeared while the watch was re-listing.

use std::collections::HashSet;
use std::fmt::Debug;

use futures::{Stream, StreamExt};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::handlers::{DeletedObject, Notification};
use crate::object::ObjectKey;

/// Watch timeout (seconds); must stay below the client read timeout so idle
/// watches are closed by the API server first
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Cache writer that reports what changed
pub struct NotificationSource<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer: Writer<K>,
    /// Objects seen since the current re-list started
    relisted: Option<HashSet<ObjectRef<K>>>,
    /// Notifications held back until the re-list is complete
    pending: Vec<Notification<K>>,
}

impl<K> NotificationSource<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    /// Wrap a reflector writer
    pub fn new(writer: Writer<K>) -> Self {
        Self {
            writer,
            relisted: None,
            pending: Vec::new(),
        }
    }

    /// Reader side of the cache
    pub fn store(&self) -> Store<K> {
        self.writer.as_reader()
    }

    /// Apply one watch event to the cache and return the resulting notifications
    ///
    /// Events belonging to a re-list are buffered and released together once
    /// the re-list completes, after the cache reflects it.
    pub fn apply(&mut self, event: watcher::Event<K>) -> Vec<Notification<K>> {
        let store = self.writer.as_reader();
        match event {
            watcher::Event::Apply(obj) => {
                let old = store.get(&ObjectRef::from_obj(&obj)).map(|o| (*o).clone());
                self.writer.apply_watcher_event(&watcher::Event::Apply(obj.clone()));
                vec![changed(old, obj)]
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(&watcher::Event::Delete(obj.clone()));
                vec![Notification::Deleted(DeletedObject::Object(obj))]
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                self.pending.clear();
                self.writer.apply_watcher_event(&watcher::Event::Init);
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let obj_ref = ObjectRef::from_obj(&obj);
                let old = store.get(&obj_ref).map(|o| (*o).clone());
                self.relisted.get_or_insert_with(HashSet::new).insert(obj_ref);
                self.writer.apply_watcher_event(&watcher::Event::InitApply(obj.clone()));
                self.pending.push(changed(old, obj));
                Vec::new()
            }
            watcher::Event::InitDone => {
                let relisted = self.relisted.take().unwrap_or_default();
                let mut out = std::mem::take(&mut self.pending);
                for obj in store.state() {
                    if relisted.contains(&ObjectRef::from_obj(obj.as_ref())) {
                        continue;
                    }
                    let key = ObjectKey::from_object(obj.as_ref());
                    debug!(%key, "Object disappeared during re-list");
                    out.push(Notification::Deleted(DeletedObject::Tombstone {
                        key,
                        last_known: (*obj).clone(),
                    }));
                }
                self.writer.apply_watcher_event(&watcher::Event::InitDone);
                out
            }
        }
    }
}

fn changed<K>(old: Option<K>, new: K) -> Notification<K> {
    match old {
        Some(old) => Notification::Updated { old, new },
        None => Notification::Added(new),
    }
}

/// Watch stream with the default backoff on errors
pub fn watch<K>(
    api: Api<K>,
    config: watcher::Config,
) -> impl Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher::watcher(api, config.timeout(WATCH_TIMEOUT_SECS)).default_backoff()
}

/// Drive `events` into the cache, handing every notification to `dispatch`
///
/// Returns when the stream ends.
pub async fn run_notifications<K, S, F>(mut source: NotificationSource<K>, events: S, dispatch: F)
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
    F: Fn(Notification<K>),
{
    let kind = K::kind(&());
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                for notification in source.apply(event) {
                    dispatch(notification);
                }
            }
            Err(e) => warn!(%kind, error = %e, "Watch failed, retrying with backoff"),
        }
    }
    debug!(%kind, "Watch stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::reflector;

    fn cm(name: &str, uid: &str, value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            data: Some([("v".to_string(), value.to_string())].into()),
            ..Default::default()
        }
    }

    fn source() -> NotificationSource<ConfigMap> {
        let (_reader, writer) = reflector::store();
        NotificationSource::new(writer)
    }

    #[test]
    fn apply_reports_add_then_update_with_previous_state() {
        let mut src = source();
        let first = src.apply(watcher::Event::Apply(cm("a", "u1", "1")));
        assert_eq!(first, vec![Notification::Added(cm("a", "u1", "1"))]);

        let second = src.apply(watcher::Event::Apply(cm("a", "u1", "2")));
        assert_eq!(
            second,
            vec![Notification::Updated {
                old: cm("a", "u1", "1"),
                new: cm("a", "u1", "2"),
            }]
        );
        assert_eq!(src.store().state().len(), 1);
    }

    #[test]
    fn delete_removes_from_cache() {
        let mut src = source();
        src.apply(watcher::Event::Apply(cm("a", "u1", "1")));
        let out = src.apply(watcher::Event::Delete(cm("a", "u1", "1")));
        assert_eq!(
            out,
            vec![Notification::Deleted(DeletedObject::Object(cm("a", "u1", "1")))]
        );
        assert!(src.store().state().is_empty());
    }

    #[test]
    fn relist_buffers_changes_and_tombstones_vanished_objects() {
        let mut src = source();
        src.apply(watcher::Event::Apply(cm("keep", "u1", "1")));
        src.apply(watcher::Event::Apply(cm("gone", "u2", "1")));

        assert!(src.apply(watcher::Event::Init).is_empty());
        assert!(src
            .apply(watcher::Event::InitApply(cm("keep", "u1", "2")))
            .is_empty());
        assert!(src
            .apply(watcher::Event::InitApply(cm("new", "u3", "1")))
            .is_empty());
        let out = src.apply(watcher::Event::InitDone);

        assert_eq!(out.len(), 3);
        assert!(out.contains(&Notification::Updated {
            old: cm("keep", "u1", "1"),
            new: cm("keep", "u1", "2"),
        }));
        assert!(out.contains(&Notification::Added(cm("new", "u3", "1"))));
        assert!(out.contains(&Notification::Deleted(DeletedObject::Tombstone {
            key: ObjectKey::namespaced("ns", "gone"),
            last_known: cm("gone", "u2", "1"),
        })));

        // Cache now reflects the re-list
        let mut names: Vec<String> = src
            .store()
            .state()
            .iter()
            .map(|o| o.metadata.name.clone().unwrap_or_default())
            .collect();
        names.sort();
        assert_eq!(names, vec!["keep", "new"]);
    }

    #[tokio::test]
    async fn run_notifications_dispatches_and_skips_errors() {
        let events = futures::stream::iter(vec![
            Ok(watcher::Event::Apply(cm("a", "u1", "1"))),
            Ok(watcher::Event::Delete(cm("a", "u1", "1"))),
        ]);
        let seen = parking_lot::Mutex::new(Vec::new());
        run_notifications(source(), events, |n| seen.lock().push(n)).await;
        assert_eq!(seen.into_inner().len(), 2);
    }
}
