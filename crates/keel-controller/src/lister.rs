//! Read access to the shared informer cache

use kube::core::{Selector, SelectorExt};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Resource, ResourceExt};

use crate::object::ObjectKey;

/// Get-by-name and list-by-selector over a local cache
///
/// Reads never go to the API server. Returned objects are copies; the cache
/// itself is never mutated by the kernel.
pub trait ObjectLister<K>: Send + Sync {
    /// Cached object with the given key
    fn get(&self, key: &ObjectKey) -> Option<K>;

    /// Cached objects in `namespace` (all namespaces when `None`) matching `selector`
    fn list(&self, namespace: Option<&str>, selector: &Selector) -> Vec<K>;
}

impl<K> ObjectLister<K> for Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, key: &ObjectKey) -> Option<K> {
        let mut obj_ref = ObjectRef::<K>::new(&key.name);
        if let Some(ns) = &key.namespace {
            obj_ref = obj_ref.within(ns);
        }
        Store::get(self, &obj_ref).map(|arc| (*arc).clone())
    }

    fn list(&self, namespace: Option<&str>, selector: &Selector) -> Vec<K> {
        let mut objects: Vec<K> = self
            .state()
            .into_iter()
            .filter(|obj| namespace.is_none() || obj.namespace().as_deref() == namespace)
            .filter(|obj| selector.matches(obj.labels()))
            .map(|arc| (*arc).clone())
            .collect();
        objects.sort_by_key(|obj| (obj.namespace(), obj.name_any()));
        objects
    }
}
