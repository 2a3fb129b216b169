//! In-memory stand-ins for the API server and event sink
//!
//! [`FakeApi`] plays both the informer cache and the API server for one kind,
//! with the server-side rules the kernel relies on: create conflicts, optimistic
//! concurrency on resourceVersion, UID preconditions on patch and delete, and
//! at most one controller reference per object. Every successful write is
//! counted so tests can assert how many API calls a sync made.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::DeleteParams;
use kube::core::{Selector, SelectorExt};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use keel_common::events::EventPublisher;
use keel_common::Error;

use crate::apply::ApplyControl;
use crate::claim::{ClaimControl, ObjectPatch};
use crate::lister::ObjectLister;
use crate::object::ObjectKey;
use crate::prune::PruneControl;
use crate::status::StatusControl;

/// Write verbs a [`FakeApi`] can be told to fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    /// `create`
    Create,
    /// `update`
    Update,
    /// `patch`
    Patch,
    /// `delete`
    Delete,
    /// status update
    UpdateStatus,
}

/// Successful writes per verb
#[derive(Debug, Default)]
struct Counters {
    creates: AtomicUsize,
    updates: AtomicUsize,
    patches: AtomicUsize,
    deletes: AtomicUsize,
    status_updates: AtomicUsize,
}

/// In-memory API server and cache for one kind
pub struct FakeApi<T> {
    objects: Mutex<BTreeMap<ObjectKey, T>>,
    failures: Mutex<Vec<(Verb, u16, String)>>,
    counters: Counters,
    next_version: AtomicUsize,
}

impl<T> Default for FakeApi<T> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(Vec::new()),
            counters: Counters::default(),
            next_version: AtomicUsize::new(1),
        }
    }
}

impl<T> FakeApi<T>
where
    T: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Empty fake
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store `obj` as if it had been created earlier; not counted as a write
    ///
    /// A missing UID and resourceVersion are filled in.
    pub fn seed(&self, mut obj: T) -> T {
        if obj.meta().uid.is_none() {
            obj.meta_mut().uid = Some(uuid::Uuid::new_v4().to_string());
        }
        obj.meta_mut().resource_version = Some(self.bump_version());
        self.objects
            .lock()
            .insert(ObjectKey::from_object(&obj), obj.clone());
        obj
    }

    /// Stored object for `key`
    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        self.objects.lock().get(key).cloned()
    }

    /// All stored objects, ordered by key
    pub fn all(&self) -> Vec<T> {
        self.objects.lock().values().cloned().collect()
    }

    /// Fail the next `verb` with an API status
    pub fn fail_next(&self, verb: Verb, code: u16, reason: &str) {
        self.failures.lock().push((verb, code, reason.to_string()));
    }

    /// Successful creates so far
    pub fn creates(&self) -> usize {
        self.counters.creates.load(Ordering::SeqCst)
    }

    /// Successful updates so far
    pub fn updates(&self) -> usize {
        self.counters.updates.load(Ordering::SeqCst)
    }

    /// Successful patches so far
    pub fn patches(&self) -> usize {
        self.counters.patches.load(Ordering::SeqCst)
    }

    /// Successful deletes so far
    pub fn deletes(&self) -> usize {
        self.counters.deletes.load(Ordering::SeqCst)
    }

    /// Successful status updates so far
    pub fn status_updates(&self) -> usize {
        self.counters.status_updates.load(Ordering::SeqCst)
    }

    /// Successful writes of any verb so far
    pub fn writes(&self) -> usize {
        self.creates() + self.updates() + self.patches() + self.deletes() + self.status_updates()
    }

    fn bump_version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn injected(&self, verb: Verb) -> keel_common::Result<()> {
        let mut failures = self.failures.lock();
        match failures.iter().position(|(v, _, _)| *v == verb) {
            Some(pos) => {
                let (_, code, reason) = failures.remove(pos);
                Err(Error::api_status(code, reason, format!("injected {verb:?} failure")))
            }
            None => Ok(()),
        }
    }

    fn not_found(key: &ObjectKey) -> Error {
        Error::api_status(404, "NotFound", format!("{} {key} not found", T::kind(&())))
    }

    /// Apply `patch` to the object `key` under server-side rules
    pub fn patch(&self, key: &ObjectKey, patch: &ObjectPatch) -> keel_common::Result<T> {
        self.injected(Verb::Patch)?;
        let mut objects = self.objects.lock();
        let existing = objects.get(key).ok_or_else(|| Self::not_found(key))?;

        let meta = &patch.body()["metadata"];
        if let Some(uid) = meta.get("uid").and_then(Value::as_str) {
            if existing.uid().as_deref() != Some(uid) {
                return Err(Error::api_status(
                    422,
                    "Invalid",
                    format!("Precondition failed: UID in precondition: {uid}"),
                ));
            }
        }
        if let Some(rv) = meta.get("resourceVersion").and_then(Value::as_str) {
            if existing.resource_version().as_deref() != Some(rv) {
                return Err(conflict(key));
            }
        }

        let mut value = serde_json::to_value(existing)?;
        let mut body = patch.body().clone();
        if let Some(body_meta) = body.get_mut("metadata").and_then(Value::as_object_mut) {
            body_meta.remove("uid");
            body_meta.remove("resourceVersion");
        }
        match patch {
            ObjectPatch::Merge(_) => json_merge(&mut value, &body),
            ObjectPatch::Strategic(_) => strategic_merge(&mut value, body),
        }

        let mut updated: T = serde_json::from_value(value)?;
        if updated
            .owner_references()
            .iter()
            .filter(|r| r.controller == Some(true))
            .count()
            > 1
        {
            return Err(Error::api_status(
                422,
                "Invalid",
                "Only one reference can have Controller set to true",
            ));
        }
        updated.meta_mut().resource_version = Some(self.bump_version());
        objects.insert(key.clone(), updated.clone());
        self.counters.patches.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

fn conflict(key: &ObjectKey) -> Error {
    Error::api_status(
        409,
        "Conflict",
        format!("Operation cannot be fulfilled on {key}: the object has been modified"),
    )
}

/// RFC 7386 merge
fn json_merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (k, v) in patch {
            if v.is_null() {
                target.remove(k);
            } else {
                json_merge(target.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

/// JSON merge, except owner references merge by UID and honor `$patch: delete`
fn strategic_merge(target: &mut Value, mut patch: Value) {
    let refs_patch = patch
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .and_then(|m| m.remove("ownerReferences"));
    json_merge(target, &patch);

    let Some(Value::Array(entries)) = refs_patch else {
        return;
    };
    let Some(meta) = target.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    let mut refs = match meta.remove("ownerReferences") {
        Some(Value::Array(refs)) => refs,
        _ => Vec::new(),
    };
    for entry in entries {
        let uid = entry.get("uid").cloned();
        if entry.get("$patch").and_then(Value::as_str) == Some("delete") {
            refs.retain(|r| r.get("uid") != uid.as_ref());
        } else if let Some(existing) = refs.iter_mut().find(|r| r.get("uid") == uid.as_ref()) {
            json_merge(existing, &entry);
        } else {
            refs.push(entry);
        }
    }
    if !refs.is_empty() {
        meta.insert("ownerReferences".to_string(), Value::Array(refs));
    }
}

impl<T> ObjectLister<T> for FakeApi<T>
where
    T: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn get(&self, key: &ObjectKey) -> Option<T> {
        FakeApi::get(self, key)
    }

    fn list(&self, namespace: Option<&str>, selector: &Selector) -> Vec<T> {
        self.objects
            .lock()
            .values()
            .filter(|obj| namespace.is_none() || obj.namespace().as_deref() == namespace)
            .filter(|obj| selector.matches(obj.labels()))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl<T> ApplyControl<T> for FakeApi<T>
where
    T: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn get_cached(&self, key: &ObjectKey) -> Option<T> {
        FakeApi::get(self, key)
    }

    async fn create(&self, obj: &T) -> keel_common::Result<T> {
        self.injected(Verb::Create)?;
        let key = ObjectKey::from_object(obj);
        if self.objects.lock().contains_key(&key) {
            return Err(Error::api_status(
                409,
                "AlreadyExists",
                format!("{} {key} already exists", T::kind(&())),
            ));
        }
        let mut created = obj.clone();
        created.meta_mut().uid = Some(uuid::Uuid::new_v4().to_string());
        created.meta_mut().resource_version = Some(self.bump_version());
        self.objects.lock().insert(key, created.clone());
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn update(&self, obj: &T) -> keel_common::Result<T> {
        self.injected(Verb::Update)?;
        let key = ObjectKey::from_object(obj);
        let mut objects = self.objects.lock();
        let existing = objects.get(&key).ok_or_else(|| Self::not_found(&key))?;
        if let Some(rv) = obj.meta().resource_version.as_deref() {
            if existing.resource_version().as_deref() != Some(rv) {
                return Err(conflict(&key));
            }
        }
        let mut updated = obj.clone();
        updated.meta_mut().uid = existing.uid();
        updated.meta_mut().resource_version = Some(self.bump_version());
        objects.insert(key, updated.clone());
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

#[async_trait]
impl<T> PruneControl for FakeApi<T>
where
    T: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn delete(&self, key: &ObjectKey, params: &DeleteParams) -> keel_common::Result<()> {
        self.injected(Verb::Delete)?;
        let mut objects = self.objects.lock();
        let existing = objects.get(key).ok_or_else(|| Self::not_found(key))?;
        if let Some(uid) = params.preconditions.as_ref().and_then(|p| p.uid.as_deref()) {
            if existing.uid().as_deref() != Some(uid) {
                return Err(Error::api_status(
                    409,
                    "Conflict",
                    format!("Precondition failed: UID in precondition: {uid}"),
                ));
            }
        }
        objects.remove(key);
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl<T> StatusControl for FakeApi<T>
where
    T: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn update_status(
        &self,
        key: &ObjectKey,
        resource_version: Option<&str>,
        status: &Value,
    ) -> keel_common::Result<()> {
        self.injected(Verb::UpdateStatus)?;
        let mut objects = self.objects.lock();
        let existing = objects.get(key).ok_or_else(|| Self::not_found(key))?;
        if let Some(rv) = resource_version {
            if existing.resource_version().as_deref() != Some(rv) {
                return Err(conflict(key));
            }
        }
        let mut value = serde_json::to_value(existing)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("status".to_string(), status.clone());
        }
        let mut updated: T = serde_json::from_value(value)?;
        updated.meta_mut().resource_version = Some(self.bump_version());
        objects.insert(key.clone(), updated);
        self.counters.status_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// [`ClaimControl`] over two fakes, scoped to one namespace
pub struct FakeClaimControl<C, T> {
    controllers: Arc<FakeApi<C>>,
    objects: Arc<FakeApi<T>>,
    namespace: String,
}

impl<C, T> FakeClaimControl<C, T> {
    /// Claim control for `namespace`
    pub fn new(controllers: Arc<FakeApi<C>>, objects: Arc<FakeApi<T>>, namespace: &str) -> Self {
        Self {
            controllers,
            objects,
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl<C, T> ClaimControl<C, T> for FakeClaimControl<C, T>
where
    C: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    T: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get_controller_uncached(&self, name: &str) -> keel_common::Result<C> {
        let key = ObjectKey::namespaced(&self.namespace, name);
        self.controllers
            .get(&key)
            .ok_or_else(|| FakeApi::<C>::not_found(&key))
    }

    async fn patch_object(&self, name: &str, patch: &ObjectPatch) -> keel_common::Result<T> {
        self.objects
            .patch(&ObjectKey::namespaced(&self.namespace, name), patch)
    }
}

/// One published event
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Object the event is about
    pub object: ObjectReference,
    /// Normal or Warning
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event action
    pub action: String,
    /// Event note
    pub note: Option<String>,
}

/// Event publisher that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// All events in publish order
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Reasons of all events in publish order
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(RecordedEvent {
            object: resource_ref.clone(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}
