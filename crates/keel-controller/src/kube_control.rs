//! kube-rs implementations of the control traits
//!
//! Reads come from the reflector store; writes go straight to the API server.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::Store;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use keel_common::{Error, OPERATOR_NAME};

use crate::apply::ApplyControl;
use crate::claim::{ClaimControl, ObjectPatch};
use crate::lister::ObjectLister;
use crate::object::ObjectKey;
use crate::prune::PruneControl;
use crate::status::StatusControl;

/// Bounds shared by every namespaced kind the kernel writes
pub trait NamespacedObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> NamespacedObject for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(OPERATOR_NAME.to_string()),
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(OPERATOR_NAME.to_string()),
        ..Default::default()
    }
}

/// Cached reads and direct writes for one namespaced kind
pub struct KubeControl<T: NamespacedObject> {
    client: Client,
    store: Store<T>,
}

impl<T: NamespacedObject> KubeControl<T> {
    /// Create a control reading from `store`
    pub fn new(client: Client, store: Store<T>) -> Self {
        Self { client, store }
    }

    fn api(&self, key: &ObjectKey) -> keel_common::Result<Api<T>> {
        let ns = key.namespace.as_deref().ok_or_else(|| {
            Error::validation(format!("{} {key} has no namespace", T::kind(&())))
        })?;
        Ok(Api::namespaced(self.client.clone(), ns))
    }
}

#[async_trait]
impl<T: NamespacedObject> ApplyControl<T> for KubeControl<T> {
    fn get_cached(&self, key: &ObjectKey) -> Option<T> {
        ObjectLister::get(&self.store, key)
    }

    async fn create(&self, obj: &T) -> keel_common::Result<T> {
        let api = self.api(&ObjectKey::from_object(obj))?;
        Ok(api.create(&post_params(), obj).await?)
    }

    async fn update(&self, obj: &T) -> keel_common::Result<T> {
        let key = ObjectKey::from_object(obj);
        let api = self.api(&key)?;
        Ok(api.replace(&key.name, &post_params(), obj).await?)
    }
}

#[async_trait]
impl<T: NamespacedObject> PruneControl for KubeControl<T> {
    async fn delete(&self, key: &ObjectKey, params: &DeleteParams) -> keel_common::Result<()> {
        self.api(key)?.delete(&key.name, params).await?;
        Ok(())
    }
}

#[async_trait]
impl<T: NamespacedObject> StatusControl for KubeControl<T> {
    async fn update_status(
        &self,
        key: &ObjectKey,
        resource_version: Option<&str>,
        status: &Value,
    ) -> keel_common::Result<()> {
        // A resourceVersion in a merge patch is a precondition on the write
        let patch = match resource_version {
            Some(rv) => json!({ "metadata": { "resourceVersion": rv }, "status": status }),
            None => json!({ "status": status }),
        };
        self.api(key)?
            .patch_status(&key.name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Uncached controller reads and child patches within one namespace
pub struct KubeClaimControl<C: NamespacedObject, T: NamespacedObject> {
    controllers: Api<C>,
    objects: Api<T>,
}

impl<C: NamespacedObject, T: NamespacedObject> KubeClaimControl<C, T> {
    /// Control for controllers and children in `namespace`
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            controllers: Api::namespaced(client.clone(), namespace),
            objects: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl<C: NamespacedObject, T: NamespacedObject> ClaimControl<C, T> for KubeClaimControl<C, T> {
    async fn get_controller_uncached(&self, name: &str) -> keel_common::Result<C> {
        Ok(self.controllers.get(name).await?)
    }

    async fn patch_object(&self, name: &str, patch: &ObjectPatch) -> keel_common::Result<T> {
        let patch = patch.clone().into_patch();
        Ok(self.objects.patch(name, &patch_params(), &patch).await?)
    }
}
