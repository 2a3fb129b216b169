//! Object identity helpers shared by the kernel
//!
//! Everything the claim, apply and prune engines need to know about an object
//! is reachable through `kube::Resource`: name, namespace, labels, owner
//! references and deletion state. This module adds the reconcile key and the
//! controller identity written into owner references.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use keel_common::Error;

/// Stable identifier of one reconciled object
///
/// Renders as `namespace/name`, or `name` for cluster-scoped objects.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an object as stored in the cache
    pub fn from_object<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster_scoped(*name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::namespaced(*ns, *name)),
            _ => Err(Error::validation(format!("unexpected key format: {s:?}"))),
        }
    }
}

/// The controller kind, as written into owner references
///
/// Injected once at controller construction; the engines never look kinds up
/// from global state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerIdentity {
    /// `group/version` (or `version` for the core group)
    pub api_version: String,
    /// Kind name
    pub kind: String,
}

impl ControllerIdentity {
    /// Identity of a statically typed kind
    pub fn of<C: Resource<DynamicType = ()>>() -> Self {
        Self {
            api_version: C::api_version(&()).into_owned(),
            kind: C::kind(&()).into_owned(),
        }
    }

    /// API group, empty for the core group
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    /// Whether an owner reference names this kind (any version of the same group)
    pub fn matches(&self, owner: &OwnerReference) -> bool {
        let owner_group = owner
            .api_version
            .split_once('/')
            .map(|(g, _)| g)
            .unwrap_or("");
        owner.kind == self.kind && owner_group == self.group()
    }

    /// Controller reference pointing at `controller`
    ///
    /// Fails when the controller has not been persisted yet (no UID).
    pub fn controller_ref<C: Resource>(&self, controller: &C) -> keel_common::Result<OwnerReference> {
        let uid = controller.uid().ok_or_else(|| {
            Error::internal_with_context(
                "controller-ref",
                format!("{} {} has no uid", self.kind, controller.name_any()),
            )
        })?;
        Ok(OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: controller.name_any(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

/// The single owner reference flagged as controller, if any
pub fn controller_ref_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Whether the object has been marked for deletion
pub fn is_being_deleted<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}
