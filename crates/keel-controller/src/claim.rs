//! Ownership claims over candidate child objects
//!
//! A controller only manages children that carry its controller reference.
//! Before a sync computes anything it sorts the candidate set:
//!
//! - owned and still selected: kept
//! - owned but no longer selected: released (reference stripped)
//! - orphaned and selected: adopted (reference added)
//! - controlled by someone else: left alone
//!
//! Adoption and release are UID-preconditioned patches, so a concurrent owner
//! change or recreate makes the patch fail instead of clobbering. Such a lost
//! race means "not mine" and is not reported as an error.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use kube::api::Patch;
use kube::core::{Selector, SelectorExt};
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use keel_common::Error;

use crate::lister::ObjectLister;
use crate::object::{controller_ref_of, is_being_deleted, ControllerIdentity};

/// Remote operations needed to claim children of kind `T` for a controller of kind `C`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClaimControl<C, T>: Send + Sync
where
    C: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// Read the controller from the API server, bypassing the cache
    async fn get_controller_uncached(&self, name: &str) -> keel_common::Result<C>;

    /// Patch the child `name` in the controller's namespace
    async fn patch_object(&self, name: &str, patch: &ObjectPatch) -> keel_common::Result<T>;
}

/// How ownership patches are encoded for a kind
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PatchEncoding {
    /// Strategic merge; owner references merge by UID (built-in kinds)
    #[default]
    StrategicMerge,
    /// JSON merge; lists are replaced wholesale (custom resources)
    JsonMerge,
}

/// Ownership patch body with its encoding
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectPatch {
    /// Strategic merge patch
    Strategic(Value),
    /// JSON merge patch
    Merge(Value),
}

impl ObjectPatch {
    /// Patch body
    pub fn body(&self) -> &Value {
        match self {
            ObjectPatch::Strategic(v) | ObjectPatch::Merge(v) => v,
        }
    }

    /// Encoding of this patch
    pub fn encoding(&self) -> PatchEncoding {
        match self {
            ObjectPatch::Strategic(_) => PatchEncoding::StrategicMerge,
            ObjectPatch::Merge(_) => PatchEncoding::JsonMerge,
        }
    }

    /// Convert into the kube-rs patch type
    pub fn into_patch(self) -> Patch<Value> {
        match self {
            ObjectPatch::Strategic(v) => Patch::Strategic(v),
            ObjectPatch::Merge(v) => Patch::Merge(v),
        }
    }
}

/// Sorts candidate children of one controller object into owned and not owned
pub struct ControllerRefManager<'a, C, T>
where
    C: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    controller: &'a C,
    identity: ControllerIdentity,
    selector: Selector,
    control: &'a dyn ClaimControl<C, T>,
    encoding: PatchEncoding,
    /// Set once a fresh read confirmed the controller may adopt
    adoption_confirmed: bool,
}

impl<'a, C, T> ControllerRefManager<'a, C, T>
where
    C: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
    T: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    /// Manager for `controller`'s children selected by `selector`
    pub fn new(
        controller: &'a C,
        identity: ControllerIdentity,
        selector: Selector,
        control: &'a dyn ClaimControl<C, T>,
    ) -> Self {
        Self {
            controller,
            identity,
            selector,
            control,
            encoding: PatchEncoding::default(),
            adoption_confirmed: false,
        }
    }

    /// Use `encoding` for adopt and release patches
    pub fn with_encoding(mut self, encoding: PatchEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Claim the candidates this controller owns, keyed by name
    ///
    /// Every candidate is processed; failures are collected and returned as
    /// one error after the pass.
    pub async fn claim_objects(
        &mut self,
        candidates: Vec<T>,
    ) -> keel_common::Result<BTreeMap<String, T>> {
        let mut claimed = BTreeMap::new();
        let mut errors = Vec::new();

        for obj in candidates {
            match self.claim_object(obj).await {
                Ok(Some(obj)) => {
                    claimed.insert(obj.name_any(), obj);
                }
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }

        Error::aggregate(errors)?;
        Ok(claimed)
    }

    async fn claim_object(&mut self, obj: T) -> keel_common::Result<Option<T>> {
        let controller_uid = self.controller.uid();

        if let Some(owner) = controller_ref_of(&obj) {
            if Some(owner.uid.as_str()) != controller_uid.as_deref() {
                return Ok(None);
            }
            if self.selector.matches(obj.labels()) {
                return Ok(Some(obj));
            }
            if is_being_deleted(self.controller) {
                return Ok(None);
            }
            return match self.release(&obj).await {
                Err(e) if e.is_not_found() || e.is_invalid() => {
                    debug!(object = %obj.name_any(), error = %e, "Release lost a race, ignoring");
                    Ok(None)
                }
                Err(e) => Err(e),
                Ok(()) => Ok(None),
            };
        }

        if is_being_deleted(self.controller) || !self.selector.matches(obj.labels()) {
            return Ok(None);
        }
        if is_being_deleted(&obj) {
            return Ok(None);
        }
        if let Some(ns) = self.controller.namespace() {
            if obj.namespace().as_deref() != Some(ns.as_str()) {
                return Ok(None);
            }
        }

        match self.adopt(&obj).await {
            Ok(adopted) => Ok(Some(adopted)),
            Err(e) if e.is_not_found() || e.is_conflict() || e.is_invalid() => {
                debug!(object = %obj.name_any(), error = %e, "Adoption lost a race, ignoring");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Confirm with a fresh read that the controller still exists and is not being deleted
    async fn can_adopt(&mut self) -> keel_common::Result<()> {
        if self.adoption_confirmed {
            return Ok(());
        }

        let name = self.controller.name_any();
        let fresh = self.control.get_controller_uncached(&name).await?;
        if fresh.uid() != self.controller.uid() {
            return Err(Error::internal_with_context(
                "claim",
                format!(
                    "original {} {name} is gone: got uid {:?}, wanted {:?}",
                    self.identity.kind,
                    fresh.uid(),
                    self.controller.uid()
                ),
            ));
        }
        if is_being_deleted(&fresh) {
            return Err(Error::internal_with_context(
                "claim",
                format!("{} {name} has just been deleted", self.identity.kind),
            ));
        }

        self.adoption_confirmed = true;
        Ok(())
    }

    async fn adopt(&mut self, obj: &T) -> keel_common::Result<T> {
        self.can_adopt().await?;

        let patch = self.adopt_patch(obj)?;
        info!(
            kind = %T::kind(&()),
            object = %obj.name_any(),
            controller = %self.controller.name_any(),
            "Adopting orphaned object"
        );
        self.control.patch_object(&obj.name_any(), &patch).await
    }

    async fn release(&self, obj: &T) -> keel_common::Result<()> {
        let patch = self.release_patch(obj)?;
        info!(
            kind = %T::kind(&()),
            object = %obj.name_any(),
            controller = %self.controller.name_any(),
            "Releasing object no longer selected"
        );
        self.control.patch_object(&obj.name_any(), &patch).await?;
        Ok(())
    }

    fn adopt_patch(&self, obj: &T) -> keel_common::Result<ObjectPatch> {
        let uid = child_uid(obj)?;
        let owner = self.identity.controller_ref(self.controller)?;
        Ok(match self.encoding {
            PatchEncoding::StrategicMerge => ObjectPatch::Strategic(json!({
                "metadata": {
                    "ownerReferences": [owner],
                    "uid": uid,
                }
            })),
            PatchEncoding::JsonMerge => {
                let mut refs = obj.owner_references().to_vec();
                refs.push(owner);
                ObjectPatch::Merge(json!({
                    "metadata": {
                        "ownerReferences": refs,
                        "uid": uid,
                        "resourceVersion": obj.resource_version(),
                    }
                }))
            }
        })
    }

    fn release_patch(&self, obj: &T) -> keel_common::Result<ObjectPatch> {
        let uid = child_uid(obj)?;
        let controller_uid = self.controller.uid().unwrap_or_default();
        Ok(match self.encoding {
            PatchEncoding::StrategicMerge => ObjectPatch::Strategic(json!({
                "metadata": {
                    "ownerReferences": [{ "$patch": "delete", "uid": controller_uid }],
                    "uid": uid,
                }
            })),
            PatchEncoding::JsonMerge => {
                let remaining: Vec<_> = obj
                    .owner_references()
                    .iter()
                    .filter(|r| r.uid != controller_uid)
                    .cloned()
                    .collect();
                let refs = if remaining.is_empty() {
                    Value::Null
                } else {
                    serde_json::to_value(remaining)?
                };
                ObjectPatch::Merge(json!({
                    "metadata": {
                        "ownerReferences": refs,
                        "uid": uid,
                        "resourceVersion": obj.resource_version(),
                    }
                }))
            }
        })
    }
}

fn child_uid<T: Resource>(obj: &T) -> keel_common::Result<String> {
    obj.uid().ok_or_else(|| {
        Error::internal_with_context("claim", format!("{} has no uid", obj.name_any()))
    })
}

/// List every cached candidate in the controller's namespace and claim them
pub async fn get_objects<C, T>(
    manager: &mut ControllerRefManager<'_, C, T>,
    lister: &dyn ObjectLister<T>,
) -> keel_common::Result<BTreeMap<String, T>>
where
    C: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
    T: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    get_objects_with_filter(manager, lister, |_| true).await
}

/// [`get_objects`] restricted to candidates passing `filter`
///
/// Candidates are listed with an everything selector so that owned objects
/// which stopped matching the manager's selector are still seen and released.
pub async fn get_objects_with_filter<C, T, F>(
    manager: &mut ControllerRefManager<'_, C, T>,
    lister: &dyn ObjectLister<T>,
    filter: F,
) -> keel_common::Result<BTreeMap<String, T>>
where
    C: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
    T: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
    F: Fn(&T) -> bool,
{
    let namespace = manager.controller.namespace();
    let candidates: Vec<T> = lister
        .list(namespace.as_deref(), &Selector::default())
        .into_iter()
        .filter(|obj| filter(obj))
        .collect();
    manager.claim_objects(candidates).await
}
